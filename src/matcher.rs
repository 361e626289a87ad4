use crate::event::Event;
use simd_json::derived::ValueObjectAccessAsScalar;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, oneshot};

/// API 响应匹配器：按 echo 将 OneBot 的响应帧交还给发起调用的任务
pub struct Matcher {
    waiters: AsyncMutex<HashMap<String, oneshot::Sender<Event>>>,
}

impl Matcher {
    pub fn new() -> Self {
        Self {
            waiters: AsyncMutex::new(HashMap::new()),
        }
    }

    /// 注册一个响应等待者，超时或连接断开时返回 None
    pub async fn wait_resp(&self, echo: String, timeout_duration: Duration) -> Option<Event> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(echo.clone(), tx);

        let result = tokio::time::timeout(timeout_duration, rx).await;
        match result {
            Ok(Ok(event)) => Some(event),
            _ => {
                // 超时后清理残留的等待者
                self.waiters.lock().await.remove(&echo);
                None
            }
        }
    }

    /// 尝试分发事件给等待者。如果事件被消费，返回 None；否则返回原事件。
    pub async fn dispatch(&self, event: Event) -> Option<Event> {
        let echo = match event.get_str("echo") {
            Some(e) => e.to_string(),
            None => return Some(event),
        };

        let waiter = self.waiters.lock().await.remove(&echo);
        match waiter {
            Some(sender) => {
                // 等待者可能已超时，忽略发送失败
                let _ = sender.send(event);
                None
            }
            None => Some(event),
        }
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    impl Matcher {
        async fn pending(&self) -> usize {
            self.waiters.lock().await.len()
        }
    }

    #[tokio::test]
    async fn response_is_routed_by_echo() {
        let matcher = Arc::new(Matcher::new());
        let waiting = {
            let m = matcher.clone();
            tokio::spawn(async move { m.wait_resp("api-req-7".into(), Duration::from_secs(2)).await })
        };

        // 等待注册完成
        while matcher.pending().await == 0 {
            tokio::task::yield_now().await;
        }

        let unrelated: Event = simd_json::json!({"post_type": "message"}).into();
        assert!(matcher.dispatch(unrelated).await.is_some());

        let resp: Event = simd_json::json!({"echo": "api-req-7", "retcode": 0}).into();
        assert!(matcher.dispatch(resp).await.is_none());

        let got = waiting.await.unwrap().unwrap();
        assert_eq!(got.get_str("echo"), Some("api-req-7"));
    }

    #[tokio::test]
    async fn timed_out_waiter_is_cleared() {
        let matcher = Matcher::new();
        let got = matcher
            .wait_resp("never".into(), Duration::from_millis(10))
            .await;
        assert!(got.is_none());
        assert_eq!(matcher.pending().await, 0);
    }
}
