use crate::{debug, info};
use chrono::{DateTime, Local, TimeZone};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::AbortHandle;

/// 全局定时任务管理器
pub struct Scheduler {
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// 添加一个灵活调度任务
    ///
    /// - `next_run`: 接收当前时间，返回下一次执行时间；返回 None 时任务结束
    /// - `task_gen`: 每次触发时生成一个 Future
    pub fn add_schedule<C, F, Fut>(&self, name: &str, mut next_run: C, mut task_gen: F)
    where
        C: FnMut(DateTime<Local>) -> Option<DateTime<Local>> + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut next_time = next_run(Local::now());
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            while let Some(target_time) = next_time {
                let now = Local::now();
                if target_time > now {
                    let wait = (target_time - now).to_std().unwrap_or(Duration::ZERO);
                    tokio::time::sleep(wait).await;
                }

                debug!(target: "Scheduler", "执行定时任务 [{}]", task_name);
                task_gen().await;

                next_time = next_run(Local::now());
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle.abort_handle());
        }
    }

    /// 每天特定时间执行 (HH:MM:SS)
    pub fn add_daily_at<F, Fut>(
        &self,
        name: &str,
        hour: u32,
        minute: u32,
        second: u32,
        task_gen: F,
    )
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        info!(
            target: "Scheduler",
            "注册每日任务 [{}] {:02}:{:02}:{:02}",
            name, hour, minute, second
        );
        self.add_schedule(
            name,
            move |now| next_daily(now, hour, minute, second),
            task_gen,
        )
    }

    pub fn shutdown(&self) {
        info!(target: "Scheduler", "正在清理定时任务...");
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// 计算下一次 HH:MM:SS；今天已过 (或当天该时刻无效) 时顺延到明天
pub fn next_daily(
    now: DateTime<Local>,
    hour: u32,
    minute: u32,
    second: u32,
) -> Option<DateTime<Local>> {
    let today = now.date_naive();
    let target_today = today
        .and_hms_opt(hour, minute, second)
        .and_then(|t| Local.from_local_datetime(&t).single());

    if let Some(target) = target_today
        && target > now
    {
        return Some(target);
    }

    today
        .succ_opt()?
        .and_hms_opt(hour, minute, second)
        .and_then(|t| Local.from_local_datetime(&t).single())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn daily_target_rolls_to_tomorrow_once_passed() {
        let now = Local.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();

        let later = next_daily(now, 23, 0, 0).unwrap();
        assert_eq!(later.date_naive(), now.date_naive());
        assert_eq!(later.hour(), 23);

        let passed = next_daily(now, 0, 8, 0).unwrap();
        assert_eq!(passed.date_naive(), now.date_naive().succ_opt().unwrap());
        assert_eq!((passed.hour(), passed.minute()), (0, 8));
    }

    #[tokio::test]
    async fn shutdown_aborts_registered_tasks() {
        let scheduler = Scheduler::new();
        scheduler.add_daily_at("reset", 0, 8, 0, || async {});
        scheduler.add_daily_at("report", 12, 0, 0, || async {});
        assert_eq!(scheduler.tasks.lock().unwrap().len(), 2);

        scheduler.shutdown();
        assert!(scheduler.tasks.lock().unwrap().is_empty());
    }
}
