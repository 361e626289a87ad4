use super::client::{self, ChatRequest, to_onebot_file};
use super::error::GenerationError;
use super::extract::MediaSet;
use super::keys::{FailurePolicy, KeyStore};
use super::queue::QueuedJob;
use super::stream::GenerationResult;
use crate::message::Message;
use crate::plugins::PluginError;
use crate::{debug, info, warn};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationKind {
    Image,
    Video,
}

impl GenerationKind {
    pub fn noun(self) -> &'static str {
        match self {
            GenerationKind::Image => "图片",
            GenerationKind::Video => "视频",
        }
    }
}

/// 一次生成所需的全部参数
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub kind: GenerationKind,
    pub model: String,
    pub prompt: String,
    /// 输入图片地址，执行时下载并内联
    pub images: Vec<String>,
    pub preset: Option<String>,
    pub api_url: String,
    pub use_stream: bool,
    pub policy: FailurePolicy,
    /// 输入图片来自被引用的消息
    pub from_reply: bool,
    pub started: Instant,
}

/// 生成结束后交给回复端的内容
pub struct Delivery {
    pub kind: GenerationKind,
    pub model: String,
    pub preset: Option<String>,
    pub from_reply: bool,
    pub elapsed: Duration,
    pub result: GenerationResult,
}

/// 结果回复端，由发起命令的会话实现
pub trait ReplySink: Send + Sync {
    fn notify(&self, text: String) -> BoxFuture<'static, Result<(), PluginError>>;
    fn deliver(&self, delivery: Delivery) -> BoxFuture<'static, Result<(), PluginError>>;
}

pub struct GenerationJob {
    pub label: String,
    pub request: GenerationRequest,
    pub sink: Arc<dyn ReplySink>,
}

impl QueuedJob for GenerationJob {
    fn label(&self) -> &str {
        &self.label
    }
}

/// 执行一个出队的任务: 取密钥、请求、记账、回复
pub async fn execute(job: GenerationJob, keys: Arc<KeyStore>) -> Result<(), PluginError> {
    let GenerationJob {
        label,
        request,
        sink,
    } = job;

    let images = inline_images(&request.images, sink.as_ref()).await;
    let result = request_media(&request, &images, &keys).await;
    let elapsed = request.started.elapsed();
    match &result {
        Ok(media) => info!(
            target: "Banana",
            "[{}] 生成完成，{} 个结果，用时 {:.2}s",
            label,
            media.len(),
            elapsed.as_secs_f64()
        ),
        Err(e) => warn!(target: "Banana", "[{}] 生成失败: {}", label, e),
    }

    sink.deliver(Delivery {
        kind: request.kind,
        model: request.model,
        preset: request.preset,
        from_reply: request.from_reply,
        elapsed,
        result,
    })
    .await
}

/// 下载输入图片；全部失败时提醒请求者并退回纯文本生成
async fn inline_images(urls: &[String], sink: &dyn ReplySink) -> Vec<String> {
    if urls.is_empty() {
        return Vec::new();
    }

    let mut inlined = Vec::new();
    let mut errors = Vec::new();
    for (i, url) in urls.iter().enumerate() {
        match client::download_as_data_uri(url).await {
            Ok(data) => inlined.push(data),
            Err(e) => errors.push(format!("图片{}: {:#}", i + 1, e)),
        }
    }

    if inlined.is_empty() {
        let text = format!(
            "⚠️ 图片处理失败: 所有图片转换失败:\n{}\n将继续进行文本生成...",
            errors.join("\n")
        );
        if let Err(e) = sink.notify(text).await {
            warn!(target: "Banana", "发送图片失败提示出错: {}", e);
        }
    } else {
        debug!(target: "Banana", "成功转换 {} 张图片", inlined.len());
    }
    inlined
}

async fn request_media(
    request: &GenerationRequest,
    images: &[String],
    keys: &KeyStore,
) -> GenerationResult {
    if request.api_url.trim().is_empty() {
        return Err(GenerationError::NotConfigured);
    }
    let key = keys.acquire().await?;

    let body = ChatRequest::new(
        &request.model,
        &request.prompt,
        images,
        request.use_stream,
    );
    let result = client::generate(&request.api_url, &key, &body).await;

    let (success, message) = match &result {
        Ok(_) => (true, String::new()),
        Err(e) => (false, e.to_string()),
    };
    if let Err(e) = keys
        .report_outcome(&key, success, &message, request.policy)
        .await
    {
        warn!(target: "Banana", "记录密钥状态失败: {}", e);
    }
    result
}

// ================== 回复格式 ==================

/// 成功回复: 在 `msg` 之后追加媒体段与摘要
pub fn format_success(
    mut msg: Message,
    media: &MediaSet,
    kind: GenerationKind,
    model: &str,
    preset: Option<&str>,
    elapsed: Duration,
) -> Message {
    for url in &media.images {
        msg = msg.image(to_onebot_file(url));
    }
    for url in &media.videos {
        msg = msg.video(to_onebot_file(url));
    }

    let mut summary = format!(
        "\n✅ {}生成完成（{:.2}s）\n🤖 模型: {}",
        kind.noun(),
        elapsed.as_secs_f64(),
        model
    );
    if let Some(name) = preset {
        summary.push_str(&format!("\n🎯 预设: {}", name));
    }
    if media.images.len() > 1 {
        summary.push_str(&format!("\n📷 共 {} 张图片", media.images.len()));
    }
    if media.videos.len() > 1 {
        summary.push_str(&format!("\n🎬 共 {} 个视频", media.videos.len()));
    }
    msg.text(summary)
}

/// 失败回复: 用时、错误、可选的处理建议
pub fn format_failure(err: &GenerationError, elapsed: Duration) -> String {
    let mut text = format!(
        "❌ 生成失败（{:.2}s）\n错误: {}",
        elapsed.as_secs_f64(),
        err
    );
    if let Some(hint) = err.hint() {
        text.push_str(&format!("\n\n💡 建议: {}", hint.advice()));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::super::test_server::{full_response, serve_once};
    use super::*;
    use crate::plugins::banana::error::TransportHint;
    use simd_json::base::ValueAsArray;
    use simd_json::derived::{ValueObjectAccess, ValueObjectAccessAsScalar};

    #[test]
    fn success_summary_lists_preset_and_count() {
        let media = MediaSet {
            images: vec![
                "https://x/1.png".to_string(),
                "data:image/png;base64,QQ==".to_string(),
            ],
            videos: Vec::new(),
        };
        let msg = format_success(
            Message::new(),
            &media,
            GenerationKind::Image,
            "gemini",
            Some("手办"),
            Duration::from_millis(1500),
        );
        let segs = msg.segments();
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].type_, "image");
        assert_eq!(segs[2].type_, "text");

        let arr = msg.clone().into_value().as_array().cloned().unwrap_or_default();
        let text = arr[2]
            .get("data")
            .and_then(|d| d.get_str("text"))
            .unwrap_or_default();
        assert!(text.contains("图片生成完成（1.50s）"));
        assert!(text.contains("🎯 预设: 手办"));
        assert!(text.contains("📷 共 2 张图片"));
        assert_eq!(
            arr[1].get("data").and_then(|d| d.get_str("file")),
            Some("base64://QQ==")
        );
    }

    #[test]
    fn failure_text_includes_advice() {
        let err = GenerationError::Transport {
            message: "connection reset".into(),
            hint: Some(TransportHint::Retry),
        };
        let text = format_failure(&err, Duration::from_secs(2));
        assert!(text.starts_with("❌ 生成失败（2.00s）\n错误: 请求错误: connection reset"));
        assert!(text.contains("💡 建议:"));

        let text = format_failure(&GenerationError::NoContent, Duration::from_secs(1));
        assert!(!text.contains("💡"));
    }

    fn buffered_request(api_url: String) -> GenerationRequest {
        GenerationRequest {
            kind: GenerationKind::Image,
            model: "m".into(),
            prompt: "画猫".into(),
            images: Vec::new(),
            preset: None,
            api_url,
            use_stream: false,
            policy: FailurePolicy {
                disable_on_error: true,
                daily_fail_threshold: 10,
            },
            from_reply: false,
            started: Instant::now(),
        }
    }

    async fn store_with_key() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyStore::new(dir.path().join("keys.json"));
        assert!(keys.add_key("k1", "10001").await.unwrap());
        (dir, keys)
    }

    #[tokio::test]
    async fn each_outcome_is_recorded_against_the_key() {
        let (_dir, keys) = store_with_key().await;

        let url = serve_once(vec![full_response(
            "200 OK",
            "application/json",
            r#"{"choices":[{"message":{"content":"https://x/ok.png"}}]}"#,
        )])
        .await;
        let media = request_media(&buffered_request(url), &[], &keys)
            .await
            .unwrap();
        assert_eq!(media.images, vec!["https://x/ok.png"]);

        let url = serve_once(vec![full_response(
            "500 Internal Server Error",
            "text/plain",
            "oops",
        )])
        .await;
        let err = request_media(&buffered_request(url), &[], &keys)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "HTTP 500: oops");

        let file = keys.snapshot().await.unwrap();
        assert_eq!(file.statistics.total_requests, 2);
        assert_eq!(file.statistics.successful_requests, 1);
        assert_eq!(file.statistics.failed_requests, 1);
        assert_eq!(file.keys[0].usage_count, 2);
        assert_eq!(file.keys[0].today_failed, 1);
        assert_eq!(file.keys[0].error_count, 1);
        assert!(file.keys[0].is_active());
    }

    #[tokio::test]
    async fn unconfigured_endpoint_does_not_touch_keys() {
        let (_dir, keys) = store_with_key().await;
        let err = request_media(&buffered_request(String::new()), &[], &keys)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::NotConfigured));
        assert_eq!(keys.snapshot().await.unwrap().statistics.total_requests, 0);
    }
}
