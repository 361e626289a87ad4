use super::error::GenerationError;
use super::stream::{GenerationResult, StreamAggregator, parse_buffered};
use anyhow::{Context as _, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::timeout;

pub const STREAM_TIMEOUT: Duration = Duration::from_secs(120);
pub const BUFFERED_TIMEOUT: Duration = Duration::from_secs(180);
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// 既无提示词也无输入图片时的兜底提示词
pub const DEFAULT_PROMPT: &str = "生成一个有趣的图片";

/// 错误响应体只保留前若干字符
const ERROR_BODY_LIMIT: usize = 500;

fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        let builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
        #[cfg(test)]
        let builder = builder.no_proxy();
        builder.build().unwrap_or_default()
    })
}

// ================== 请求体 ==================

#[derive(Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ChatRequest {
    /// 单条 user 消息: 先文本，后输入图片
    pub fn new(model: &str, prompt: &str, images: &[String], stream: bool) -> Self {
        let mut content = Vec::new();
        if !prompt.trim().is_empty() {
            content.push(ContentPart::Text {
                text: prompt.to_string(),
            });
        }
        content.extend(images.iter().map(|url| ContentPart::ImageUrl {
            image_url: ImageUrl { url: url.clone() },
        }));
        if content.is_empty() {
            content.push(ContentPart::Text {
                text: DEFAULT_PROMPT.to_string(),
            });
        }
        Self {
            model: model.to_string(),
            messages: vec![ChatMessage {
                role: "user",
                content,
            }],
            stream,
        }
    }
}

// ================== 生成 ==================

/// 发送生成请求并折叠为结果。超时只针对空闲: 任意两次收到数据的间隔不得超过上限。
pub async fn generate(api_url: &str, api_key: &str, request: &ChatRequest) -> GenerationResult {
    let idle = if request.stream {
        STREAM_TIMEOUT
    } else {
        BUFFERED_TIMEOUT
    };
    generate_within(api_url, api_key, request, idle).await
}

async fn generate_within(
    api_url: &str,
    api_key: &str,
    request: &ChatRequest,
    idle: Duration,
) -> GenerationResult {
    let timed_out = || GenerationError::Timeout(idle.as_millis() as u64);
    let body = serde_json::to_vec(request).map_err(|e| GenerationError::Parse(e.to_string()))?;

    let pending = http_client()
        .post(api_url)
        .header(AUTHORIZATION, format!("Bearer {}", api_key))
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send();
    let resp = match timeout(idle, pending).await {
        Ok(resp) => resp.map_err(|e| GenerationError::from_transport(&e))?,
        Err(_) => return Err(timed_out()),
    };

    let status = resp.status();
    if !status.is_success() {
        let text = timeout(idle, resp.text())
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();
        let body: String = text.chars().take(ERROR_BODY_LIMIT).collect();
        return Err(GenerationError::Http {
            status: status.as_u16(),
            body,
        });
    }

    let mut chunks = resp.bytes_stream();
    if request.stream {
        let mut aggregator = StreamAggregator::new();
        loop {
            match timeout(idle, chunks.next()).await {
                Err(_) => return aggregator.fail(timed_out()),
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    return aggregator.fail(GenerationError::Stream(e.to_string()));
                }
                Ok(Some(Ok(bytes))) => {
                    aggregator.push(&bytes);
                    if aggregator.is_resolved() {
                        break;
                    }
                }
            }
        }
        aggregator.finish()
    } else {
        let mut body = Vec::new();
        loop {
            match timeout(idle, chunks.next()).await {
                Err(_) => return Err(timed_out()),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(GenerationError::Stream(e.to_string())),
                Ok(Some(Ok(bytes))) => body.extend_from_slice(&bytes),
            }
        }
        parse_buffered(&body)
    }
}

// ================== 输入图片 ==================

/// 根据 Content-Type 或扩展名推断图片 MIME
pub fn guess_mime(content_type: Option<&str>, url: &str) -> String {
    if let Some(ct) = content_type {
        let ct = ct.split(';').next().unwrap_or(ct).trim();
        if ct.starts_with("image/") {
            return ct.to_string();
        }
    }
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    let mime = if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else {
        "image/jpeg"
    };
    mime.to_string()
}

/// 下载图片并转为 `data:<mime>;base64,...`
pub async fn download_as_data_uri(url: &str) -> Result<String> {
    let resp = http_client()
        .get(url)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await
        .with_context(|| format!("下载失败: {}", url))?;

    if !resp.status().is_success() {
        bail!("HTTP {}", resp.status().as_u16());
    }

    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let bytes = resp.bytes().await.context("读取图片数据失败")?;
    if bytes.is_empty() {
        bail!("图片内容为空");
    }

    let mime = guess_mime(content_type.as_deref(), url);
    Ok(format!("data:{};base64,{}", mime, STANDARD.encode(&bytes)))
}

/// OneBot 不接受 data URI，转成 `base64://`
pub fn to_onebot_file(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("data:")
        && let Some((_, payload)) = rest.split_once(";base64,")
    {
        return format!("base64://{}", payload);
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::super::test_server::{SSE_HEAD, after, full_response, now, serve_once};
    use super::*;

    const IMAGE_FRAME: &str =
        "data: {\"choices\":[{\"delta\":{\"image_url\":{\"url\":\"https://x/a.png\"}}}]}\n";

    fn stream_request() -> ChatRequest {
        ChatRequest::new("m", "画猫", &[], true)
    }

    #[test]
    fn request_body_shape() {
        let req = ChatRequest::new("m", "画猫", &["data:image/png;base64,AA".to_string()], true);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["model"], "m");
        assert_eq!(v["stream"], true);
        assert_eq!(v["messages"][0]["role"], "user");
        assert_eq!(v["messages"][0]["content"][0]["type"], "text");
        assert_eq!(v["messages"][0]["content"][0]["text"], "画猫");
        assert_eq!(
            v["messages"][0]["content"][1]["image_url"]["url"],
            "data:image/png;base64,AA"
        );
    }

    #[test]
    fn empty_request_gets_default_prompt() {
        let v = serde_json::to_value(ChatRequest::new("m", "  ", &[], false)).unwrap();
        assert_eq!(v["messages"][0]["content"][0]["text"], DEFAULT_PROMPT);

        let images = vec!["data:image/png;base64,AA".to_string()];
        let v = serde_json::to_value(ChatRequest::new("m", "", &images, false)).unwrap();
        assert_eq!(v["messages"][0]["content"][0]["type"], "image_url");
    }

    #[test]
    fn mime_prefers_content_type() {
        assert_eq!(guess_mime(Some("image/webp; q=1"), "x.png"), "image/webp");
        assert_eq!(guess_mime(Some("application/octet-stream"), "a/b.GIF?x=1"), "image/gif");
        assert_eq!(guess_mime(None, "https://x/y"), "image/jpeg");
    }

    #[test]
    fn data_uri_becomes_base64_file() {
        assert_eq!(to_onebot_file("data:image/png;base64,QUJD"), "base64://QUJD");
        assert_eq!(to_onebot_file("https://x/1.png"), "https://x/1.png");
    }

    #[tokio::test]
    async fn non_success_status_is_http_error() {
        let url = serve_once(vec![full_response(
            "429 Too Many Requests",
            "text/plain",
            "busy",
        )])
        .await;
        let err = generate(&url, "k", &stream_request()).await.unwrap_err();
        assert!(matches!(
            err,
            GenerationError::Http { status: 429, ref body } if body == "busy"
        ));
    }

    #[tokio::test]
    async fn slow_stream_with_steady_frames_is_not_cut_off() {
        // 总时长超过空闲上限，但每次间隔都在上限之内
        let mut script = vec![now(SSE_HEAD)];
        for _ in 0..8 {
            script.push(after(Duration::from_millis(100), ": ping\n"));
        }
        script.push(now(IMAGE_FRAME));
        script.push(now("data: [DONE]\n"));
        let url = serve_once(script).await;

        let media = generate_within(&url, "k", &stream_request(), Duration::from_millis(400))
            .await
            .unwrap();
        assert_eq!(media.images, vec!["https://x/a.png"]);
    }

    #[tokio::test]
    async fn silent_stream_trips_idle_timeout() {
        let url = serve_once(vec![
            now(SSE_HEAD),
            after(Duration::from_secs(5), "data: [DONE]\n"),
        ])
        .await;
        let err = generate_within(&url, "k", &stream_request(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Timeout(200)));
    }

    #[tokio::test]
    async fn done_marker_ends_read_without_waiting_for_close() {
        // [DONE] 之后连接保持 10 秒，读循环必须提前结束
        let url = serve_once(vec![
            now(SSE_HEAD),
            now(IMAGE_FRAME),
            now("data: [DONE]\n"),
            after(Duration::from_secs(10), "\n"),
        ])
        .await;
        let media = generate_within(&url, "k", &stream_request(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(media.images, vec!["https://x/a.png"]);
    }

    #[tokio::test]
    async fn truncated_body_is_stream_error() {
        let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: 4096\r\nConnection: close\r\n\r\n";
        let url = serve_once(vec![now(head), now(IMAGE_FRAME)]).await;
        let err = generate(&url, "k", &stream_request()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Stream(_)));
        assert!(err.to_string().starts_with("响应流错误: "));
    }

    #[tokio::test]
    async fn buffered_response_is_parsed_whole() {
        let url = serve_once(vec![full_response(
            "200 OK",
            "application/json",
            r#"{"choices":[{"message":{"content":"![r](https://x/b.png)"}}]}"#,
        )])
        .await;
        let media = generate(&url, "k", &ChatRequest::new("m", "画猫", &[], false))
            .await
            .unwrap();
        assert_eq!(media.images, vec!["https://x/b.png"]);
    }
}
