//! 上游响应帧的结构定义与媒体地址提取

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;

const VIDEO_SUFFIXES: [&str; 5] = [".mp4", ".webm", ".mov", ".m4v", ".mkv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// 一次生成得到的媒体地址，按出现顺序去重
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaSet {
    pub images: Vec<String>,
    pub videos: Vec<String>,
}

impl MediaSet {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.videos.is_empty()
    }

    pub fn len(&self) -> usize {
        self.images.len() + self.videos.len()
    }

    /// 收录一个地址。`forced` 为 None 时按后缀/前缀判断类型。
    /// 内联数据 (data URI / base64://) 每种类型只保留第一份。
    pub fn push(&mut self, url: &str, forced: Option<MediaKind>) {
        let url = url.trim();
        if !is_acceptable(url) {
            return;
        }
        let kind = forced.unwrap_or_else(|| classify(url));
        let list = match kind {
            MediaKind::Image => &mut self.images,
            MediaKind::Video => &mut self.videos,
        };

        if is_inline(url) {
            if list.iter().any(|u| is_inline(u)) {
                return;
            }
        } else if list.iter().any(|u| u == url) {
            return;
        }
        list.push(url.to_string());
    }
}

fn is_acceptable(url: &str) -> bool {
    url.starts_with("http://")
        || url.starts_with("https://")
        || url.starts_with("data:")
        || url.starts_with("base64://")
}

pub fn is_inline(url: &str) -> bool {
    url.starts_with("data:") || url.starts_with("base64://")
}

/// 按地址形态判断媒体类型，查询串不参与后缀判断
pub fn classify(url: &str) -> MediaKind {
    if url.starts_with("data:video/") || url.starts_with("base64://") {
        return MediaKind::Video;
    }
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if VIDEO_SUFFIXES.iter().any(|s| path.ends_with(s)) {
        MediaKind::Video
    } else {
        MediaKind::Image
    }
}

// ================== 帧结构 ==================

/// 裸 JSON 行可能是单帧，也可能是帧数组
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FramePayload {
    One(Frame),
    Many(Vec<Frame>),
}

impl FramePayload {
    pub fn into_frames(self) -> Vec<Frame> {
        match self {
            FramePayload::One(f) => vec![f],
            FramePayload::Many(v) => v,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub choices: Option<Vec<Choice>>,
    #[serde(default)]
    pub error: Option<UpstreamError>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Frame {
    /// 第一个 choice 的增量 (流式) 或完整消息 (非流式)
    pub fn first_content(&self) -> Option<&ContentObject> {
        let choice = self.choices.as_ref()?.first()?;
        choice.delta.as_ref().or(choice.message.as_ref())
    }

    /// 顶层错误描述: error.message > error (字符串) > message
    pub fn error_text(&self) -> Option<String> {
        let from_error = match &self.error {
            Some(UpstreamError::Detailed { message }) => message.clone(),
            Some(UpstreamError::Text(s)) => Some(s.clone()),
            _ => None,
        };
        from_error
            .or_else(|| self.message.clone())
            .filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum UpstreamError {
    Detailed { message: Option<String> },
    Text(String),
    Other(Value),
}

#[derive(Debug, Default, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub delta: Option<ContentObject>,
    #[serde(default)]
    pub message: Option<ContentObject>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContentObject {
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub image_url: Option<MediaRef>,
    #[serde(default)]
    pub video_url: Option<MediaRef>,
    #[serde(default)]
    pub images: Option<Vec<Part>>,
    #[serde(default)]
    pub videos: Option<Vec<Part>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<Part>),
    Other(Value),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Typed(TypedPart),
    Other(Value),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypedPart {
    ImageUrl { image_url: MediaRef },
    VideoUrl { video_url: MediaRef },
    Text { text: String },
    #[serde(other)]
    Unknown,
}

/// `{"url": "..."}` 或裸字符串
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MediaRef {
    Object { url: String },
    Bare(String),
    Other(Value),
}

impl MediaRef {
    pub fn url(&self) -> Option<&str> {
        match self {
            MediaRef::Object { url } | MediaRef::Bare(url) => Some(url.as_str()),
            MediaRef::Other(_) => None,
        }
    }
}

// ================== 提取 ==================

fn markdown_image_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"!\[.*?\]\(((?:https?://|data:image/)[^\s)]+)\)").expect("Invalid Regex")
    })
}

fn bare_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(https?://[^\s<>")\]]+)"#).expect("Invalid Regex"))
}

/// 依次从结构化字段、images/videos 数组、content 分段、自由文本中收集媒体地址
pub fn collect_media(obj: &ContentObject, media: &mut MediaSet) {
    if let Some(url) = obj.image_url.as_ref().and_then(MediaRef::url) {
        media.push(url, None);
    }
    if let Some(url) = obj.video_url.as_ref().and_then(MediaRef::url) {
        media.push(url, Some(MediaKind::Video));
    }

    for part in obj.images.iter().chain(obj.videos.iter()).flatten() {
        collect_part(part, media, false);
    }

    match &obj.content {
        Some(Content::Parts(parts)) => {
            for part in parts {
                collect_part(part, media, true);
            }
        }
        Some(Content::Text(text)) => scan_text(text, media),
        _ => {}
    }
}

fn collect_part(part: &Part, media: &mut MediaSet, scan_text_parts: bool) {
    let Part::Typed(typed) = part else {
        return;
    };
    match typed {
        TypedPart::ImageUrl { image_url } => {
            if let Some(url) = image_url.url() {
                media.push(url, None);
            }
        }
        TypedPart::VideoUrl { video_url } => {
            if let Some(url) = video_url.url() {
                media.push(url, Some(MediaKind::Video));
            }
        }
        TypedPart::Text { text } if scan_text_parts => scan_text(text, media),
        _ => {}
    }
}

/// 自由文本: 先找 Markdown 图片，再找裸链接
pub fn scan_text(text: &str, media: &mut MediaSet) {
    for cap in markdown_image_regex().captures_iter(text) {
        media.push(&cap[1], None);
    }
    for cap in bare_url_regex().captures_iter(text) {
        media.push(&cap[1], None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(json: &str) -> ContentObject {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn video_suffix_ignores_query() {
        assert_eq!(classify("https://a/b.MP4?sig=1"), MediaKind::Video);
        assert_eq!(classify("https://a/b.png?x=.mp4"), MediaKind::Image);
        assert_eq!(classify("data:video/mp4;base64,AAA"), MediaKind::Video);
        assert_eq!(classify("base64://AAAA"), MediaKind::Video);
    }

    #[test]
    fn structured_fields_accept_object_or_string() {
        let mut media = MediaSet::default();
        collect_media(
            &content(r#"{"image_url": {"url": "https://x/1.png"}, "video_url": "https://x/2"}"#),
            &mut media,
        );
        assert_eq!(media.images, vec!["https://x/1.png"]);
        assert_eq!(media.videos, vec!["https://x/2"]);
    }

    #[test]
    fn typed_parts_and_unknown_parts() {
        let mut media = MediaSet::default();
        collect_media(
            &content(
                r#"{"content": [
                    {"type": "image_url", "image_url": {"url": "https://x/a.jpg"}},
                    {"type": "thinking", "text": "..."},
                    {"type": "video_url", "video_url": {"url": "https://x/v"}},
                    42
                ]}"#,
            ),
            &mut media,
        );
        assert_eq!(media.images, vec!["https://x/a.jpg"]);
        assert_eq!(media.videos, vec!["https://x/v"]);
    }

    #[test]
    fn free_text_separates_videos_from_images() {
        let mut media = MediaSet::default();
        scan_text(
            "done ![img](https://x/pic.webp) and https://x/clip.mov?t=1 plus https://x/pic.webp",
            &mut media,
        );
        assert_eq!(media.images, vec!["https://x/pic.webp"]);
        assert_eq!(media.videos, vec!["https://x/clip.mov?t=1"]);
    }

    #[test]
    fn only_first_inline_payload_per_kind() {
        let mut media = MediaSet::default();
        media.push("data:image/png;base64,AAA", None);
        media.push("data:image/png;base64,BBB", None);
        media.push("https://x/1.png", None);
        media.push("data:video/mp4;base64,CCC", None);
        media.push("data:video/mp4;base64,DDD", None);
        assert_eq!(
            media.images,
            vec!["data:image/png;base64,AAA", "https://x/1.png"]
        );
        assert_eq!(media.videos, vec!["data:video/mp4;base64,CCC"]);
    }

    #[test]
    fn null_fields_do_not_break_frames() {
        let frame: Frame = serde_json::from_str(
            r#"{"choices": [{"delta": {"content": null, "images": null, "reasoning_content": null}}]}"#,
        )
        .unwrap();
        assert!(frame.first_content().is_some());
    }
}
