//! 流式响应聚合: SSE (`data:` 行) 与裸 JSON 行混合的分块输入，折叠为一个结果

use super::error::GenerationError;
use super::extract::{Frame, FramePayload, MediaSet, collect_media};
use crate::debug;

const DONE_MARKER: &str = "[DONE]";

/// 在 reasoning_content 中出现即视为上游报错
const ERROR_MARKERS: [&str; 2] = ["❌", "生成失败"];

pub type GenerationResult = Result<MediaSet, GenerationError>;

#[derive(Debug, Default)]
pub struct StreamAggregator {
    buffer: Vec<u8>,
    media: MediaSet,
    errors: Vec<String>,
    resolution: Option<GenerationResult>,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否已经由 `[DONE]` 得出结果
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// 送入一个网络分块。已得出结果后的分块被忽略。
    pub fn push(&mut self, chunk: &[u8]) {
        if self.is_resolved() {
            return;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.process_line(&line[..line.len() - 1]);
            if self.is_resolved() {
                self.buffer.clear();
                return;
            }
        }
    }

    /// 流正常结束。未收到 `[DONE]` 时按已收集的内容给出结果。
    pub fn finish(mut self) -> GenerationResult {
        if self.resolution.is_none() && !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            self.process_line(&tail);
        }
        match self.resolution.take() {
            Some(result) => result,
            None => self.conclude(GenerationError::StreamAborted),
        }
    }

    /// 传输错误或超时；若此前已得出结果则以先前结果为准
    pub fn fail(mut self, err: GenerationError) -> GenerationResult {
        self.resolution.take().unwrap_or(Err(err))
    }

    fn process_line(&mut self, raw: &[u8]) {
        let decoded = String::from_utf8_lossy(raw);
        let line = decoded.trim_end_matches('\r');

        let payload = if let Some(rest) = line.strip_prefix("data:") {
            rest.strip_prefix(' ').unwrap_or(rest)
        } else if line.starts_with("event:")
            || line.starts_with("id:")
            || line.starts_with("retry:")
            || line.starts_with(':')
        {
            return;
        } else {
            let trimmed = line.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                trimmed
            } else {
                return;
            }
        };

        let payload = payload.trim();
        if payload.is_empty() {
            return;
        }
        if payload == DONE_MARKER {
            let result = self.conclude(GenerationError::NoContent);
            self.resolution = Some(result);
            return;
        }

        match serde_json::from_str::<FramePayload>(payload) {
            Ok(parsed) => {
                for frame in parsed.into_frames() {
                    self.absorb(&frame);
                }
            }
            Err(e) => {
                debug!(target: "Banana", "跳过无法解析的帧: {}", e);
            }
        }
    }

    fn absorb(&mut self, frame: &Frame) {
        if frame.error.is_some()
            && let Some(text) = frame.error_text()
        {
            self.errors.push(text.trim().to_string());
        }

        let Some(content) = frame.first_content() else {
            return;
        };
        if let Some(reasoning) = &content.reasoning_content
            && ERROR_MARKERS.iter().any(|m| reasoning.contains(m))
        {
            self.errors.push(reasoning.trim().to_string());
        }
        collect_media(content, &mut self.media);
    }

    fn conclude(&mut self, fallback: GenerationError) -> GenerationResult {
        if !self.media.is_empty() {
            Ok(std::mem::take(&mut self.media))
        } else if !self.errors.is_empty() {
            Err(GenerationError::Upstream(self.errors.join("\n")))
        } else {
            Err(fallback)
        }
    }
}

/// 非流式响应: 整体解析一次，从 choices[0].message 中提取
pub fn parse_buffered(body: &[u8]) -> GenerationResult {
    let frame: Frame =
        serde_json::from_slice(body).map_err(|e| GenerationError::Parse(e.to_string()))?;

    let mut media = MediaSet::default();
    if let Some(choice) = frame.choices.as_ref().and_then(|c| c.first())
        && let Some(message) = choice.message.as_ref().or(choice.delta.as_ref())
    {
        collect_media(message, &mut media);
    }

    if media.is_empty() {
        let reason = frame
            .error_text()
            .unwrap_or_else(|| GenerationError::NoContent.to_string());
        return Err(GenerationError::Upstream(reason));
    }
    Ok(media)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&str]) -> GenerationResult {
        let mut agg = StreamAggregator::new();
        for c in chunks {
            agg.push(c.as_bytes());
        }
        agg.finish()
    }

    #[test]
    fn image_url_delta_round_trips() {
        let result = run(&[
            "data: {\"choices\":[{\"delta\":{\"image_url\":{\"url\":\"https://x/a.png\"}}}]}\n",
            "data: [DONE]\n",
        ])
        .unwrap();
        assert_eq!(result.images, vec!["https://x/a.png"]);
        assert!(result.videos.is_empty());
    }

    #[test]
    fn empty_stream_with_done_has_no_content() {
        let err = run(&["data: [DONE]\n"]).unwrap_err();
        assert_eq!(err.to_string(), "未找到生成的内容");
    }

    #[test]
    fn stream_end_without_done_is_aborted() {
        let err = run(&[": keep-alive\n", "event: ping\n"]).unwrap_err();
        assert!(matches!(err, GenerationError::StreamAborted));
    }

    #[test]
    fn frames_split_across_chunks_and_bare_json_lines() {
        let result = run(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"![a](https://x/",
            "b.jpg)\"}}]}\r\n",
            "{\"choices\":[{\"delta\":{\"content\":\"https://x/c.mp4\"}}]}\n",
        ])
        .unwrap();
        assert_eq!(result.images, vec!["https://x/b.jpg"]);
        assert_eq!(result.videos, vec!["https://x/c.mp4"]);
    }

    #[test]
    fn reasoning_errors_are_reported_on_done() {
        let err = run(&[
            "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\" ❌ 内容违规 \"}}]}\n",
            "data: not json\n",
            "data: [DONE]\n",
        ])
        .unwrap_err();
        assert_eq!(err.to_string(), "生成失败: ❌ 内容违规");
    }

    #[test]
    fn resolves_only_once() {
        let mut agg = StreamAggregator::new();
        agg.push(b"data: {\"choices\":[{\"delta\":{\"image_url\":\"https://x/1.png\"}}]}\ndata: [DONE]\n");
        assert!(agg.is_resolved());
        agg.push(b"data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"\xe2\x9d\x8c\"}}]}\n");
        let result = agg.fail(GenerationError::Timeout(1)).unwrap();
        assert_eq!(result.images, vec!["https://x/1.png"]);
    }

    #[test]
    fn transport_failure_before_done() {
        let mut agg = StreamAggregator::new();
        agg.push(b"data: {\"choices\":[]}\n");
        let err = agg.fail(GenerationError::Timeout(120000)).unwrap_err();
        assert_eq!(err.to_string(), "请求超时 (120000ms)");
    }

    #[test]
    fn buffered_body_parsing() {
        let ok = parse_buffered(
            br#"{"choices":[{"message":{"content":"see https://x/r.png"}}]}"#,
        )
        .unwrap();
        assert_eq!(ok.images, vec!["https://x/r.png"]);

        let err = parse_buffered(br#"{"error":{"message":"quota"}}"#).unwrap_err();
        assert_eq!(err.to_string(), "生成失败: quota");

        let err = parse_buffered(br#"{"choices":[]}"#).unwrap_err();
        assert_eq!(err.to_string(), "生成失败: 未找到生成的内容");

        assert!(matches!(
            parse_buffered(b"<html>"),
            Err(GenerationError::Parse(_))
        ));
    }
}
