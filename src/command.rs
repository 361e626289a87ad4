use crate::event::{Context, Event};
use simd_json::OwnedValue;
use simd_json::derived::{ValueObjectAccess, ValueObjectAccessAsArray, ValueObjectAccessAsScalar};
use std::sync::PoisonError;

#[derive(Debug, Default)]
pub struct CommandMatch {
    /// 匹配后的参数列表（剩余的消息段）
    pub args: Vec<OwnedValue>,
    /// 引用回复的消息 ID
    pub reply_id: Option<i64>,
    /// 消息中 AT 的用户 (不含 @全体成员)
    pub at_ids: Vec<i64>,
}

impl CommandMatch {
    /// 参数中的纯文本，首尾空白已去除
    pub fn text(&self) -> String {
        let mut acc = String::new();
        for seg in &self.args {
            if seg.get_str("type") == Some("text")
                && let Some(t) = seg.get("data").and_then(|d| d.get_str("text"))
            {
                acc.push_str(t);
            }
        }
        acc.trim().to_string()
    }

    /// 参数中携带的图片地址
    pub fn image_urls(&self) -> Vec<String> {
        image_urls(&self.args)
    }
}

pub fn get_prefixes(ctx: &Context) -> Vec<String> {
    ctx.config
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .command_prefix
        .clone()
}

/// 解析指令：自动跳过头部的 Reply/At/空白，匹配 [Prefix][Command]，返回参数及引用信息
pub fn match_command(ctx: &Context, command_name: &str) -> Option<CommandMatch> {
    let msg = ctx.as_message()?;
    let msg_arr = msg.0.get_array("message")?;
    match_segments(msg_arr, &get_prefixes(ctx), command_name)
}

/// 对消息段数组做指令匹配
pub fn match_segments(
    msg_arr: &[Event],
    prefixes: &[String],
    command_name: &str,
) -> Option<CommandMatch> {
    let mut reply_id = None;
    let mut at_ids = Vec::new();

    for (i, segment) in msg_arr.iter().enumerate() {
        let type_ = segment.get_str("type")?;
        let data = segment.get("data")?;

        match type_ {
            "reply" => {
                if reply_id.is_none() {
                    reply_id = read_id(data, "id");
                }
            }
            "at" => {
                if let Some(qq) = read_id(data, "qq") {
                    at_ids.push(qq);
                }
            }
            "text" => {
                let raw_text = data.get_str("text").unwrap_or("");
                let trimmed_start = raw_text.trim_start();
                if trimmed_start.is_empty() {
                    continue;
                }

                // 第一个有效文本节点决定是否命中
                for prefix in prefixes {
                    let target = format!("{}{}", prefix, command_name);
                    let Some(rest) = trimmed_start.strip_prefix(&target) else {
                        continue;
                    };

                    let mut args = Vec::new();
                    let args_text = rest.trim_start();
                    if !args_text.is_empty() {
                        let mut new_seg = segment.clone();
                        new_seg["data"]["text"] = OwnedValue::from(args_text);
                        args.push(new_seg);
                    }
                    for seg in msg_arr.iter().skip(i + 1) {
                        if seg.get_str("type") == Some("reply") && reply_id.is_none() {
                            reply_id = seg.get("data").and_then(|d| read_id(d, "id"));
                        }
                        args.push(seg.clone());
                    }
                    at_ids.extend(at_targets(&args));

                    return Some(CommandMatch {
                        args,
                        reply_id,
                        at_ids,
                    });
                }
                return None;
            }
            // 指令前出现图片等其他类型，视为不匹配
            _ => return None,
        }
    }

    None
}

/// 读取数字或字符串形式的 ID 字段
fn read_id(data: &OwnedValue, key: &str) -> Option<i64> {
    data.get_i64(key)
        .or_else(|| data.get_u64(key).map(|v| v as i64))
        .or_else(|| data.get_str(key).and_then(|s| s.trim().parse().ok()))
}

/// 消息段中所有 @ 的 QQ 号 (忽略 @全体成员)
pub fn at_targets(segments: &[OwnedValue]) -> Vec<i64> {
    segments
        .iter()
        .filter(|s| s.get_str("type") == Some("at"))
        .filter_map(|s| s.get("data").and_then(|d| read_id(d, "qq")))
        .collect()
}

/// 消息段中所有图片的可下载地址 (url 优先，其次 file 为网址时)
pub fn image_urls(segments: &[OwnedValue]) -> Vec<String> {
    segments
        .iter()
        .filter(|s| matches!(s.get_str("type"), Some("image") | Some("mface")))
        .filter_map(|s| {
            let data = s.get("data")?;
            data.get_str("url")
                .filter(|u| !u.is_empty())
                .or_else(|| data.get_str("file").filter(|f| f.starts_with("http")))
                .map(String::from)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use simd_json::base::ValueAsArray;

    fn segs(value: OwnedValue) -> Vec<Event> {
        value.as_array().cloned().unwrap_or_default()
    }

    fn prefixes() -> Vec<String> {
        vec!["#".to_string()]
    }

    #[test]
    fn leading_reply_and_at_are_skipped() {
        let msg = segs(simd_json::json!([
            {"type": "reply", "data": {"id": "123"}},
            {"type": "at", "data": {"qq": "10001"}},
            {"type": "text", "data": {"text": " #cc 一只猫"}},
            {"type": "image", "data": {"url": "https://img/1.png", "file": "1.png"}}
        ]));
        let m = match_segments(&msg, &prefixes(), "cc").unwrap();
        assert_eq!(m.reply_id, Some(123));
        assert_eq!(m.at_ids, vec![10001]);
        assert_eq!(m.text(), "一只猫");
        assert_eq!(m.image_urls(), vec!["https://img/1.png".to_string()]);
    }

    #[test]
    fn trailing_at_targets_are_collected() {
        let msg = segs(simd_json::json!([
            {"type": "text", "data": {"text": "#戳他 "}},
            {"type": "at", "data": {"qq": 20002}},
            {"type": "at", "data": {"qq": "all"}}
        ]));
        let m = match_segments(&msg, &prefixes(), "戳他").unwrap();
        assert_eq!(m.at_ids, vec![20002]);
        assert!(m.text().is_empty());
    }

    #[test]
    fn other_prefix_or_leading_image_does_not_match() {
        let msg = segs(simd_json::json!([{"type": "text", "data": {"text": "/cc hi"}}]));
        assert!(match_segments(&msg, &prefixes(), "cc").is_none());

        let msg = segs(simd_json::json!([
            {"type": "image", "data": {"url": "https://img/1.png"}},
            {"type": "text", "data": {"text": "#cc hi"}}
        ]));
        assert!(match_segments(&msg, &prefixes(), "cc").is_none());
    }
}
