use crate::adapters::onebot::{LockedWriter, api, reply};
use crate::adapters::onebot::api::AiCharacterGroup;
use crate::command::match_command;
use crate::config::build_config;
use crate::event::Context;
use crate::plugins::{PluginError, config_or_default};
use crate::{debug, info, warn};
use futures_util::future::BoxFuture;
use rand::seq::IndexedRandom;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use toml::Value;

const DEFAULT_CHARACTER: &str = "lucy-voice-laibixiaoxin";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct Config {
    enabled: bool,
    /// 0: 每次随机角色，1: 固定使用 character_id
    mode: u8,
    character_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: 1,
            character_id: DEFAULT_CHARACTER.to_string(),
        }
    }
}

impl Config {
    fn fixed_character(&self) -> &str {
        let id = self.character_id.trim();
        if id.is_empty() { DEFAULT_CHARACTER } else { id }
    }
}

pub fn default_config() -> Value {
    build_config(Config::default())
}

fn speak_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?s)(.+?)说\s*(.*)$").expect("Invalid Regex"))
}

/// `<角色名>说 <文本>` 拆成 (角色名, 文本)
pub fn parse_speak(args: &str) -> Option<(String, String)> {
    let caps = speak_regex().captures(args.trim())?;
    let name = caps.get(1)?.as_str().trim();
    let text = caps.get(2)?.as_str().trim();
    if name.is_empty() || text.is_empty() {
        return None;
    }
    Some((name.to_string(), text.to_string()))
}

/// 按分类列出角色名，每类一行
pub fn format_characters(groups: &[AiCharacterGroup]) -> String {
    groups
        .iter()
        .map(|g| {
            let names: Vec<&str> = g
                .characters
                .iter()
                .map(|c| c.character_name.as_str())
                .collect();
            format!("{}: {}", g.category, names.join(", "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn find_character<'a>(groups: &'a [AiCharacterGroup], name: &str) -> Option<&'a str> {
    groups
        .iter()
        .flat_map(|g| g.characters.iter())
        .find(|c| c.character_name == name)
        .map(|c| c.character_id.as_str())
}

fn random_character(groups: &[AiCharacterGroup]) -> Option<String> {
    let ids: Vec<&str> = groups
        .iter()
        .flat_map(|g| g.characters.iter())
        .map(|c| c.character_id.as_str())
        .collect();
    ids.choose(&mut rand::rng()).map(|s| s.to_string())
}

/// 以 AI 声聊发送一段文本，供其他插件复用
pub async fn send_voice(
    ctx: &Context,
    writer: LockedWriter,
    group_id: i64,
    text: &str,
) -> Result<(), PluginError> {
    let config: Config = config_or_default(ctx, "ai_voice", default_config);

    let character = if config.mode == 0 {
        match api::get_ai_characters(ctx, writer.clone(), group_id).await {
            Ok(groups) => random_character(&groups),
            Err(e) => {
                warn!(target: "AiVoice", "获取角色列表失败，使用固定角色: {}", e);
                None
            }
        }
    } else {
        None
    }
    .unwrap_or_else(|| config.fixed_character().to_string());

    debug!(target: "AiVoice", "群 {} 使用角色 {} 发送语音", group_id, character);
    api::send_group_ai_record(ctx, writer, group_id, &character, text).await
}

pub fn handle(
    ctx: Context,
    writer: LockedWriter,
) -> BoxFuture<'static, Result<Option<Context>, PluginError>> {
    Box::pin(async move {
        let Some(group_id) = ctx.as_message().and_then(|m| m.group_id()) else {
            return Ok(Some(ctx));
        };

        if match_command(&ctx, "qq声聊列表").is_some()
            || match_command(&ctx, "QQ声聊列表").is_some()
        {
            let text = match api::get_ai_characters(&ctx, writer.clone(), group_id).await {
                Ok(groups) if !groups.is_empty() => format_characters(&groups),
                Ok(_) => "获取QQ模型失败".to_string(),
                Err(e) => {
                    warn!(target: "AiVoice", "获取角色列表失败: {}", e);
                    "获取QQ模型失败".to_string()
                }
            };
            reply(&ctx, writer, text).await?;
            return Ok(None);
        }

        let Some(cmd) = match_command(&ctx, "qq").or_else(|| match_command(&ctx, "QQ")) else {
            return Ok(Some(ctx));
        };
        let Some((name, text)) = parse_speak(&cmd.text()) else {
            return Ok(Some(ctx));
        };

        let groups = match api::get_ai_characters(&ctx, writer.clone(), group_id).await {
            Ok(groups) => groups,
            Err(e) => {
                warn!(target: "AiVoice", "获取角色列表失败: {}", e);
                reply(&ctx, writer, "获取QQ模型失败").await?;
                return Ok(None);
            }
        };
        let Some(character) = find_character(&groups, &name) else {
            reply(&ctx, writer, format!("没有找到角色「{}」，发送 #qq声聊列表 查看", name)).await?;
            return Ok(None);
        };

        info!(target: "AiVoice", "群 {} 以 {} 说: {}", group_id, name, text);
        if let Err(e) = api::send_group_ai_record(&ctx, writer.clone(), group_id, character, &text).await {
            warn!(target: "AiVoice", "发送语音失败: {}", e);
            reply(&ctx, writer, format!("发送语音失败: {}", e)).await?;
        }
        Ok(None)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::onebot::api::AiCharacter;

    fn groups() -> Vec<AiCharacterGroup> {
        let ch = |id: &str, name: &str| AiCharacter {
            character_id: id.to_string(),
            character_name: name.to_string(),
        };
        vec![
            AiCharacterGroup {
                category: "推荐".to_string(),
                characters: vec![ch("lucy-voice-laibixiaoxin", "小新"), ch("lucy-voice-houge", "猴哥")],
            },
            AiCharacterGroup {
                category: "现代".to_string(),
                characters: vec![ch("lucy-voice-suxinjiejie", "酥心御姐")],
            },
        ]
    }

    #[test]
    fn speak_command_splits_name_and_text() {
        assert_eq!(
            parse_speak("酥心御姐说 你好呀"),
            Some(("酥心御姐".to_string(), "你好呀".to_string()))
        );
        assert_eq!(parse_speak("小新说"), None);
        assert_eq!(parse_speak("声聊列表"), None);
    }

    #[test]
    fn characters_are_listed_per_category() {
        assert_eq!(
            format_characters(&groups()),
            "推荐: 小新, 猴哥\n现代: 酥心御姐"
        );
    }

    #[test]
    fn character_lookup_and_random_pick() {
        let groups = groups();
        assert_eq!(find_character(&groups, "猴哥"), Some("lucy-voice-houge"));
        assert_eq!(find_character(&groups, "妲己"), None);
        let picked = random_character(&groups).unwrap();
        assert!(picked.starts_with("lucy-voice-"));
        assert_eq!(random_character(&[]), None);
    }
}
