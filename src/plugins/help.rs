use crate::adapters::onebot::{LockedWriter, reply};
use crate::command::match_command;
use crate::config::build_config;
use crate::event::Context;
use crate::plugins::PluginError;
use crate::plugins::banana::{self, Preset};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use toml::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct Config {
    enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self { enabled: true }
    }
}

pub fn default_config() -> Value {
    build_config(Config::default())
}

struct Group {
    title: String,
    items: Vec<(String, String)>,
}

fn group(title: &str, items: &[(&str, &str)]) -> Group {
    Group {
        title: title.to_string(),
        items: items
            .iter()
            .map(|(cmd, desc)| (cmd.to_string(), desc.to_string()))
            .collect(),
    }
}

pub fn help_text(presets: &[Preset]) -> String {
    let groups = [
        group(
            "🍌 大香蕉绘图",
            &[
                ("#cc [提示词]", "生成/编辑图片"),
                ("#cc视频 [提示词]", "生成视频"),
                ("#大香蕉模型列表", "支持的模型"),
                ("#大香蕉预设列表", "预设关键字"),
            ],
        ),
        Group {
            title: format!("🎯 预设关键字 ({}个)", presets.len()),
            items: presets
                .iter()
                .map(|p| (format!("#{}", p.cmd), p.summary().to_string()))
                .collect(),
        },
        group(
            "🖼️ 图库功能",
            &[
                ("#偷图 [标签...]", "保存引用的图片"),
                ("#cc搜图 [关键词]", "搜索图库"),
                ("#cc随机图 [标签]", "随机发图"),
                ("#cc来张 [标签]", "随机发图"),
                ("#cc图片详情 [ID]", "图片标签与描述"),
                ("#cc图库状态", "统计信息"),
            ],
        ),
        group(
            "🎙️ 声聊功能",
            &[
                ("#qq[角色名]说 [文字]", "AI语音合成"),
                ("#qq声聊列表", "查看角色列表"),
            ],
        ),
        group(
            "👆 互动功能",
            &[
                ("戳一戳机器人", "随机互动回复"),
                ("#戳他 @成员", "替主人戳人"),
            ],
        ),
        group(
            "🔧 管理命令 (仅主人)",
            &[
                ("#大香蕉添加key", "添加API密钥"),
                ("#大香蕉key列表", "密钥状态"),
                ("#大香蕉调试", "调试信息"),
            ],
        ),
        group("❓ 帮助", &[("#cc帮助", "查看本帮助")]),
    ];

    let mut text = String::from("🍌 cc帮助\ncc-plugin 多功能插件");
    for g in groups.iter().filter(|g| !g.items.is_empty()) {
        text.push_str(&format!("\n\n{}", g.title));
        for (cmd, desc) in &g.items {
            if desc.is_empty() {
                text.push_str(&format!("\n  {}", cmd));
            } else {
                text.push_str(&format!("\n  {} - {}", cmd, desc));
            }
        }
    }
    text.push_str("\n\n💡 可以回复图片进行图生图\n💡 支持多张图片输入（最多3张）\n💡 戳一戳机器人有趣互动");
    text
}

pub fn handle(
    ctx: Context,
    writer: LockedWriter,
) -> BoxFuture<'static, Result<Option<Context>, PluginError>> {
    Box::pin(async move {
        let Some(cmd) = match_command(&ctx, "cc帮助") else {
            return Ok(Some(ctx));
        };
        if !cmd.text().is_empty() {
            return Ok(Some(ctx));
        }

        let presets = banana::load_config(&ctx).presets;
        reply(&ctx, writer, help_text(&presets)).await?;
        Ok(None)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_listed_in_help() {
        let presets = vec![Preset {
            cmd: "手办化".into(),
            name: "手办化".into(),
            prompt: "p".into(),
            desc: "把图片变成手办".into(),
        }];
        let text = help_text(&presets);
        assert!(text.contains("🎯 预设关键字 (1个)"));
        assert!(text.contains("#手办化 - 把图片变成手办"));
        assert!(text.contains("#大香蕉key列表 - 密钥状态"));
    }

    #[test]
    fn empty_preset_group_is_skipped() {
        let text = help_text(&[]);
        assert!(!text.contains("🎯 预设关键字"));
        assert!(text.contains("#大香蕉预设列表 - 预设关键字"));
        assert!(text.contains("#cc帮助 - 查看本帮助"));
    }
}
