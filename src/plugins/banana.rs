use crate::adapters::onebot::{LockedWriter, api, reply, send_msg};
use crate::command::{CommandMatch, image_urls, match_command};
use crate::config::build_config;
use crate::event::Context;
use crate::message::Message;
use crate::plugins::{PluginError, config_or_default, get_data_dir};
use crate::{debug, error, info, warn};
use futures_util::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use toml::Value;

pub mod client;
pub mod error;
pub mod extract;
pub mod job;
pub mod keys;
pub mod queue;
pub mod stream;
#[cfg(test)]
mod test_server;

use job::{Delivery, GenerationJob, GenerationKind, GenerationRequest, ReplySink};
use keys::{FailurePolicy, KeyStore, KeysFile, mask_key};
use queue::{Admission, JobQueue};

const PLUGIN: &str = "banana";
const DEFAULT_MODEL: &str = "gemini-3-pro-image-preview";
const MAX_INPUT_IMAGES: usize = 3;

const BASE_MODELS: [&str; 4] = [
    "gemini-2.5-flash-image",
    "gemini-3.0-pro-image",
    "gemini-3-pro-image-preview",
    "imagen-4.0-generate-preview",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Preset {
    pub cmd: String,
    #[serde(default)]
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub desc: String,
}

impl Preset {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.cmd
        } else {
            &self.name
        }
    }

    pub fn summary(&self) -> &str {
        if !self.desc.is_empty() {
            &self.desc
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    pub api_url: String,
    pub default_model: String,
    pub video_model: String,
    pub use_stream: bool,
    pub max_queue: usize,
    pub max_concurrent: usize,
    pub disable_keys_on_error: bool,
    pub daily_fail_threshold: u64,
    pub presets: Vec<Preset>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: String::new(),
            default_model: DEFAULT_MODEL.to_string(),
            video_model: "veo-3.0-generate-preview".to_string(),
            use_stream: true,
            max_queue: 5,
            max_concurrent: 1,
            disable_keys_on_error: true,
            daily_fail_threshold: 10,
            presets: vec![Preset {
                cmd: "手办化".to_string(),
                name: "手办化".to_string(),
                prompt: "将图中人物制作成 1/7 比例的 PVC 手办，放在电脑桌上，背景是手办包装盒，写实风格".to_string(),
                desc: "把图片变成手办".to_string(),
            }],
        }
    }
}

impl Config {
    fn queue_limit(&self) -> usize {
        if self.max_queue == 0 { 5 } else { self.max_queue }
    }

    fn concurrency(&self) -> usize {
        self.max_concurrent.max(1)
    }

    fn model(&self) -> &str {
        if self.default_model.trim().is_empty() {
            DEFAULT_MODEL
        } else {
            self.default_model.trim()
        }
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy {
            disable_on_error: self.disable_keys_on_error,
            daily_fail_threshold: if self.daily_fail_threshold == 0 {
                10
            } else {
                self.daily_fail_threshold
            },
        }
    }
}

pub fn default_config() -> Value {
    build_config(Config::default())
}

/// 当前插件配置 (帮助插件也用它读取预设)
pub fn load_config(ctx: &Context) -> Config {
    config_or_default(ctx, PLUGIN, default_config)
}

struct Banana {
    keys: Arc<KeyStore>,
    queue: JobQueue<GenerationJob>,
}

static MANAGER: OnceLock<Arc<Banana>> = OnceLock::new();

pub fn init(ctx: Context) -> BoxFuture<'static, Result<(), PluginError>> {
    Box::pin(async move {
        let dir = get_data_dir(PLUGIN).await?;
        let keys = Arc::new(KeyStore::new(dir.join("keys.json")));

        let runner_keys = keys.clone();
        let queue = JobQueue::from_fn(move |task| job::execute(task, runner_keys.clone()));

        let reset_keys = keys.clone();
        ctx.scheduler
            .add_daily_at("banana-key-reset", 0, 8, 0, move || {
                let keys = reset_keys.clone();
                async move {
                    match keys.reset_disabled().await {
                        Ok(0) => info!(target: "Banana", "定时任务：没有失效密钥需要重置"),
                        Ok(n) => info!(target: "Banana", "定时任务：已重置 {} 个失效密钥", n),
                        Err(e) => error!(target: "Banana", "定时任务执行失败: {}", e),
                    }
                }
            });

        if MANAGER.set(Arc::new(Banana { keys, queue })).is_err() {
            warn!(target: "Banana", "Manager 已经被初始化");
        }
        Ok(())
    })
}

// ================== 回复端 ==================

#[derive(Debug, Clone, Copy)]
struct Origin {
    group_id: Option<i64>,
    user_id: i64,
    message_id: i64,
}

/// 把结果发回发起命令的会话
struct ChatSink {
    ctx: Context,
    writer: LockedWriter,
    origin: Origin,
}

impl ChatSink {
    fn send(&self, msg: Message) -> BoxFuture<'static, Result<(), PluginError>> {
        let ctx = self.ctx.clone();
        let writer = self.writer.clone();
        let origin = self.origin;
        Box::pin(async move {
            send_msg(&ctx, writer, origin.group_id, Some(origin.user_id), msg).await
        })
    }
}

impl ReplySink for ChatSink {
    fn notify(&self, text: String) -> BoxFuture<'static, Result<(), PluginError>> {
        self.send(Message::new().text(text))
    }

    fn deliver(&self, delivery: Delivery) -> BoxFuture<'static, Result<(), PluginError>> {
        let msg = match &delivery.result {
            Ok(media) => {
                let head = if delivery.from_reply {
                    Message::new().reply(self.origin.message_id)
                } else {
                    Message::new()
                };
                job::format_success(
                    head,
                    media,
                    delivery.kind,
                    &delivery.model,
                    delivery.preset.as_deref(),
                    delivery.elapsed,
                )
            }
            Err(e) => Message::new().text(job::format_failure(e, delivery.elapsed)),
        };
        self.send(msg)
    }
}

// ================== 指令解析 ==================

/// 由模型名推出的 `-关键字`，例如 `gemini-2.5-flash-image` → `-2.5-flash`
fn model_keyword(model: &str) -> String {
    let short = model
        .replace("gemini-", "")
        .replace("-image", "")
        .replace("imagen-", "imagen")
        .replace("-generate-preview", "");
    format!("-{}", short)
}

/// 从提示词中识别并移除模型关键字
pub fn pick_model(prompt: &str, default_model: &str) -> (String, String) {
    for model in BASE_MODELS {
        let pattern = format!(r"(?i)\s*{}\s*", regex::escape(&model_keyword(model)));
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };
        if re.is_match(prompt) {
            let rest = re.replacen(prompt, 1, " ").trim().to_string();
            return (model.to_string(), rest);
        }
    }
    (default_model.to_string(), prompt.trim().to_string())
}

/// 预设命令后只允许跟 `@QQ` 或 `QQ`；返回 Some(目标) 表示格式正确
pub fn parse_preset_target(args: &str) -> Option<Option<i64>> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^@?\s*(\d+)$").expect("Invalid Regex"));

    let args = args.trim();
    if args.is_empty() {
        return Some(None);
    }
    re.captures(args).map(|caps| caps[1].parse().ok())
}

fn match_preset<'a>(ctx: &Context, presets: &'a [Preset]) -> Option<(&'a Preset, CommandMatch, Option<i64>)> {
    let mut sorted: Vec<&Preset> = presets.iter().filter(|p| !p.cmd.trim().is_empty()).collect();
    // 长命令优先，避免被前缀相同的短命令截获
    sorted.sort_by_key(|p| std::cmp::Reverse(p.cmd.trim().chars().count()));

    for preset in sorted {
        let Some(matched) = match_command(ctx, preset.cmd.trim()) else {
            continue;
        };
        if let Some(target) = parse_preset_target(&matched.text()) {
            return Some((preset, matched, target));
        }
    }
    None
}

fn dedupe_inputs(urls: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for url in urls {
        if !url.is_empty() && !out.contains(&url) {
            out.push(url);
        }
    }
    if out.len() > MAX_INPUT_IMAGES {
        debug!(target: "Banana", "输入图片超出{}张，已截取前{}张", MAX_INPUT_IMAGES, MAX_INPUT_IMAGES);
        out.truncate(MAX_INPUT_IMAGES);
    }
    out
}

/// 引用消息中的图片 + 当前消息中的图片
async fn gather_inputs(
    ctx: &Context,
    writer: &LockedWriter,
    matched: &CommandMatch,
) -> (Vec<String>, bool) {
    let mut urls = Vec::new();
    let mut from_reply = false;

    if let Some(id) = matched.reply_id {
        match api::get_msg(ctx, writer.clone(), id).await {
            Ok(data) => {
                let found = image_urls(&data.message);
                if !found.is_empty() {
                    from_reply = true;
                    urls.extend(found);
                }
            }
            Err(e) => debug!(target: "Banana", "获取引用消息失败: {}", e),
        }
    }

    if let Some(msg) = ctx.as_message() {
        urls.extend(image_urls(msg.segments()));
    }
    (dedupe_inputs(urls), from_reply)
}

// ================== 文本输出 ==================

fn models_text(config: &Config) -> String {
    let mut text = format!("🍌 模型列表\n当前默认: {}\n\n🖼️ 支持的模型", config.model());
    for model in BASE_MODELS {
        let family = if model.contains("imagen") {
            "Imagen 图片生成"
        } else {
            "Gemini 图片生成"
        };
        text.push_str(&format!("\n• {} ({}) - {}", model, model_keyword(model), family));
    }
    text.push_str(&format!("\n🎬 视频模型: {}", config.video_model));
    text.push_str("\n\n💡 #cc [提示词] - 使用默认模型\n💡 #cc [提示词] -模型名 - 指定模型");
    text
}

fn presets_text(presets: &[Preset]) -> String {
    if presets.is_empty() {
        return "📝 当前没有配置任何预设\n\n请在配置文件中添加预设".to_string();
    }
    let mut text = format!("🍌 预设列表 (共 {} 个)\n", presets.len());
    for p in presets {
        text.push_str(&format!("\n#{} - {}", p.cmd, p.summary()));
    }
    text.push_str("\n\n💡 回复图片后发送预设关键字即可生成");
    text
}

pub fn format_key_list(file: &KeysFile) -> String {
    if file.keys.is_empty() {
        return "📝 当前没有配置任何API密钥\n\n使用 #大香蕉添加key <密钥> 来添加密钥".to_string();
    }

    let lines: Vec<String> = file
        .keys
        .iter()
        .enumerate()
        .map(|(i, key)| {
            let status = if key.is_active() { "✅" } else { "❌" };
            let current = if i == file.current_index { " (当前)" } else { "" };
            format!(
                "{}. {} {}{} [{}|{}]",
                i + 1,
                mask_key(&key.value),
                status,
                current,
                key.today_usage,
                key.today_failed
            )
        })
        .collect();

    let active = file.active_count();
    format!(
        "📝 大香蕉 API密钥列表 ({}个)\n\n{}\n\n📊 状态统计: 活跃{}个, 禁用{}个\n📋 格式: [当日用量|当日失败]",
        file.keys.len(),
        lines.join("\n"),
        active,
        file.keys.len() - active
    )
}

fn debug_text(file: &KeysFile, pending: usize, config: &Config) -> String {
    let active = file.active_count();
    let api_url = if config.api_url.is_empty() {
        "未配置"
    } else {
        config.api_url.as_str()
    };
    format!(
        "🔧 大香蕉插件调试信息\n📊 密钥状态: 总计{}个, 活跃{}个, 禁用{}个\n📈 请求统计: 总计{}次\n🎯 当前队列: {}个任务\n⚙️ API地址: {}\n🤖 默认模型: {}\n📡 流式响应: {}",
        file.keys.len(),
        active,
        file.keys.len() - active,
        file.statistics.total_requests,
        pending,
        api_url,
        config.model(),
        if config.use_stream { "启用" } else { "禁用" }
    )
}

// ================== 主处理 ==================

pub fn handle(
    ctx: Context,
    writer: LockedWriter,
) -> BoxFuture<'static, Result<Option<Context>, PluginError>> {
    Box::pin(async move {
        let Some(msg) = ctx.as_message() else {
            return Ok(Some(ctx));
        };
        let origin = Origin {
            group_id: msg.group_id(),
            user_id: msg.user_id(),
            message_id: msg.message_id(),
        };

        let Some(manager) = MANAGER.get().cloned() else {
            return Ok(Some(ctx));
        };

        if dispatch(&ctx, &writer, &manager, origin).await? {
            Ok(None)
        } else {
            Ok(Some(ctx))
        }
    })
}

/// 返回 true 表示事件已被处理
async fn dispatch(
    ctx: &Context,
    writer: &LockedWriter,
    manager: &Arc<Banana>,
    origin: Origin,
) -> Result<bool, PluginError> {
    let config = load_config(ctx);

    if let Some(m) = match_command(ctx, "大香蕉模型列表")
        && m.text().is_empty()
    {
        reply(ctx, writer.clone(), models_text(&config)).await?;
        return Ok(true);
    }

    if let Some(m) = match_command(ctx, "大香蕉预设列表")
        && m.text().is_empty()
    {
        reply(ctx, writer.clone(), presets_text(&config.presets)).await?;
        return Ok(true);
    }

    if let Some(m) = match_command(ctx, "大香蕉添加key") {
        if !ctx.is_master(origin.user_id) {
            reply(ctx, writer.clone(), "❌ 仅主人可用").await?;
            return Ok(true);
        }
        let text = add_keys(&manager.keys, &m.text(), origin.user_id).await;
        reply(ctx, writer.clone(), text).await?;
        return Ok(true);
    }

    if let Some(m) = match_command(ctx, "大香蕉key列表")
        && m.text().is_empty()
    {
        let text = if !ctx.is_master(origin.user_id) {
            "❌ 仅主人可用".to_string()
        } else {
            match manager.keys.snapshot().await {
                Ok(file) => format_key_list(&file),
                Err(e) => format!("❌ 获取密钥列表失败: {}", e),
            }
        };
        reply(ctx, writer.clone(), text).await?;
        return Ok(true);
    }

    if let Some(m) = match_command(ctx, "大香蕉调试")
        && m.text().is_empty()
    {
        let text = if !ctx.is_master(origin.user_id) {
            "❌ 仅主人可用".to_string()
        } else {
            match manager.keys.snapshot().await {
                Ok(file) => debug_text(&file, manager.queue.pending_len(), &config),
                Err(e) => format!("❌ 调试失败: {}", e),
            }
        };
        reply(ctx, writer.clone(), text).await?;
        return Ok(true);
    }

    if let Some((preset, matched, target)) = match_preset(ctx, &config.presets) {
        let (mut inputs, from_reply) = gather_inputs(ctx, writer, &matched).await;
        if inputs.is_empty() {
            // 没有图片时用头像兜底: @的人 > 指定QQ > 发送者
            let qq = matched
                .at_ids
                .first()
                .copied()
                .or(target)
                .unwrap_or(origin.user_id);
            inputs.push(api::avatar_url(qq));
        }

        let request = GenerationRequest {
            kind: GenerationKind::Image,
            model: config.model().to_string(),
            prompt: preset.prompt.clone(),
            images: inputs,
            preset: Some(preset.display_name().to_string()),
            api_url: config.api_url.trim().to_string(),
            use_stream: config.use_stream,
            policy: config.policy(),
            from_reply,
            started: Instant::now(),
        };
        submit(ctx, writer, manager, &config, origin, preset.display_name(), request).await?;
        return Ok(true);
    }

    if let Some(matched) = match_command(ctx, "cc视频") {
        let prompt = matched.text();
        if prompt.is_empty() {
            reply(
                ctx,
                writer.clone(),
                "❌ 请提供提示词\n使用方法：\n#cc视频 [提示词] - 生成视频\n例如：#cc视频 海边的日落",
            )
            .await?;
            return Ok(true);
        }

        let (inputs, from_reply) = gather_inputs(ctx, writer, &matched).await;
        let request = GenerationRequest {
            kind: GenerationKind::Video,
            model: config.video_model.trim().to_string(),
            prompt,
            images: inputs,
            preset: None,
            api_url: config.api_url.trim().to_string(),
            use_stream: config.use_stream,
            policy: config.policy(),
            from_reply,
            started: Instant::now(),
        };
        submit(ctx, writer, manager, &config, origin, "视频生成", request).await?;
        return Ok(true);
    }

    if let Some(matched) = match_command(ctx, "cc") {
        let raw = matched.text();
        if raw.is_empty() {
            reply(
                ctx,
                writer.clone(),
                "❌ 请提供提示词\n使用方法：\n#cc [提示词] - 使用默认模型\n例如：#cc 美丽的风景",
            )
            .await?;
            return Ok(true);
        }

        let (model, prompt) = pick_model(&raw, config.model());
        let (inputs, from_reply) = gather_inputs(ctx, writer, &matched).await;
        let request = GenerationRequest {
            kind: GenerationKind::Image,
            model,
            prompt,
            images: inputs,
            preset: None,
            api_url: config.api_url.trim().to_string(),
            use_stream: config.use_stream,
            policy: config.policy(),
            from_reply,
            started: Instant::now(),
        };
        submit(ctx, writer, manager, &config, origin, "图片生成", request).await?;
        return Ok(true);
    }

    Ok(false)
}

async fn submit(
    ctx: &Context,
    writer: &LockedWriter,
    manager: &Banana,
    config: &Config,
    origin: Origin,
    label: &str,
    request: GenerationRequest,
) -> Result<(), PluginError> {
    let noun = request.kind.noun();
    let max_queue = config.queue_limit();
    let max_concurrent = config.concurrency();

    let job = GenerationJob {
        label: label.to_string(),
        request,
        sink: Arc::new(ChatSink {
            ctx: ctx.clone(),
            writer: writer.clone(),
            origin,
        }),
    };

    let text = match manager.queue.enqueue(job, max_queue, max_concurrent) {
        Admission::Accepted { total, running } => format!(
            "🎨 正在生成[{}]{}，当前队列 {} 个（执行中 {}/{}），请稍候…",
            label, noun, total, running, max_concurrent
        ),
        Admission::Rejected => {
            format!("❌ 当前任务较多，队列已满（{}）。请稍后再试~", max_queue)
        }
    };
    reply(ctx, writer.clone(), text).await?;
    Ok(())
}

async fn add_keys(store: &KeyStore, raw: &str, added_by: i64) -> String {
    static SPLIT: OnceLock<Regex> = OnceLock::new();
    let split = SPLIT.get_or_init(|| Regex::new(r"[\s,;，；]+").expect("Invalid Regex"));

    if raw.trim().is_empty() {
        return "❌ 请提供API密钥\n\n📝 使用方法：\n#大香蕉添加key <密钥1> [密钥2] ...".to_string();
    }
    let candidates: Vec<&str> = split.split(raw).filter(|k| !k.trim().is_empty()).collect();
    if candidates.is_empty() {
        return "❌ 未检测到有效的API密钥。".to_string();
    }

    let mut added = 0;
    let mut duplicated = 0;
    for key in candidates {
        match store.add_key(key, &added_by.to_string()).await {
            Ok(true) => added += 1,
            Ok(false) => duplicated += 1,
            Err(e) => return format!("❌ 添加密钥失败: {}", e),
        }
    }

    let mut text = "✅ 操作完成:".to_string();
    if added > 0 {
        text.push_str(&format!("\n- 成功添加 {} 个新密钥。", added));
    }
    if duplicated > 0 {
        text.push_str(&format!("\n- 跳过 {} 个重复密钥。", duplicated));
    }
    if let Ok(file) = store.snapshot().await {
        text.push_str(&format!(
            "\n\n📊 当前状态：总计 {} 个，活跃 {} 个",
            file.keys.len(),
            file.active_count()
        ));
    }
    text
}
