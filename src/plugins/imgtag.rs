use crate::adapters::onebot::{LockedWriter, api, reply};
use crate::command::{CommandMatch, image_urls, match_command};
use crate::config::build_config;
use crate::event::Context;
use crate::message::Message;
use crate::plugins::{PluginError, config_or_default, get_data_dir};
use crate::{debug, error, info, warn};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use toml::Value;

pub mod index;
pub mod service;

use index::{ImageIndex, LocalStats, SyncInfo, ext_from_content_type, md5_from_url};
use service::{AddImage, Dashboard, ImageRecord, ImgTagClient};

const PLUGIN: &str = "imgtag";
const SEARCH_RESULTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SendStrategy {
    #[default]
    LocalFirst,
    RemoteOnly,
    LocalOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct Config {
    enabled: bool,
    api_url: String,
    api_key: String,
    /// 留空时使用插件数据目录
    local_path: String,
    auto_sync: bool,
    auto_analyze: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    default_category_id: Option<i64>,
    send_strategy: SendStrategy,
    random_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: String::new(),
            api_key: String::new(),
            local_path: String::new(),
            auto_sync: true,
            auto_analyze: true,
            default_category_id: None,
            send_strategy: SendStrategy::LocalFirst,
            random_count: 1,
        }
    }
}

impl Config {
    fn client(&self) -> Option<ImgTagClient> {
        ImgTagClient::new(&self.api_url, &self.api_key)
    }
}

pub fn default_config() -> Value {
    build_config(Config::default())
}

static INDEX: OnceLock<Arc<ImageIndex>> = OnceLock::new();

fn load_config(ctx: &Context) -> Config {
    config_or_default(ctx, PLUGIN, default_config)
}

pub fn init(ctx: Context) -> BoxFuture<'static, Result<(), PluginError>> {
    Box::pin(async move {
        let config = load_config(&ctx);
        let root = if config.local_path.trim().is_empty() {
            get_data_dir(PLUGIN).await?
        } else {
            PathBuf::from(config.local_path.trim())
        };

        let index = ImageIndex::open(root).await?;
        let stats = index.stats().await;
        info!(
            target: "ImgTag",
            "本地图库 {}: {} 张 (已同步 {})",
            index.root().display(),
            stats.total,
            stats.synced
        );
        if INDEX.set(Arc::new(index)).is_err() {
            warn!(target: "ImgTag", "本地图库已经被初始化");
        }
        Ok(())
    })
}

/// 按发送策略决定图片地址，本地文件优先时返回 `file://` 路径
pub async fn resolve_image(
    index: Option<&ImageIndex>,
    strategy: SendStrategy,
    remote_url: &str,
) -> Option<String> {
    if strategy == SendStrategy::RemoteOnly {
        return Some(remote_url.to_string());
    }
    if let Some(index) = index
        && let Some(md5) = md5_from_url(remote_url)
        && let Some(path) = index.find_local(&md5).await
    {
        return Some(format!("file://{}", path.display()));
    }
    match strategy {
        SendStrategy::LocalOnly => None,
        _ => Some(remote_url.to_string()),
    }
}

async fn record_path(config: &Config, record: &ImageRecord) -> Option<String> {
    resolve_image(INDEX.get().map(|i| i.as_ref()), config.send_strategy, &record.url).await
}

/// 云端随机取一张带指定标签的图片，未配置或失败时返回 None
pub async fn random_tagged(ctx: &Context, tags: &[String]) -> Option<String> {
    let config = load_config(ctx);
    let client = config.client()?;
    match client.random(tags, 1).await {
        Ok(list) => {
            let record = list.images.into_iter().next()?;
            record_path(&config, &record).await
        }
        Err(e) => {
            warn!(target: "ImgTag", "随机图失败: {:#}", e);
            None
        }
    }
}

/// 本地图库中的随机图片
pub async fn random_local() -> Option<PathBuf> {
    INDEX.get()?.random_local().await
}

/// 空白分隔的标签
fn split_tags(text: &str) -> Vec<String> {
    text.split_whitespace().map(String::from).collect()
}

/// 含空格视为标签搜索，否则为关键词搜索
pub fn search_terms(text: &str) -> (String, Vec<String>) {
    let text = text.trim();
    if text.contains(char::is_whitespace) {
        (String::new(), split_tags(text))
    } else {
        (text.to_string(), Vec::new())
    }
}

fn join_head(tags: &[String], n: usize, sep: &str) -> String {
    tags.iter().take(n).cloned().collect::<Vec<_>>().join(sep)
}

// ================== 偷图 ==================

struct StealOutcome {
    md5: String,
    is_new: bool,
    synced: bool,
}

async fn steal_one(
    config: &Config,
    index: &ImageIndex,
    client: Option<&ImgTagClient>,
    url: &str,
    tags: &[String],
) -> anyhow::Result<StealOutcome> {
    let (bytes, content_type) = service::download(url).await?;
    let saved = index
        .save_bytes(&bytes, &ext_from_content_type(content_type.as_deref()))
        .await?;
    debug!(target: "ImgTag", "{} -> {}", url, saved.path.display());

    let mut synced = false;
    if config.auto_sync
        && let Some(client) = client
    {
        let body = AddImage {
            image_url: url,
            auto_analyze: config.auto_analyze,
            tags,
            category_id: config.default_category_id,
        };
        match client.add_image(&body).await {
            Ok(added) => {
                let info = SyncInfo {
                    remote_id: added.id,
                    remote_url: added.image_url,
                    tags: if added.tags.is_empty() {
                        tags.to_vec()
                    } else {
                        added.tags
                    },
                };
                index.mark_synced(&saved.md5, info).await?;
                synced = true;
            }
            Err(e) => error!(target: "ImgTag", "云端上传失败: {:#}", e),
        }
    }

    Ok(StealOutcome {
        md5: saved.md5,
        is_new: saved.is_new,
        synced,
    })
}

fn steal_summary(total: usize, results: &[Result<StealOutcome, String>], tags: &[String]) -> String {
    let ok: Vec<&StealOutcome> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let new_count = ok.iter().filter(|r| r.is_new).count();
    let synced_count = ok.iter().filter(|r| r.synced).count();

    let mut text = format!("✅ 处理完成: {}/{} 成功", ok.len(), total);
    if new_count > 0 {
        text.push_str(&format!("\n📥 新增: {} 张", new_count));
    }
    if synced_count > 0 {
        text.push_str(&format!("\n☁️ 已同步云端: {} 张", synced_count));
    }
    if !tags.is_empty() {
        text.push_str(&format!("\n🏷️ 标签: {}", tags.join(", ")));
    }
    let ids: Vec<&str> = ok.iter().take(5).map(|r| &r.md5[..8.min(r.md5.len())]).collect();
    if !ids.is_empty() {
        text.push_str(&format!("\n🔑 ID: {}", ids.join(", ")));
        if results.len() > 5 {
            text.push_str(&format!(" 等{}张", results.len()));
        }
    }
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        text.push_str(&format!("\n❌ {}", err));
    }
    text
}

async fn steal(
    ctx: &Context,
    writer: LockedWriter,
    cmd: CommandMatch,
    config: &Config,
) -> Result<(), PluginError> {
    let Some(index) = INDEX.get() else {
        reply(ctx, writer, "❌ 本地图库未初始化").await?;
        return Ok(());
    };

    let mut urls = cmd.image_urls();
    if urls.is_empty()
        && let Some(rid) = cmd.reply_id
    {
        match api::get_msg(ctx, writer.clone(), rid).await {
            Ok(data) => urls = image_urls(&data.message),
            Err(e) => warn!(target: "ImgTag", "获取引用消息失败: {}", e),
        }
    }
    if urls.is_empty() {
        reply(ctx, writer, "❌ 请回复一张图片或直接发送图片").await?;
        return Ok(());
    }

    let tags = split_tags(&cmd.text());
    let client = config.client();
    let mut results = Vec::with_capacity(urls.len());
    for url in &urls {
        let outcome = steal_one(config, index, client.as_ref(), url, &tags).await;
        if let Err(e) = &outcome {
            error!(target: "ImgTag", "保存图片失败: {:#}", e);
        }
        results.push(outcome.map_err(|e| format!("{:#}", e)));
    }

    reply(ctx, writer, steal_summary(urls.len(), &results, &tags)).await?;
    Ok(())
}

// ================== 搜图 / 随机图 / 详情 ==================

async fn search(
    ctx: &Context,
    writer: LockedWriter,
    client: &ImgTagClient,
    config: &Config,
    text: &str,
) -> Result<(), PluginError> {
    let (keyword, tags) = search_terms(text);
    let list = match client.search(&keyword, &tags, SEARCH_RESULTS).await {
        Ok(list) => list,
        Err(e) => {
            error!(target: "ImgTag", "搜索失败: {:#}", e);
            reply(ctx, writer, format!("❌ 搜索失败: {:#}", e)).await?;
            return Ok(());
        }
    };

    let mut entries = Vec::new();
    for record in list.images.iter().take(SEARCH_RESULTS) {
        let Some(path) = record_path(config, record).await else {
            continue;
        };
        let mut caption = format!("ID: {}", record.id);
        if !record.tags.is_empty() {
            caption.push_str(&format!("\n标签: {}", record.tags.join(", ")));
        }
        entries.push(Message::new().text(caption).image(path));
    }

    match entries.len() {
        0 => reply(ctx, writer, "🔍 未找到匹配的图片").await?,
        1 => {
            if let Some(single) = entries.pop() {
                reply(ctx, writer, single).await?;
            }
        }
        _ => {
            let self_id = ctx.self_id();
            let mut forward = Message::new().node_custom(
                self_id,
                "ImgTag",
                Message::new().text(format!("🔍 搜索结果 ({})", list.total)),
            );
            for entry in entries {
                forward = forward.node_custom(self_id, "ImgTag", entry);
            }
            let user_id = ctx.as_message().map(|m| m.user_id());
            api::send_forward_msg(ctx, writer, ctx.group_id(), user_id, forward).await?;
        }
    }
    Ok(())
}

async fn random(
    ctx: &Context,
    writer: LockedWriter,
    client: &ImgTagClient,
    config: &Config,
    text: &str,
) -> Result<(), PluginError> {
    let tags = split_tags(text);
    let list = match client.random(&tags, config.random_count.max(1)).await {
        Ok(list) => list,
        Err(e) => {
            error!(target: "ImgTag", "随机图失败: {:#}", e);
            reply(ctx, writer, format!("❌ 获取失败: {:#}", e)).await?;
            return Ok(());
        }
    };

    if list.images.is_empty() {
        let mut text = "🎲 没有找到图片".to_string();
        if !tags.is_empty() {
            text.push_str(&format!("（标签: {}）", tags.join(", ")));
        }
        reply(ctx, writer, text).await?;
        return Ok(());
    }

    let mut msg = Message::new();
    for record in &list.images {
        let Some(path) = record_path(config, record).await else {
            continue;
        };
        if !record.tags.is_empty() {
            msg = msg.text(format!("🏷️ {}", join_head(&record.tags, 5, " · ")));
        }
        msg = msg.image(path);
    }
    if msg.is_empty() {
        reply(ctx, writer, "❌ 无法获取图片").await?;
    } else {
        reply(ctx, writer, msg).await?;
    }
    Ok(())
}

async fn detail(
    ctx: &Context,
    writer: LockedWriter,
    client: &ImgTagClient,
    config: &Config,
    text: &str,
) -> Result<(), PluginError> {
    let Ok(id) = text.trim().parse::<i64>() else {
        reply(ctx, writer, "用法: #cc图片详情 <图片ID>").await?;
        return Ok(());
    };
    match client.detail(id).await {
        Ok(record) => {
            let mut msg = Message::new();
            if let Some(path) = record_path(config, &record).await {
                msg = msg.image(path);
            }
            let mut caption = format!("\nID: {}", record.id);
            if !record.tags.is_empty() {
                caption.push_str(&format!("\n🏷️ {}", join_head(&record.tags, 8, " · ")));
            }
            if !record.description.is_empty() {
                caption.push_str(&format!("\n📝 {}", record.description));
            }
            reply(ctx, writer, msg.text(caption)).await?;
        }
        Err(e) => {
            warn!(target: "ImgTag", "获取详情失败: {:#}", e);
            reply(ctx, writer, format!("❌ 获取详情失败: {:#}", e)).await?;
        }
    }
    Ok(())
}

// ================== 图库状态 ==================

pub fn format_stats(cloud: Option<&Dashboard>, local: LocalStats) -> String {
    let rule = "━━━━━━━━━━━━━━━━";
    let mut text = format!("📊 ImgTag 图库状态\n{}\n", rule);
    match cloud {
        Some(d) => {
            text.push_str(&format!(
                "☁️ 云端图库\n   📷 总计: {} 张\n   ✅ 已分析: {} 张\n   ⏳ 待分析: {} 张\n\n",
                d.images.total, d.images.analyzed, d.images.pending
            ));
            text.push_str(&format!(
                "📅 今日动态\n   📤 上传: {} 张\n   🤖 分析: {} 张\n\n",
                d.today.uploaded, d.today.analyzed
            ));
            text.push_str(&format!(
                "⚙️ 任务队列\n   📋 总任务: {}\n   🔄 处理中: {}\n   {}\n",
                d.queue.total,
                d.queue.processing,
                if d.queue.running { "🟢 运行中" } else { "🔴 已停止" }
            ));
        }
        None => text.push_str("☁️ 云端: 未连接\n"),
    }
    text.push_str(&format!(
        "{}\n📁 本地缓存\n   💾 总计: {} 张\n   ☁️ 已同步: {} 张\n   ⏳ 待同步: {} 张",
        rule,
        local.total,
        local.synced,
        local.unsynced()
    ));
    text
}

async fn stats(ctx: &Context, writer: LockedWriter, config: &Config) -> Result<(), PluginError> {
    let local = match INDEX.get() {
        Some(index) => index.stats().await,
        None => LocalStats { total: 0, synced: 0 },
    };
    let cloud = if config.api_url.trim().is_empty() {
        None
    } else {
        match service::dashboard(&config.api_url).await {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(target: "ImgTag", "获取云端统计失败: {:#}", e);
                None
            }
        }
    };
    reply(ctx, writer, format_stats(cloud.as_ref(), local)).await?;
    Ok(())
}

// ================== 入口 ==================

#[derive(Clone, Copy)]
enum RemoteAction {
    Search,
    Random,
    Detail,
}

pub fn handle(
    ctx: Context,
    writer: LockedWriter,
) -> BoxFuture<'static, Result<Option<Context>, PluginError>> {
    Box::pin(async move {
        if ctx.as_message().is_none() {
            return Ok(Some(ctx));
        }
        let config = load_config(&ctx);

        for name in ["偷图", "存图", "cc偷图", "cc存图"] {
            if let Some(cmd) = match_command(&ctx, name) {
                let is_master = ctx
                    .as_message()
                    .is_some_and(|m| ctx.is_master(m.user_id()));
                if !is_master {
                    return Ok(Some(ctx));
                }
                steal(&ctx, writer, cmd, &config).await?;
                return Ok(None);
            }
        }

        if match_command(&ctx, "cc图库状态").is_some() {
            stats(&ctx, writer, &config).await?;
            return Ok(None);
        }

        let remote = [
            ("cc搜图", RemoteAction::Search),
            ("cc随机图", RemoteAction::Random),
            ("cc来张", RemoteAction::Random),
            ("cc图片详情", RemoteAction::Detail),
        ];
        for (name, action) in remote {
            let Some(cmd) = match_command(&ctx, name) else {
                continue;
            };
            let Some(client) = config.client() else {
                reply(&ctx, writer, "❌ 请先配置 ImgTag API 地址和密钥").await?;
                return Ok(None);
            };
            let text = cmd.text();
            match action {
                RemoteAction::Search => search(&ctx, writer, &client, &config, &text).await?,
                RemoteAction::Random => random(&ctx, writer, &client, &config, &text).await?,
                RemoteAction::Detail => detail(&ctx, writer, &client, &config, &text).await?,
            }
            return Ok(None);
        }

        Ok(Some(ctx))
    })
}
