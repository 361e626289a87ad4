use crate::adapters::onebot::{LockedWriter, send_frame_raw};
use crate::event::{Context, EventType};
use crate::{debug, error, info};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{OnceLock, PoisonError};
use tokio::fs;
use toml::Value;

pub mod ai_voice;
pub mod anti_flood;
pub mod banana;
pub mod help;
pub mod imgtag;
pub mod poke;

pub type PluginError = Box<dyn std::error::Error + Send + Sync>;

pub type PluginHandler =
    fn(Context, LockedWriter) -> BoxFuture<'static, Result<Option<Context>, PluginError>>;

pub type PluginInitHandler = fn(Context) -> BoxFuture<'static, Result<(), PluginError>>;

pub struct Plugin {
    pub name: &'static str,
    pub handler: PluginHandler,
    pub on_init: Option<PluginInitHandler>,
    /// 当 Bot 连接成功且获取到自身信息后触发
    pub on_connected: Option<PluginHandler>,
    pub default_config: fn() -> Value,
}

static PLUGINS: OnceLock<Vec<Plugin>> = OnceLock::new();

/// 获取全局插件列表 (顺序即流水线顺序)
pub fn get_plugins() -> &'static [Plugin] {
    PLUGINS.get_or_init(|| {
        vec![
            // 刷屏检测需要看到每条群消息，放在最前
            Plugin {
                name: "anti_flood",
                handler: anti_flood::handle,
                on_init: None,
                on_connected: None,
                default_config: anti_flood::default_config,
            },
            Plugin {
                name: "help",
                handler: help::handle,
                on_init: None,
                on_connected: None,
                default_config: help::default_config,
            },
            Plugin {
                name: "imgtag",
                handler: imgtag::handle,
                on_init: Some(imgtag::init),
                on_connected: None,
                default_config: imgtag::default_config,
            },
            Plugin {
                name: "ai_voice",
                handler: ai_voice::handle,
                on_init: None,
                on_connected: None,
                default_config: ai_voice::default_config,
            },
            Plugin {
                name: "poke",
                handler: poke::handle,
                on_init: Some(poke::init),
                on_connected: None,
                default_config: poke::default_config,
            },
            // `#cc` 前缀最宽，放在最后
            Plugin {
                name: "banana",
                handler: banana::handle,
                on_init: Some(banana::init),
                on_connected: None,
                default_config: banana::default_config,
            },
        ]
    })
}

fn enabled_plugins(ctx: &Context) -> HashSet<String> {
    let guard = ctx.config.read().unwrap_or_else(PoisonError::into_inner);
    guard
        .plugins
        .iter()
        .filter(|(_, v)| v.get("enabled").and_then(|x| x.as_bool()).unwrap_or(false))
        .map(|(k, _)| k.clone())
        .collect()
}

/// 执行所有插件的初始化逻辑
pub async fn do_init(ctx: Context) -> Result<(), PluginError> {
    let plugins = get_plugins();
    let enabled = enabled_plugins(&ctx);

    info!(
        target: "System",
        "正在加载插件系统 (已启用 {}/{})",
        enabled.len(),
        plugins.len()
    );

    for plugin in plugins {
        if !enabled.contains(plugin.name) {
            continue;
        }

        if let Some(init_fn) = plugin.on_init {
            match init_fn(ctx.with_event(EventType::Init)).await {
                Ok(_) => {
                    info!(target: "Plugin", "✅ [{}] 就绪 (Init Success)", plugin.name);
                }
                Err(e) => {
                    error!(target: "Plugin", "❌ [{}] 初始化失败: {}", plugin.name, e);
                }
            }
        } else {
            info!(target: "Plugin", "✅ [{}] 就绪", plugin.name);
        }
    }
    Ok(())
}

/// 当 Bot 连接建立后触发
pub async fn do_connected(ctx: Context, writer: LockedWriter) -> Result<(), PluginError> {
    let enabled = enabled_plugins(&ctx);

    for plugin in get_plugins() {
        if !enabled.contains(plugin.name) {
            continue;
        }

        if let Some(conn_fn) = plugin.on_connected {
            if let Err(e) = conn_fn(ctx.clone(), writer.clone()).await {
                error!(target: "Plugin", "❌ [{}] 连接钩子执行失败: {}", plugin.name, e);
            } else {
                info!(target: "Plugin", "🔗 [{}] 连接钩子已触发", plugin.name);
            }
        }
    }
    Ok(())
}

/// 运行插件流水线
pub async fn run(mut ctx: Context, writer: LockedWriter) -> Result<(), PluginError> {
    // 黑白名单只拦截入站事件，发送包照常放行
    if let EventType::Onebot(_) = &ctx.event {
        let allowed = ctx
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .global_filter
            .allows(ctx.group_id());
        if !allowed {
            debug!(target: "Plugin", "群 {:?} 被全局过滤", ctx.group_id());
            return Ok(());
        }
    }

    let enabled = enabled_plugins(&ctx);

    for plugin in get_plugins() {
        if !enabled.contains(plugin.name) {
            continue;
        }

        match (plugin.handler)(ctx, writer.clone()).await? {
            Some(next_ctx) => {
                ctx = next_ctx;
            }
            None => return Ok(()),
        }
    }

    if let EventType::BeforeSend(packet) = ctx.event {
        let json_str = simd_json::to_string(&packet)?;
        send_frame_raw(writer, json_str).await?;
    }

    Ok(())
}

// ================= 工具函数 =================

/// 插件数据目录: <程序目录>/data/<plugin>
pub async fn get_data_dir(plugin_name: &str) -> Result<PathBuf, PluginError> {
    let mut path = std::env::current_exe()?
        .parent()
        .ok_or("Cannot get parent dir")?
        .to_path_buf();
    path.push("data");
    path.push(plugin_name);
    if !path.exists() {
        fs::create_dir_all(&path).await?;
    }
    Ok(path)
}

/// 读取插件配置表；缺失或格式错误时返回 None
pub fn get_config<T>(ctx: &Context, plugin_name: &str) -> Option<T>
where
    T: DeserializeOwned,
{
    let guard = ctx.config.read().unwrap_or_else(PoisonError::into_inner);
    guard
        .plugins
        .get(plugin_name)
        .and_then(|v| T::deserialize(v.clone()).ok())
}

/// 读取插件配置，失败时使用插件默认配置
pub fn config_or_default<T>(ctx: &Context, plugin_name: &str, default: fn() -> Value) -> T
where
    T: DeserializeOwned + Default,
{
    get_config(ctx, plugin_name)
        .or_else(|| T::deserialize(default()).ok())
        .unwrap_or_default()
}

