mod adapters;
mod command;
mod config;
mod event;
mod log;
mod matcher;
mod message;
mod plugins;
mod scheduler;

use adapters::{Runtime, find_adapter};
use event::{BotStatus, EventType};
use matcher::Matcher;
use std::sync::Arc;

const CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| CONFIG_PATH.to_string());

    let app_config = config::load_or_init(&config_path, plugins::get_plugins()).await?;

    match log::Level::parse(&app_config.log_level) {
        Some(level) => log::set_level(level),
        None => warn!("未知的日志级别 {:?}，使用 info", app_config.log_level),
    }
    info!("配置已加载: {}", config_path);

    let bots = app_config.bots.clone();
    let runtime = Runtime::new(app_config, config_path);

    let init_ctx = runtime.context(
        EventType::Init,
        Arc::new(Matcher::new()),
        BotStatus {
            adapter: "system".to_string(),
            platform: "internal".to_string(),
            ..Default::default()
        },
    );
    plugins::do_init(init_ctx).await?;

    let mut handles = Vec::new();
    for bot in bots.into_iter().filter(|b| b.enabled) {
        match find_adapter(&bot.protocol) {
            Some(adapter) => {
                handles.push(tokio::spawn((adapter.handler)(bot, runtime.clone())));
            }
            None => error!("未知的协议: {}", bot.protocol),
        }
    }

    if handles.is_empty() {
        warn!("没有启用的 Bot 连接，请检查 config.toml 中的 [[bots]]");
    }

    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，正在关闭...");
    runtime.scheduler.shutdown();
    for handle in handles {
        handle.abort();
    }
    Ok(())
}
