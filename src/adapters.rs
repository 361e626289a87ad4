use crate::config::{AppConfig, BotConfig};
use crate::event::{BotStatus, Context, EventType};
use crate::matcher::Matcher;
use crate::scheduler::Scheduler;
use futures_util::future::BoxFuture;
use std::sync::{Arc, OnceLock, RwLock};
use tokio::sync::Mutex as AsyncMutex;

pub mod onebot;

/// 所有连接共享的运行环境
#[derive(Clone)]
pub struct Runtime {
    pub config: Arc<RwLock<AppConfig>>,
    pub save_lock: Arc<AsyncMutex<()>>,
    pub scheduler: Arc<Scheduler>,
    pub config_path: String,
}

impl Runtime {
    pub fn new(config: AppConfig, config_path: impl Into<String>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            save_lock: Arc::new(AsyncMutex::new(())),
            scheduler: Arc::new(Scheduler::new()),
            config_path: config_path.into(),
        }
    }

    /// 基于共享环境构建一次事件处理的上下文
    pub fn context(&self, event: EventType, matcher: Arc<Matcher>, bot: BotStatus) -> Context {
        Context {
            event,
            config: self.config.clone(),
            config_save_lock: self.save_lock.clone(),
            scheduler: self.scheduler.clone(),
            matcher,
            config_path: self.config_path.clone(),
            bot,
        }
    }
}

/// 适配器处理函数签名
pub type AdapterHandler = fn(BotConfig, Runtime) -> BoxFuture<'static, ()>;

/// 适配器定义
pub struct Adapter {
    /// 协议名称 (如 "onebot")，在配置文件中通过 protocol 字段指定
    pub protocol: &'static str,
    /// 启动处理函数
    pub handler: AdapterHandler,
}

static ADAPTERS: OnceLock<Vec<Adapter>> = OnceLock::new();

/// 获取所有注册的适配器
pub fn get_adapters() -> &'static [Adapter] {
    ADAPTERS.get_or_init(|| {
        vec![Adapter {
            protocol: "onebot",
            handler: onebot::entry,
        }]
    })
}

/// 根据协议名称查找适配器
pub fn find_adapter(protocol: &str) -> Option<&'static Adapter> {
    get_adapters().iter().find(|a| a.protocol == protocol)
}
