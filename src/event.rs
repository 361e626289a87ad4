use crate::config::AppConfig;
use crate::matcher::Matcher;
use crate::scheduler::Scheduler;
use serde::{Deserialize, Serialize};
use simd_json::OwnedValue;
use simd_json::derived::{ValueObjectAccessAsArray, ValueObjectAccessAsScalar};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex as AsyncMutex;

pub type Event = OwnedValue;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoginUser {
    pub id: String,
    pub name: Option<String>,
    pub nick: Option<String>,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BotStatus {
    pub adapter: String,
    pub platform: String,
    pub bot: LoginUser,
}

/// 统一的上下文，包含事件数据、可变配置和任务调度器
/// event 字段直接持有 EventType，插件链中通过 Move 传递，允许插件改写事件。
#[derive(Clone)]
pub struct Context {
    pub event: EventType,
    pub config: Arc<RwLock<AppConfig>>,
    pub config_save_lock: Arc<AsyncMutex<()>>,
    pub scheduler: Arc<Scheduler>,
    pub matcher: Arc<Matcher>,
    pub config_path: String,
    pub bot: BotStatus,
}

impl Context {
    /// 以相同的运行环境派生一个新事件的上下文
    pub fn with_event(&self, event: EventType) -> Context {
        Context {
            event,
            config: self.config.clone(),
            config_save_lock: self.config_save_lock.clone(),
            scheduler: self.scheduler.clone(),
            matcher: self.matcher.clone(),
            config_path: self.config_path.clone(),
            bot: self.bot.clone(),
        }
    }

    pub fn with_bot(mut self, bot: BotStatus) -> Context {
        self.bot = bot;
        self
    }

    /// 尝试将当前事件视为 OneBot 消息事件
    pub fn as_message(&self) -> Option<MessageEvent<'_>> {
        if let EventType::Onebot(event) = &self.event
            && GeneralEventView(event).post_type() == Some("message")
        {
            return Some(MessageEvent(event));
        }
        None
    }

    /// 尝试将当前事件视为戳一戳通知
    pub fn as_poke(&self) -> Option<PokeEvent<'_>> {
        if let EventType::Onebot(event) = &self.event {
            let view = GeneralEventView(event);
            if view.post_type() == Some("notice")
                && event.get_str("notice_type") == Some("notify")
                && event.get_str("sub_type") == Some("poke")
            {
                return Some(PokeEvent(event));
            }
        }
        None
    }

    /// 当前事件所属群号 (消息与通知均可)
    pub fn group_id(&self) -> Option<i64> {
        match &self.event {
            EventType::Onebot(event) => read_i64(event, "group_id"),
            EventType::BeforeSend(packet) => packet.group_id(),
            EventType::Init => None,
        }
    }

    /// Bot 自身 QQ
    pub fn self_id(&self) -> i64 {
        if let EventType::Onebot(event) = &self.event
            && let Some(id) = read_i64(event, "self_id")
        {
            return id;
        }
        self.bot.bot.id.parse().unwrap_or(0)
    }

    pub fn is_master(&self, user_id: i64) -> bool {
        self.config
            .read()
            .map(|c| c.is_master(user_id))
            .unwrap_or(false)
    }
}

/// 兼容 i64 / u64 两种编码的数字字段
pub fn read_i64(value: &Event, key: &str) -> Option<i64> {
    value
        .get_i64(key)
        .or_else(|| value.get_u64(key).map(|v| v as i64))
        .or_else(|| value.get_str(key).and_then(|s| s.parse().ok()))
}

// ================== 事件封装工具 ==================

/// 通用事件视图，用于快速访问基础字段
pub struct GeneralEventView<'a>(&'a Event);

impl<'a> GeneralEventView<'a> {
    pub fn post_type(&self) -> Option<&'a str> {
        self.0.get_str("post_type")
    }
}

/// 消息事件封装，提供便捷的强类型访问
pub struct MessageEvent<'a>(pub &'a Event);

impl<'a> MessageEvent<'a> {
    /// 获取群号 (如果是群消息)
    pub fn group_id(&self) -> Option<i64> {
        read_i64(self.0, "group_id")
    }

    pub fn user_id(&self) -> i64 {
        read_i64(self.0, "user_id").unwrap_or(0)
    }

    pub fn message_id(&self) -> i64 {
        read_i64(self.0, "message_id").unwrap_or(0)
    }

    pub fn is_group(&self) -> bool {
        self.0.get_str("message_type") == Some("group")
    }

    /// 消息段数组
    pub fn segments(&self) -> &'a [Event] {
        self.0
            .get_array("message")
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// 戳一戳通知封装
pub struct PokeEvent<'a>(pub &'a Event);

impl<'a> PokeEvent<'a> {
    pub fn group_id(&self) -> Option<i64> {
        read_i64(self.0, "group_id")
    }

    /// 发起者，部分实现只给 user_id
    pub fn operator_id(&self) -> i64 {
        read_i64(self.0, "operator_id")
            .or_else(|| read_i64(self.0, "user_id"))
            .unwrap_or(0)
    }

    pub fn target_id(&self) -> i64 {
        read_i64(self.0, "target_id").unwrap_or(0)
    }

    pub fn self_id(&self) -> i64 {
        read_i64(self.0, "self_id").unwrap_or(0)
    }
}

// ================== 基础结构定义 ==================

#[derive(Debug, Clone)]
pub enum EventType {
    /// 来自 OneBot 的原始事件
    Onebot(Event),
    /// 插件准备发送消息前的拦截事件
    BeforeSend(SendPacket),
    /// 系统初始化事件 (用于插件 on_init 生命周期)
    Init,
}

/// 发送包结构，用于在 BeforeSend 中传递
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SendPacket {
    pub action: String,
    pub params: OwnedValue,
    /// 原始触发事件（不参与序列化发送给 Bot）
    #[serde(skip)]
    pub original_event: Option<Event>,
}

impl SendPacket {
    pub fn group_id(&self) -> Option<i64> {
        read_i64(&self.params, "group_id")
    }
}
