use crate::plugins::Plugin;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use toml::Value;

pub type ConfigError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    // 全局指令前缀（支持多个，如 ["#", "/"]）
    #[serde(default = "default_prefix")]
    pub command_prefix: Vec<String>,

    // 主人 QQ 列表，管理类指令仅对其开放
    #[serde(default)]
    pub master_qq: Vec<i64>,

    // 日志级别: debug / info / warn / error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // 全局群聊过滤配置
    #[serde(default)]
    pub global_filter: GlobalFilterConfig,

    // Bot 连接配置
    #[serde(default = "default_bots")]
    pub bots: Vec<BotConfig>,

    // 插件配置
    #[serde(flatten)]
    pub plugins: HashMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GlobalFilterConfig {
    #[serde(default)]
    pub enable_blacklist: bool,
    #[serde(default)]
    pub blacklist: Vec<i64>,

    #[serde(default)]
    pub enable_whitelist: bool,
    #[serde(default)]
    pub whitelist: Vec<i64>,
}

impl GlobalFilterConfig {
    /// 判断某个群是否允许触发插件 (私聊与通知中无群号时一律放行)
    pub fn allows(&self, group_id: Option<i64>) -> bool {
        let Some(gid) = group_id else {
            return true;
        };
        if self.enable_whitelist && !self.whitelist.contains(&gid) {
            return false;
        }
        if self.enable_blacklist && self.blacklist.contains(&gid) {
            return false;
        }
        true
    }
}

impl AppConfig {
    pub async fn save(&self, path: &str) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        fs::write(path, toml_string).await?;
        Ok(())
    }

    pub fn is_master(&self, user_id: i64) -> bool {
        self.master_qq.contains(&user_id)
    }

    /// 为缺失的插件补齐默认配置，返回是否有改动
    pub fn merge_plugin_defaults(&mut self, plugins: &[Plugin]) -> bool {
        let mut changed = false;
        for plugin in plugins {
            if !self.plugins.contains_key(plugin.name) {
                self.plugins
                    .insert(plugin.name.to_string(), (plugin.default_config)());
                changed = true;
            }
        }
        changed
    }
}

/// 读取配置文件；不存在时生成默认配置并写回磁盘
pub async fn load_or_init(path: &str, plugins: &[Plugin]) -> Result<AppConfig, ConfigError> {
    let mut config = if Path::new(path).exists() {
        let raw = fs::read_to_string(path).await?;
        toml::from_str::<AppConfig>(&raw)?
    } else {
        AppConfig::default()
    };

    if config.merge_plugin_defaults(plugins) || !Path::new(path).exists() {
        config.save(path).await?;
    }
    Ok(config)
}

fn default_prefix() -> Vec<String> {
    vec!["#".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bots() -> Vec<BotConfig> {
    vec![BotConfig {
        enabled: true,
        protocol: "onebot".to_string(),
        url: Some("ws://127.0.0.1:3001".to_string()),
        access_token: Some(String::new()),
    }]
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BotConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    // 协议类型 (目前仅支持 "onebot")
    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_protocol() -> String {
    "onebot".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            command_prefix: default_prefix(),
            master_qq: Vec::new(),
            log_level: default_log_level(),
            global_filter: GlobalFilterConfig::default(),
            bots: default_bots(),
            plugins: HashMap::new(),
        }
    }
}

/// 辅助函数：构建默认配置 Value，并确保包含 enabled 字段
pub fn build_config<T: Serialize>(data: T) -> Value {
    let mut val = Value::try_from(data).unwrap_or(Value::Table(Default::default()));
    if let Value::Table(ref mut map) = val
        && !map.contains_key("enabled")
    {
        map.insert("enabled".to_string(), Value::Boolean(true));
    }
    val
}
