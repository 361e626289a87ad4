use crate::adapters::onebot::{LockedWriter, api, reply};
use crate::config::build_config;
use crate::event::{Context, Event};
use crate::message::Message;
use crate::plugins::{PluginError, config_or_default};
use crate::{debug, info, warn};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use simd_json::derived::{ValueObjectAccess, ValueObjectAccessAsScalar};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use toml::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct Config {
    enabled: bool,
    /// 连续相同消息超过该次数即禁言
    ban_count: u32,
    mute_minutes: u32,
    window_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            ban_count: 4,
            mute_minutes: 1,
            window_secs: 3600,
        }
    }
}

pub fn default_config() -> Value {
    build_config(Config::default())
}

struct FloodRecord {
    user_id: i64,
    fingerprint: String,
    count: u32,
    expires_at: Instant,
}

/// 每个群只记住最后一位发言者的连续重复情况
#[derive(Default)]
pub struct FloodTracker {
    records: Mutex<HashMap<i64, FloodRecord>>,
}

impl FloodTracker {
    /// 记录一条群消息，返回 Some(次数) 表示需要禁言 (记录随之清除)
    pub fn observe(
        &self,
        group_id: i64,
        user_id: i64,
        fingerprint: &str,
        now: Instant,
        window: Duration,
        ban_count: u32,
    ) -> Option<u32> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        let count = match records.get_mut(&group_id) {
            Some(rec) if rec.expires_at > now => {
                if rec.user_id == user_id && rec.fingerprint == fingerprint {
                    rec.count += 1;
                } else {
                    rec.user_id = user_id;
                    rec.fingerprint = fingerprint.to_string();
                    rec.count = 1;
                }
                rec.expires_at = now + window;
                rec.count
            }
            _ => {
                records.insert(
                    group_id,
                    FloodRecord {
                        user_id,
                        fingerprint: fingerprint.to_string(),
                        count: 1,
                        expires_at: now + window,
                    },
                );
                1
            }
        };

        if count > ban_count {
            records.remove(&group_id);
            Some(count)
        } else {
            None
        }
    }
}

fn tracker() -> &'static FloodTracker {
    static TRACKER: OnceLock<FloodTracker> = OnceLock::new();
    TRACKER.get_or_init(FloodTracker::default)
}

/// 消息指纹: 每段 `类型-内容`，以 `:` 连接
pub fn fingerprint(segments: &[Event]) -> String {
    segments
        .iter()
        .map(|seg| {
            let type_ = seg.get_str("type").unwrap_or("");
            let data = seg.get("data");
            let field = |key: &str| data.and_then(|d| d.get_str(key)).unwrap_or("");
            let content = match type_ {
                "text" => field("text"),
                "image" => {
                    let name = field("name");
                    if name.is_empty() { field("file") } else { name }
                }
                _ => field("name"),
            };
            format!("{}-{}", type_, content)
        })
        .collect::<Vec<_>>()
        .join(":")
        .trim()
        .to_string()
}

pub fn handle(
    ctx: Context,
    writer: LockedWriter,
) -> BoxFuture<'static, Result<Option<Context>, PluginError>> {
    Box::pin(async move {
        let Some(msg) = ctx.as_message() else {
            return Ok(Some(ctx));
        };
        let Some(group_id) = msg.group_id().filter(|_| msg.is_group()) else {
            return Ok(Some(ctx));
        };
        let user_id = msg.user_id();
        let print = fingerprint(msg.segments());

        let config: Config = config_or_default(&ctx, "anti_flood", default_config);
        let verdict = tracker().observe(
            group_id,
            user_id,
            &print,
            Instant::now(),
            Duration::from_secs(config.window_secs),
            config.ban_count,
        );

        let Some(count) = verdict else {
            debug!(target: "AntiFlood", "群 {} 用户 {} 消息已记录", group_id, user_id);
            return Ok(Some(ctx));
        };

        info!(
            target: "AntiFlood",
            "群 {} 用户 {} 连续刷屏 {} 次，禁言 {} 分钟",
            group_id, user_id, count, config.mute_minutes
        );
        let seconds = i64::from(config.mute_minutes) * 60;
        if let Err(e) = api::set_group_ban(writer.clone(), group_id, user_id, seconds).await {
            warn!(target: "AntiFlood", "禁言失败: {}", e);
        }
        reply(
            &ctx,
            writer,
            Message::new()
                .at(user_id)
                .text(format!(" 因刷屏被禁言{}分钟", config.mute_minutes)),
        )
        .await?;
        Ok(None)
    })
}
