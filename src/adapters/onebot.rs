use super::Runtime;
use crate::config::BotConfig;
use crate::event::{BotStatus, Context, Event, EventType, LoginUser, SendPacket};
use crate::matcher::Matcher;
use crate::message::Message;
use crate::{error, info, plugins, warn};
use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, StreamExt};
use http::HeaderValue;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};

pub mod api;

pub type BotError = Box<dyn std::error::Error + Send + Sync>;

pub type TraitSink =
    Box<dyn Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin>;
pub type LockedWriter = Arc<AsyncMutex<TraitSink>>;

#[derive(Serialize)]
struct SendParamsInner<T> {
    message_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<i64>,
    message: T,
}

/// 适配器入口函数 (Adapter Entry)
pub fn entry(bot_config: BotConfig, runtime: Runtime) -> BoxFuture<'static, ()> {
    Box::pin(async move { run_bot_loop(bot_config, runtime).await })
}

/// OneBot 协议的主循环逻辑，断线后 3 秒重连
pub async fn run_bot_loop(bot_config: BotConfig, runtime: Runtime) {
    let bot_url = bot_config
        .url
        .clone()
        .unwrap_or_else(|| "Unknown".to_string());
    loop {
        match connect_and_listen(&bot_config, runtime.clone()).await {
            Ok(()) => warn!(target: "Bot", "Bot [{}] 连接断开，3秒后重连...", bot_url),
            Err(e) => {
                error!(target: "Bot", "Bot [{}] 连接失败: {}。3秒后重试...", bot_url, e)
            }
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
}

async fn connect_and_listen(config: &BotConfig, runtime: Runtime) -> Result<(), BotError> {
    let url = config.url.as_deref().ok_or("OneBot URL 未配置")?;

    let mut request = url.into_client_request()?;
    if let Some(token) = &config.access_token
        && !token.is_empty()
    {
        let token_header = format!("Bearer {}", token);
        request
            .headers_mut()
            .insert("Authorization", HeaderValue::from_str(&token_header)?);
    }

    let (ws_stream, _) = connect_async(request).await?;
    info!(target: "Bot", "Bot [{}] 连接成功！(OneBot)", url);

    let (write_half, mut read_half) = ws_stream.split();

    let writer: LockedWriter = Arc::new(AsyncMutex::new(Box::new(write_half)));
    let matcher = Arc::new(Matcher::new());

    let bot_status = Arc::new(RwLock::new(BotStatus {
        adapter: "onebot".to_string(),
        platform: "qq".to_string(),
        bot: LoginUser {
            id: "0".to_string(),
            ..Default::default()
        },
    }));

    // 后台获取登录信息，随后触发插件的连接钩子
    tokio::spawn(fetch_login_info(
        runtime.clone(),
        writer.clone(),
        matcher.clone(),
        bot_status.clone(),
    ));

    while let Some(message) = read_half.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                let mut data = text.as_bytes().to_vec();
                let writer = writer.clone();
                let runtime = runtime.clone();
                let matcher = matcher.clone();
                let status = snapshot(&bot_status);

                tokio::spawn(async move {
                    if let Err(e) = process_frame(&mut data, writer, runtime, matcher, status).await
                    {
                        error!(target: "Bot", "事件处理失败: {}", e);
                    }
                });
            }
            Ok(WsMessage::Close(_)) => return Ok(()),
            Err(e) => return Err(Box::new(e)),
            _ => {}
        }
    }
    Ok(())
}

fn snapshot(status: &RwLock<BotStatus>) -> BotStatus {
    status
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

async fn fetch_login_info(
    runtime: Runtime,
    writer: LockedWriter,
    matcher: Arc<Matcher>,
    status: Arc<RwLock<BotStatus>>,
) {
    // 等待连接稳定
    tokio::time::sleep(Duration::from_secs(1)).await;

    let ctx = runtime.context(EventType::Init, matcher, snapshot(&status));
    match api::get_login_info(&ctx, writer.clone()).await {
        Ok(login) => {
            let mut guard = status.write().unwrap_or_else(PoisonError::into_inner);
            guard.bot.id = login.user_id.to_string();
            guard.bot.name = Some(login.nickname.clone());
            guard.bot.nick = Some(login.nickname);
            guard.bot.avatar = Some(api::avatar_url(login.user_id));
            info!(
                target: "Bot",
                "已获取登录信息: {} ({})",
                guard.bot.name.as_deref().unwrap_or("Unknown"),
                guard.bot.id
            );
        }
        Err(e) => {
            warn!(target: "Bot", "获取登录信息失败: {}", e);
        }
    }

    let ctx = ctx.with_bot(snapshot(&status));
    if let Err(e) = plugins::do_connected(ctx, writer).await {
        error!(target: "Bot", "连接钩子执行失败: {}", e);
    }
}

pub async fn process_frame(
    data: &mut [u8],
    writer: LockedWriter,
    runtime: Runtime,
    matcher: Arc<Matcher>,
    bot: BotStatus,
) -> Result<(), BotError> {
    let event: Event = match simd_json::to_owned_value(data) {
        Ok(v) => v,
        Err(_) => return Ok(()),
    };

    // 优先交给 API 响应等待者
    let event = match matcher.dispatch(event).await {
        Some(e) => e,
        None => return Ok(()),
    };

    let ctx = runtime.context(EventType::Onebot(event), matcher, bot);
    plugins::run(ctx, writer).await?;
    Ok(())
}

/// 发送消息：经过 BeforeSend 流水线后写入连接
pub async fn send_msg<M>(
    ctx: &Context,
    writer: LockedWriter,
    group_id: Option<i64>,
    user_id: Option<i64>,
    message: M,
) -> Result<(), BotError>
where
    M: Serialize,
{
    let (msg_type, target_group, target_user) = if let Some(gid) = group_id.filter(|&id| id != 0) {
        ("group", Some(gid), None)
    } else if let Some(uid) = user_id.filter(|&id| id != 0) {
        ("private", None, Some(uid))
    } else {
        return Ok(());
    };

    let params = SendParamsInner {
        message_type: msg_type,
        group_id: target_group,
        user_id: target_user,
        message,
    };

    let mut json_bytes = simd_json::to_string(&params)?.into_bytes();
    let params_val = simd_json::to_owned_value(&mut json_bytes)?;

    let original_event = match &ctx.event {
        EventType::Onebot(ev) => Some(ev.clone()),
        EventType::BeforeSend(pkt) => pkt.original_event.clone(),
        EventType::Init => None,
    };

    let packet = SendPacket {
        action: "send_msg".to_string(),
        params: params_val,
        original_event,
    };

    plugins::run(ctx.with_event(EventType::BeforeSend(packet)), writer).await?;
    Ok(())
}

/// 回复当前消息/通知所在的会话 (群聊优先，否则私聊)
pub async fn reply(
    ctx: &Context,
    writer: LockedWriter,
    message: impl Into<Message>,
) -> Result<(), BotError> {
    let user_id = match &ctx.event {
        EventType::Onebot(ev) => crate::event::read_i64(ev, "user_id"),
        _ => None,
    };
    send_msg(ctx, writer, ctx.group_id(), user_id, message.into()).await
}

pub async fn send_frame_raw(writer: LockedWriter, json_str: String) -> Result<(), BotError> {
    let mut guard = writer.lock().await;
    guard.send(WsMessage::Text(json_str.into())).await?;
    Ok(())
}
