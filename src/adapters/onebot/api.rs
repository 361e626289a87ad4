// 引用同模块下的工具函数
use super::{LockedWriter, send_frame_raw};
use crate::event::{Context, Event};
use crate::message::Message;
use crate::warn;
use serde::{Deserialize, Serialize};
use simd_json::OwnedValue;
use simd_json::derived::{ValueObjectAccess, ValueObjectAccessAsScalar};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub type ApiError = Box<dyn std::error::Error + Send + Sync>;

static ECHO_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_echo() -> String {
    let count = ECHO_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("api-req-{}", count)
}

/// QQ 头像地址
pub fn avatar_url(user_id: i64) -> String {
    format!("https://q1.qlogo.cn/g?b=qq&nk={}&s=640", user_id)
}

#[derive(Serialize)]
struct ApiRequest<T> {
    action: String,
    params: T,
    echo: String,
}

/// 通用 API 调用函数，按 echo 等待响应并反序列化 data
pub async fn call_action<P, R>(
    ctx: &Context,
    writer: LockedWriter,
    action: &str,
    params: P,
) -> Result<R, ApiError>
where
    P: Serialize,
    R: serde::de::DeserializeOwned,
{
    let echo = next_echo();
    let req = ApiRequest {
        action: action.to_string(),
        params,
        echo: echo.clone(),
    };

    let json_str = simd_json::to_string(&req)?;

    // 先注册等待者再发送，避免响应先到
    let wait_future = ctx.matcher.wait_resp(echo, Duration::from_secs(60));
    let (resp, sent) = tokio::join!(wait_future, send_frame_raw(writer, json_str));
    sent?;
    let resp_event = resp.ok_or_else(|| format!("API 请求超时: {}", action))?;

    let data_val = check_response(action, resp_event)?;
    let data: R = simd_json::serde::from_owned_value(data_val)?;
    Ok(data)
}

/// 校验响应帧: { status, retcode, data, echo }
fn check_response(action: &str, resp: Event) -> Result<OwnedValue, ApiError> {
    let retcode = resp
        .get_i64("retcode")
        .or_else(|| resp.get_u64("retcode").map(|v| v as i64))
        .unwrap_or(-1);

    if retcode != 0 {
        let msg = resp
            .get_str("wording")
            .or_else(|| resp.get_str("msg"))
            .unwrap_or("Unknown Error");
        warn!(target: "API", "{} 调用失败 (retcode={}): {}", action, retcode, msg);
        return Err(format!("API 调用失败 (retcode={}): {}", retcode, msg).into());
    }

    Ok(resp.get("data").cloned().unwrap_or(OwnedValue::from(())))
}

/// 不等待响应的 API 调用函数 (Fire-and-forget)
pub async fn call_action_no_wait<P>(
    writer: LockedWriter,
    action: &str,
    params: P,
) -> Result<(), ApiError>
where
    P: Serialize,
{
    let req = ApiRequest {
        action: action.to_string(),
        params,
        echo: next_echo(),
    };
    let json_str = simd_json::to_string(&req)?;
    send_frame_raw(writer, json_str).await?;
    Ok(())
}

// ================= API 定义 =================

// --- get_msg ---

#[derive(Serialize)]
struct GetMsgParams {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct MsgData {
    /// 原始消息段数组
    #[serde(default)]
    pub message: Vec<OwnedValue>,
}

pub async fn get_msg(
    ctx: &Context,
    writer: LockedWriter,
    message_id: i64,
) -> Result<MsgData, ApiError> {
    call_action(ctx, writer, "get_msg", GetMsgParams { message_id }).await
}

// --- get_login_info ---

#[derive(Serialize)]
struct GetLoginInfoParams {}

#[derive(Debug, Deserialize)]
pub struct LoginInfo {
    pub user_id: i64,
    pub nickname: String,
}

pub async fn get_login_info(ctx: &Context, writer: LockedWriter) -> Result<LoginInfo, ApiError> {
    call_action(ctx, writer, "get_login_info", GetLoginInfoParams {}).await
}

// --- set_group_ban ---

#[derive(Serialize)]
struct SetGroupBanParams {
    group_id: i64,
    user_id: i64,
    /// 秒，0 表示解除
    duration: i64,
}

pub async fn set_group_ban(
    writer: LockedWriter,
    group_id: i64,
    user_id: i64,
    duration: i64,
) -> Result<(), ApiError> {
    let params = SetGroupBanParams {
        group_id,
        user_id,
        duration,
    };
    call_action_no_wait(writer, "set_group_ban", params).await
}

// --- group_poke ---

#[derive(Serialize)]
struct GroupPokeParams {
    group_id: i64,
    user_id: i64,
}

pub async fn group_poke(writer: LockedWriter, group_id: i64, user_id: i64) -> Result<(), ApiError> {
    call_action_no_wait(writer, "group_poke", GroupPokeParams { group_id, user_id }).await
}

// --- get_ai_characters ---

#[derive(Serialize)]
struct GetAiCharactersParams {
    group_id: i64,
    chat_type: i32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AiCharacter {
    pub character_id: String,
    pub character_name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AiCharacterGroup {
    #[serde(rename = "type", default)]
    pub category: String,
    #[serde(default)]
    pub characters: Vec<AiCharacter>,
}

pub async fn get_ai_characters(
    ctx: &Context,
    writer: LockedWriter,
    group_id: i64,
) -> Result<Vec<AiCharacterGroup>, ApiError> {
    let params = GetAiCharactersParams {
        group_id,
        chat_type: 1,
    };
    call_action(ctx, writer, "get_ai_characters", params).await
}

// --- send_group_ai_record ---

#[derive(Serialize)]
struct SendGroupAiRecordParams<'a> {
    group_id: i64,
    character: &'a str,
    text: &'a str,
}

pub async fn send_group_ai_record(
    ctx: &Context,
    writer: LockedWriter,
    group_id: i64,
    character: &str,
    text: &str,
) -> Result<(), ApiError> {
    let params = SendGroupAiRecordParams {
        group_id,
        character,
        text,
    };
    call_action::<_, OwnedValue>(ctx, writer, "send_group_ai_record", params).await?;
    Ok(())
}

// --- send_forward_msg (group/private) ---

#[derive(Serialize)]
struct SendForwardMsgParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<i64>,
    messages: Message,
}

pub async fn send_forward_msg(
    ctx: &Context,
    writer: LockedWriter,
    group_id: Option<i64>,
    user_id: Option<i64>,
    messages: Message,
) -> Result<OwnedValue, ApiError> {
    let action = if group_id.is_some() {
        "send_group_forward_msg"
    } else {
        "send_private_forward_msg"
    };

    let params = SendForwardMsgParams {
        group_id,
        user_id,
        messages,
    };

    call_action(ctx, writer, action, params).await
}
