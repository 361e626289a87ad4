use crate::adapters::onebot::{LockedWriter, api, reply};
use crate::command::match_command;
use crate::config::build_config;
use crate::event::Context;
use crate::message::Message;
use crate::plugins::{PluginError, ai_voice, config_or_default, get_data_dir, imgtag};
use crate::{debug, info, warn};
use futures_util::future::BoxFuture;
use rand::Rng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use toml::Value;

const REPEAT_WINDOW: Duration = Duration::from_secs(3);
const MUTE_SECS: i64 = 60;

const VOICE_CLIPS: [&str; 4] = [
    "http://api.yujn.cn/api/duiren.php?",
    "http://api.yujn.cn/api/yujie.php?",
    "http://api.yujn.cn/api/lvcha.php?",
    "http://api.yujn.cn/api/maren.php?",
];

const MEMES: [&str; 15] = [
    "bubu",
    "cheems",
    "xiaokonglong",
    "ameng",
    "fox",
    "kabo",
    "kuluomi",
    "longtu",
    "mogutou",
    "paidaxing",
    "panda",
    "xiaohuangji",
    "xiaohuihui",
    "xiaodouni",
    "jixuanyou",
];

/// 各反应的概率，总和不足 1 的部分为反戳
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct Config {
    enabled: bool,
    reply_text: f64,
    reply_img: f64,
    reply_file: f64,
    reply_voice: f64,
    mute: f64,
    /// 文字回复改用 AI 声聊的概率
    text_as_voice: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            reply_text: 0.4,
            reply_img: 0.1,
            reply_file: 0.2,
            reply_voice: 0.1,
            mute: 0.1,
            text_as_voice: 0.6,
        }
    }
}

pub fn default_config() -> Value {
    build_config(Config::default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    Text,
    Image,
    LocalFile,
    Voice,
    Mute,
    CounterPoke,
}

impl Config {
    /// `roll` 取值 [0, 1)
    fn pick(&self, roll: f64) -> Reaction {
        let table = [
            (self.reply_text, Reaction::Text),
            (self.reply_img, Reaction::Image),
            (self.reply_file, Reaction::LocalFile),
            (self.reply_voice, Reaction::Voice),
            (self.mute, Reaction::Mute),
        ];
        let mut acc = 0.0;
        for (weight, reaction) in table {
            acc += weight.max(0.0);
            if roll < acc {
                return reaction;
            }
        }
        Reaction::CounterPoke
    }

    /// 合法的语音概率，非有限值按 0 处理
    fn voice_chance(&self) -> f64 {
        if self.text_as_voice.is_finite() {
            self.text_as_voice.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

// ================== 连戳限制 ==================

/// 同一群内 (操作者, 目标) 的连戳计数，每次戳都会刷新有效期
#[derive(Default)]
pub struct RepeatGuard {
    hits: Mutex<HashMap<(i64, i64, i64), (u32, Instant)>>,
}

impl RepeatGuard {
    /// 返回 true 表示本次为窗口内第三次及以上
    pub fn hit(&self, key: (i64, i64, i64), now: Instant, window: Duration) -> bool {
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        hits.retain(|_, (_, expires)| *expires > now);

        match hits.get_mut(&key) {
            Some((count, _)) if *count >= 2 => true,
            Some((count, expires)) => {
                *count += 1;
                *expires = now + window;
                false
            }
            None => {
                hits.insert(key, (1, now + window));
                false
            }
        }
    }
}

fn guard() -> &'static RepeatGuard {
    static GUARD: OnceLock<RepeatGuard> = OnceLock::new();
    GUARD.get_or_init(RepeatGuard::default)
}

// ================== 台词 ==================

#[derive(Debug, Default, Deserialize)]
struct WordList {
    #[serde(default)]
    data: Vec<String>,
}

/// `poke_words.json`: `{ "bot": {"data": [...]}, "<qq>": {"data": [...]} }`
#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct PokeWords(HashMap<String, WordList>);

impl PokeWords {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn lines(&self, key: &str) -> &[String] {
        self.0.get(key).map(|w| w.data.as_slice()).unwrap_or(&[])
    }

    pub fn random(&self, key: &str) -> Option<String> {
        self.lines(key).choose(&mut rand::rng()).cloned()
    }
}

static WORDS: OnceLock<PokeWords> = OnceLock::new();

fn words() -> Option<&'static PokeWords> {
    WORDS.get()
}

pub fn init(_ctx: Context) -> BoxFuture<'static, Result<(), PluginError>> {
    Box::pin(async move {
        let path = get_data_dir("poke").await?.join("poke_words.json");
        let words = match tokio::fs::read_to_string(&path).await {
            Ok(text) => PokeWords::parse(&text)?,
            Err(_) => {
                warn!(target: "Poke", "未找到 {}，戳一戳台词为空", path.display());
                PokeWords::default()
            }
        };
        info!(target: "Poke", "已加载 {} 组戳一戳台词", words.0.len());
        if WORDS.set(words).is_err() {
            warn!(target: "Poke", "戳一戳台词已经被加载");
        }
        Ok(())
    })
}

// ================== 反应 ==================

async fn react_to_bot(
    ctx: &Context,
    writer: LockedWriter,
    config: &Config,
    group_id: i64,
    operator_id: i64,
) -> Result<(), PluginError> {
    let roll: f64 = rand::rng().random();
    let reaction = config.pick(roll);
    debug!(target: "Poke", "群 {} 戳 Bot，反应 {:?}", group_id, reaction);

    match reaction {
        Reaction::Text => {
            let Some(line) = words().and_then(|w| w.random("bot")) else {
                return Ok(());
            };
            let as_voice = rand::rng().random_bool(config.voice_chance());
            if as_voice {
                if let Err(e) = ai_voice::send_voice(ctx, writer.clone(), group_id, &line).await {
                    warn!(target: "Poke", "AI 语音发送失败，改为文字: {}", e);
                    reply(ctx, writer, line).await?;
                }
            } else {
                reply(ctx, writer, line).await?;
            }
        }
        Reaction::Image => {
            let tag = if rand::rng().random_bool(0.5) { "生气" } else { "喜欢" };
            let image = match imgtag::random_tagged(ctx, &[tag.to_string()]).await {
                Some(path) => path,
                None => {
                    let meme = MEMES.choose(&mut rand::rng()).copied().unwrap_or("bubu");
                    format!("http://hanhan.avocado.wiki/?{}", meme)
                }
            };
            reply(ctx, writer, Message::new().image(image)).await?;
        }
        Reaction::LocalFile => match imgtag::random_local().await {
            Some(path) => {
                let file = format!("file://{}", path.display());
                reply(ctx, writer, Message::new().image(file)).await?;
            }
            None => warn!(target: "Poke", "本地图库为空"),
        },
        Reaction::Voice => {
            let clip = VOICE_CLIPS.choose(&mut rand::rng()).copied().unwrap_or(VOICE_CLIPS[0]);
            reply(ctx, writer, Message::new().record(clip)).await?;
        }
        Reaction::Mute => {
            if rand::rng().random_bool(0.5) {
                reply(ctx, writer.clone(), "说了不要戳了！").await?;
                sleep(Duration::from_secs(1)).await;
                api::set_group_ban(writer.clone(), group_id, operator_id, MUTE_SECS).await?;
                sleep(Duration::from_secs(3)).await;
                reply(ctx, writer, "啧").await?;
            } else {
                for word in ["不！！", "准！！", "戳！！", "玉！！", "玉！！"] {
                    reply(ctx, writer.clone(), word).await?;
                    sleep(Duration::from_millis(500)).await;
                }
                api::set_group_ban(writer, group_id, operator_id, MUTE_SECS).await?;
            }
        }
        Reaction::CounterPoke => {
            reply(ctx, writer.clone(), "吃玉玉一咬!~").await?;
            sleep(Duration::from_millis(500)).await;
            api::group_poke(writer, group_id, operator_id).await?;
        }
    }
    Ok(())
}

async fn defend_master(
    ctx: &Context,
    writer: LockedWriter,
    group_id: i64,
    operator_id: i64,
) -> Result<(), PluginError> {
    if !rand::rng().random_bool(0.5) {
        return Ok(());
    }
    reply(ctx, writer.clone(), "不准戳主人！～，让你戳！").await?;
    sleep(Duration::from_millis(500)).await;
    api::group_poke(writer.clone(), group_id, operator_id).await?;
    reply(ctx, writer.clone(), "让你戳主人！我戳戳戳戳戳你！").await?;
    sleep(Duration::from_millis(500)).await;
    api::group_poke(writer, group_id, operator_id).await?;
    Ok(())
}

async fn on_poke(ctx: &Context, writer: LockedWriter) -> Result<bool, PluginError> {
    let Some((group_id, operator_id, target_id, self_id)) = ctx
        .as_poke()
        .and_then(|p| Some((p.group_id()?, p.operator_id(), p.target_id(), p.self_id())))
    else {
        return Ok(false);
    };
    if operator_id == 0 {
        return Ok(false);
    }

    if operator_id != self_id
        && guard().hit((group_id, operator_id, target_id), Instant::now(), REPEAT_WINDOW)
    {
        info!(target: "Poke", "群 {} 用户 {} 连续戳 {}，禁言", group_id, operator_id, target_id);
        api::set_group_ban(writer.clone(), group_id, operator_id, MUTE_SECS).await?;
        reply(ctx, writer, "有模块🐷咪，去小黑屋里吧！🐷🐷！").await?;
        return Ok(true);
    }

    let config: Config = config_or_default(ctx, "poke", default_config);
    if target_id == self_id {
        react_to_bot(ctx, writer, &config, group_id, operator_id).await?;
        return Ok(true);
    }
    if ctx.is_master(target_id) {
        if operator_id != self_id {
            defend_master(ctx, writer, group_id, operator_id).await?;
        }
        return Ok(true);
    }
    match words().and_then(|w| w.random(&target_id.to_string())) {
        Some(line) => {
            reply(ctx, writer, line).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub fn handle(
    ctx: Context,
    writer: LockedWriter,
) -> BoxFuture<'static, Result<Option<Context>, PluginError>> {
    Box::pin(async move {
        if ctx.as_poke().is_some() {
            return if on_poke(&ctx, writer).await? {
                Ok(None)
            } else {
                Ok(Some(ctx))
            };
        }

        let Some(cmd) = match_command(&ctx, "戳他") else {
            return Ok(Some(ctx));
        };
        let Some((group_id, user_id)) = ctx
            .as_message()
            .and_then(|m| Some((m.group_id()?, m.user_id())))
        else {
            return Ok(Some(ctx));
        };
        if !ctx.is_master(user_id) {
            return Ok(Some(ctx));
        }
        for target in cmd.at_ids {
            api::group_poke(writer.clone(), group_id, target).await?;
        }
        Ok(None)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_partition_the_roll() {
        let config = Config::default();
        assert_eq!(config.pick(0.0), Reaction::Text);
        assert_eq!(config.pick(0.39), Reaction::Text);
        assert_eq!(config.pick(0.45), Reaction::Image);
        assert_eq!(config.pick(0.65), Reaction::LocalFile);
        assert_eq!(config.pick(0.75), Reaction::Voice);
        assert_eq!(config.pick(0.85), Reaction::Mute);
        assert_eq!(config.pick(0.95), Reaction::CounterPoke);

        let only_poke = Config {
            reply_text: 0.0,
            reply_img: 0.0,
            reply_file: 0.0,
            reply_voice: 0.0,
            mute: 0.0,
            ..Config::default()
        };
        assert_eq!(only_poke.pick(0.0), Reaction::CounterPoke);
    }

    #[test]
    fn voice_chance_is_a_valid_probability() {
        let with = |text_as_voice| Config {
            text_as_voice,
            ..Config::default()
        };
        assert_eq!(with(f64::NAN).voice_chance(), 0.0);
        assert_eq!(with(f64::INFINITY).voice_chance(), 0.0);
        assert_eq!(with(1.7).voice_chance(), 1.0);
        assert_eq!(with(-0.2).voice_chance(), 0.0);
        assert_eq!(with(0.6).voice_chance(), 0.6);

        let mut rng = rand::rng();
        rng.random_bool(with(f64::NAN).voice_chance());
    }

    #[test]
    fn third_poke_within_window_is_caught() {
        let guard = RepeatGuard::default();
        let now = Instant::now();
        let key = (1, 100, 200);
        assert!(!guard.hit(key, now, REPEAT_WINDOW));
        assert!(!guard.hit(key, now + Duration::from_secs(2), REPEAT_WINDOW));
        assert!(guard.hit(key, now + Duration::from_secs(4), REPEAT_WINDOW));
        // 其他目标独立计数
        assert!(!guard.hit((1, 100, 300), now, REPEAT_WINDOW));
    }

    #[test]
    fn window_expiry_resets_count() {
        let guard = RepeatGuard::default();
        let now = Instant::now();
        let key = (1, 100, 200);
        guard.hit(key, now, REPEAT_WINDOW);
        guard.hit(key, now + Duration::from_secs(1), REPEAT_WINDOW);
        assert!(!guard.hit(key, now + Duration::from_secs(5), REPEAT_WINDOW));
    }

    #[test]
    fn words_are_looked_up_by_key() {
        let words = PokeWords::parse(r#"{"bot": {"data": ["别戳了"]}, "10001": {"data": []}}"#)
            .unwrap();
        assert_eq!(words.lines("bot"), ["别戳了".to_string()]);
        assert_eq!(words.random("bot").as_deref(), Some("别戳了"));
        assert_eq!(words.random("10001"), None);
        assert!(words.lines("missing").is_empty());
    }
}
