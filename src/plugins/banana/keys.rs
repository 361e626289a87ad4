//! API 密钥轮换与健康统计，持久化在 keys.json

use super::error::GenerationError;
use crate::{info, warn};
use chrono::{Local, SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;

const FILE_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    #[default]
    Active,
    Disabled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiKeyRecord {
    pub id: String,
    pub value: String,
    pub name: String,
    pub status: KeyStatus,
    pub added_at: String,
    pub added_by: String,
    pub last_used: Option<String>,
    pub usage_count: u64,
    pub today_usage: u64,
    pub today_date: String,
    pub error_count: u64,
    pub today_failed: u64,
    pub today_failed_date: String,
    pub notes: String,
}

impl ApiKeyRecord {
    pub fn is_active(&self) -> bool {
        self.status == KeyStatus::Active
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyStatistics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub today_requests: u64,
    pub today_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeysFile {
    pub keys: Vec<ApiKeyRecord>,
    pub current_index: usize,
    pub last_used: Option<String>,
    pub version: String,
    pub statistics: KeyStatistics,
}

impl Default for KeysFile {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            current_index: 0,
            last_used: None,
            version: FILE_VERSION.to_string(),
            statistics: KeyStatistics::default(),
        }
    }
}

impl KeysFile {
    pub fn active_count(&self) -> usize {
        self.keys.iter().filter(|k| k.is_active()).count()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FailurePolicy {
    pub disable_on_error: bool,
    pub daily_fail_threshold: u64,
}

/// 密钥仓库。每次读改写都在同一把锁内完成。
pub struct KeyStore {
    path: PathBuf,
    lock: Mutex<()>,
}

fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// `key_<毫秒时间戳>_<9 位 base36>`
fn new_key_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();
    format!("key_{}_{}", Utc::now().timestamp_millis(), suffix)
}

/// 展示用的脱敏密钥
pub fn mask_key(value: &str) -> String {
    let head: String = value.chars().take(12).collect();
    format!("{}***", head)
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<KeysFile, GenerationError> {
        if !self.path.exists() {
            return Ok(KeysFile::default());
        }
        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|e| GenerationError::KeyStore(e.to_string()))?;
        if content.trim().is_empty() {
            return Ok(KeysFile::default());
        }
        serde_json::from_str(&content).map_err(|e| GenerationError::KeyStore(e.to_string()))
    }

    async fn save(&self, file: &KeysFile) -> Result<(), GenerationError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| GenerationError::KeyStore(e.to_string()))?;
        }
        let content = serde_json::to_string_pretty(file)
            .map_err(|e| GenerationError::KeyStore(e.to_string()))?;
        fs::write(&self.path, content)
            .await
            .map_err(|e| GenerationError::KeyStore(e.to_string()))
    }

    /// 当前文件内容的快照 (列表与调试信息用)
    pub async fn snapshot(&self) -> Result<KeysFile, GenerationError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    pub async fn acquire(&self) -> Result<String, GenerationError> {
        self.acquire_on(&today()).await
    }

    /// 取出当前密钥并把指针移到下一个活跃密钥
    pub async fn acquire_on(&self, today: &str) -> Result<String, GenerationError> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;

        if file.keys.is_empty() {
            return Err(GenerationError::NoKeys);
        }
        let active: Vec<usize> = file
            .keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.is_active())
            .map(|(i, _)| i)
            .collect();
        if active.is_empty() {
            return Err(GenerationError::NoActiveKeys);
        }

        let index = match file.keys.get(file.current_index) {
            Some(k) if k.is_active() => file.current_index,
            _ => active[0],
        };

        let now = now_stamp();
        let stats = &mut file.statistics;
        if stats.today_date != today {
            stats.today_requests = 0;
            stats.today_date = today.to_string();
        }
        stats.total_requests += 1;
        stats.today_requests += 1;

        let key = &mut file.keys[index];
        key.last_used = Some(now.clone());
        key.usage_count += 1;
        if key.today_date != today {
            key.today_usage = 0;
            key.today_date = today.to_string();
        }
        key.today_usage += 1;
        let value = key.value.clone();

        let pos = active.iter().position(|i| *i == index).unwrap_or(0);
        file.current_index = active[(pos + 1) % active.len()];
        file.last_used = Some(now);

        self.save(&file).await?;
        Ok(value)
    }

    pub async fn report_outcome(
        &self,
        key: &str,
        success: bool,
        message: &str,
        policy: FailurePolicy,
    ) -> Result<(), GenerationError> {
        self.report_outcome_on(key, success, message, policy, &today())
            .await
    }

    pub async fn report_outcome_on(
        &self,
        key: &str,
        success: bool,
        message: &str,
        policy: FailurePolicy,
        today: &str,
    ) -> Result<(), GenerationError> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;

        let Some(record) = file.keys.iter_mut().find(|k| k.value == key) else {
            return Ok(());
        };

        if success {
            file.statistics.successful_requests += 1;
        } else {
            record.error_count += 1;
            if record.today_failed_date != today {
                record.today_failed = 0;
                record.today_failed_date = today.to_string();
            }
            record.today_failed += 1;

            if policy.disable_on_error
                && record.is_active()
                && record.today_failed >= policy.daily_fail_threshold
            {
                record.status = KeyStatus::Disabled;
                record.notes = format!("自动禁用：当日失败{}次 - {}", record.today_failed, message);
                warn!(
                    target: "Banana",
                    "密钥 {} 当日失败 {} 次，已自动禁用",
                    record.name,
                    record.today_failed
                );
            }
            file.statistics.failed_requests += 1;
        }

        self.save(&file).await
    }

    /// 重新启用所有被禁用的密钥，返回数量
    pub async fn reset_disabled(&self) -> Result<usize, GenerationError> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;

        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let mut count = 0;
        for key in file.keys.iter_mut().filter(|k| !k.is_active()) {
            key.status = KeyStatus::Active;
            key.today_failed = 0;
            key.notes = format!("定时重置于 {}", stamp);
            count += 1;
        }

        if count > 0 {
            self.save(&file).await?;
            info!(target: "Banana", "已重置 {} 个被禁用的密钥", count);
        }
        Ok(count)
    }

    /// 添加密钥；已存在时返回 false
    pub async fn add_key(&self, value: &str, added_by: &str) -> Result<bool, GenerationError> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(false);
        }

        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        if file.keys.iter().any(|k| k.value == value) {
            return Ok(false);
        }

        let name = format!("密钥{}", file.keys.len() + 1);
        file.keys.push(ApiKeyRecord {
            id: new_key_id(),
            value: value.to_string(),
            name,
            status: KeyStatus::Active,
            added_at: now_stamp(),
            added_by: added_by.to_string(),
            ..Default::default()
        });
        self.save(&file).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: &str = "2026-01-01";

    async fn store_with(keys: &[&str]) -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path().join("keys.json"));
        for k in keys {
            assert!(store.add_key(k, "10001").await.unwrap());
        }
        (dir, store)
    }

    fn strict(threshold: u64) -> FailurePolicy {
        FailurePolicy {
            disable_on_error: true,
            daily_fail_threshold: threshold,
        }
    }

    #[tokio::test]
    async fn empty_store_has_no_keys() {
        let (_dir, store) = store_with(&[]).await;
        assert!(matches!(
            store.acquire_on(DAY).await,
            Err(GenerationError::NoKeys)
        ));
    }

    #[tokio::test]
    async fn three_keys_rotate_in_order() {
        let (_dir, store) = store_with(&["k1", "k2", "k3"]).await;
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(store.acquire_on(DAY).await.unwrap());
        }
        assert_eq!(seen, vec!["k1", "k2", "k3", "k1"]);

        let file = store.snapshot().await.unwrap();
        assert_eq!(file.statistics.total_requests, 4);
        assert_eq!(file.keys[0].today_usage, 2);
        assert_eq!(file.version, "2.0");
    }

    #[tokio::test]
    async fn disabled_pointed_key_is_skipped() {
        let (_dir, store) = store_with(&["k1", "k2", "k3"]).await;
        assert_eq!(store.acquire_on(DAY).await.unwrap(), "k1");

        // 指针现在指向 k2，将其禁用后回落到第一个活跃密钥
        store
            .report_outcome_on("k2", false, "HTTP 401", strict(1), DAY)
            .await
            .unwrap();
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(store.acquire_on(DAY).await.unwrap());
        }
        assert_eq!(seen, vec!["k1", "k3", "k1", "k3"]);
        assert!(!seen.iter().any(|k| k == "k2"));
    }

    #[tokio::test]
    async fn key_disabled_on_tenth_failure() {
        let (_dir, store) = store_with(&["k1", "k2"]).await;
        for _ in 0..9 {
            store
                .report_outcome_on("k1", false, "boom", strict(10), DAY)
                .await
                .unwrap();
        }
        assert!(store.snapshot().await.unwrap().keys[0].is_active());

        store
            .report_outcome_on("k1", false, "boom", strict(10), DAY)
            .await
            .unwrap();
        let file = store.snapshot().await.unwrap();
        assert_eq!(file.keys[0].status, KeyStatus::Disabled);
        assert_eq!(file.keys[0].notes, "自动禁用：当日失败10次 - boom");
        assert_eq!(file.statistics.failed_requests, 10);

        assert_eq!(store.acquire_on(DAY).await.unwrap(), "k2");
        assert_eq!(store.acquire_on(DAY).await.unwrap(), "k2");
    }

    #[tokio::test]
    async fn failures_roll_over_by_day_and_reset_reenables() {
        let (_dir, store) = store_with(&["k1"]).await;
        store
            .report_outcome_on("k1", false, "x", strict(2), "2026-01-01")
            .await
            .unwrap();
        store
            .report_outcome_on("k1", false, "x", strict(2), "2026-01-02")
            .await
            .unwrap();
        assert!(store.snapshot().await.unwrap().keys[0].is_active());

        store
            .report_outcome_on("k1", false, "x", strict(2), "2026-01-02")
            .await
            .unwrap();
        assert!(matches!(
            store.acquire_on(DAY).await,
            Err(GenerationError::NoActiveKeys)
        ));

        assert_eq!(store.reset_disabled().await.unwrap(), 1);
        let file = store.snapshot().await.unwrap();
        assert!(file.keys[0].is_active());
        assert_eq!(file.keys[0].today_failed, 0);
        assert!(file.keys[0].notes.starts_with("定时重置于"));
        assert_eq!(store.reset_disabled().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicates_and_unknown_keys() {
        let (_dir, store) = store_with(&["k1"]).await;
        assert!(!store.add_key("k1", "10001").await.unwrap());
        store
            .report_outcome_on("nope", true, "", strict(1), DAY)
            .await
            .unwrap();
        let file = store.snapshot().await.unwrap();
        assert_eq!(file.keys.len(), 1);
        assert_eq!(file.keys[0].name, "密钥1");
        assert!(file.keys[0].id.starts_with("key_"));
        assert_eq!(file.statistics.successful_requests, 0);
    }

    #[test]
    fn masks_long_keys() {
        assert_eq!(mask_key("sk-abcdefghijklmnop"), "sk-abcdefghi***");
    }
}
