use crate::{debug, info, warn};
use anyhow::{Context as _, Result};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexEntry {
    pub ext: String,
    pub synced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 毫秒时间戳
    pub updated_at: i64,
}

/// 云端同步成功后写回的字段
#[derive(Debug, Clone, Default)]
pub struct SyncInfo {
    pub remote_id: Option<i64>,
    pub remote_url: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SavedImage {
    pub md5: String,
    pub path: PathBuf,
    pub is_new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalStats {
    pub total: usize,
    pub synced: usize,
}

impl LocalStats {
    pub fn unsynced(&self) -> usize {
        self.total - self.synced
    }
}

/// 本地图库: `<md5>.<ext>` 文件加 `index.json` 索引
pub struct ImageIndex {
    root: PathBuf,
    entries: Mutex<BTreeMap<String, IndexEntry>>,
}

impl ImageIndex {
    /// 打开目录并读取索引，索引损坏时从空索引开始
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("无法创建图库目录 {}", root.display()))?;

        let index_path = root.join("index.json");
        let entries = match fs::read_to_string(&index_path).await {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(target: "ImgTag", "索引解析失败，重新开始: {}", e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };

        Ok(Self {
            root,
            entries: Mutex::new(entries),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, md5: &str, ext: &str) -> PathBuf {
        self.root.join(format!("{}.{}", md5, ext))
    }

    async fn persist(&self, entries: &BTreeMap<String, IndexEntry>) -> Result<()> {
        let text = serde_json::to_string_pretty(entries)?;
        fs::write(self.root.join("index.json"), text)
            .await
            .context("保存索引失败")
    }

    /// 索引中存在且文件仍在磁盘上时返回路径
    pub async fn find_local(&self, md5: &str) -> Option<PathBuf> {
        let entries = self.entries.lock().await;
        let entry = entries.get(md5)?;
        let path = self.file_path(md5, &entry.ext);
        path.exists().then_some(path)
    }

    /// 按内容 MD5 落盘，已存在则不重复写入
    pub async fn save_bytes(&self, bytes: &[u8], ext: &str) -> Result<SavedImage> {
        let md5 = format!("{:x}", md5::compute(bytes));
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(&md5) {
            let path = self.file_path(&md5, &entry.ext);
            if path.exists() {
                debug!(target: "ImgTag", "图片已存在: {}", md5);
                return Ok(SavedImage {
                    md5,
                    path,
                    is_new: false,
                });
            }
        }

        let path = self.file_path(&md5, ext);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("写入 {} 失败", path.display()))?;
        info!(target: "ImgTag", "保存本地: {}", path.display());

        let entry = entries.entry(md5.clone()).or_default();
        entry.ext = ext.to_string();
        entry.synced = false;
        entry.updated_at = chrono::Local::now().timestamp_millis();
        self.persist(&entries).await?;

        Ok(SavedImage {
            md5,
            path,
            is_new: true,
        })
    }

    /// 标记已同步到云端
    pub async fn mark_synced(&self, md5: &str, info: SyncInfo) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(md5.to_string()).or_default();
        entry.synced = true;
        if info.remote_id.is_some() {
            entry.remote_id = info.remote_id;
        }
        if info.remote_url.is_some() {
            entry.remote_url = info.remote_url;
        }
        if !info.tags.is_empty() {
            entry.tags = info.tags;
        }
        entry.updated_at = chrono::Local::now().timestamp_millis();
        self.persist(&entries).await
    }

    pub async fn stats(&self) -> LocalStats {
        let entries = self.entries.lock().await;
        LocalStats {
            total: entries.len(),
            synced: entries.values().filter(|e| e.synced).count(),
        }
    }

    /// 随机挑一张仍在磁盘上的本地图片
    pub async fn random_local(&self) -> Option<PathBuf> {
        let candidates: Vec<PathBuf> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .map(|(md5, e)| self.file_path(md5, &e.ext))
                .filter(|p| p.exists())
                .collect()
        };
        candidates.choose(&mut rand::rng()).cloned()
    }
}

/// 由 Content-Type 推断扩展名 (`image/jpeg` → `jpg`)
pub fn ext_from_content_type(content_type: Option<&str>) -> String {
    let ct = content_type.unwrap_or("image/jpeg");
    let sub = ct.split('/').nth(1).unwrap_or("jpg");
    let sub = sub.split(';').next().unwrap_or(sub).trim();
    match sub {
        "" => "jpg".to_string(),
        "jpeg" => "jpg".to_string(),
        other => other.to_string(),
    }
}

/// 图床地址的文件名通常就是内容 MD5
pub fn md5_from_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    let file_name = parsed.path_segments()?.next_back()?;
    let stem = file_name.split('.').next()?;
    (stem.len() == 32 && stem.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| stem.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_from_content_type() {
        assert_eq!(ext_from_content_type(Some("image/jpeg")), "jpg");
        assert_eq!(ext_from_content_type(Some("image/png; charset=binary")), "png");
        assert_eq!(ext_from_content_type(None), "jpg");
        assert_eq!(ext_from_content_type(Some("image/gif")), "gif");
    }

    #[test]
    fn md5_is_recovered_from_remote_file_name() {
        assert_eq!(
            md5_from_url("https://img.example.com/ab/cd/0123456789ABCDEF0123456789abcdef.webp?x=1"),
            Some("0123456789abcdef0123456789abcdef".to_string())
        );
        assert_eq!(md5_from_url("https://img.example.com/ab/cd/cat.png"), None);
        assert_eq!(md5_from_url("not a url"), None);
    }

    #[tokio::test]
    async fn saving_is_idempotent_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let index = ImageIndex::open(dir.path()).await.unwrap();

        let first = index.save_bytes(b"fake image", "png").await.unwrap();
        assert!(first.is_new);
        assert_eq!(first.md5, format!("{:x}", md5::compute(b"fake image")));
        assert!(first.path.ends_with(format!("{}.png", first.md5)));

        let again = index.save_bytes(b"fake image", "jpg").await.unwrap();
        assert!(!again.is_new);
        assert_eq!(again.path, first.path);

        index
            .mark_synced(
                &first.md5,
                SyncInfo {
                    remote_id: Some(7),
                    remote_url: Some("https://x/y.png".into()),
                    tags: vec!["猫".into()],
                },
            )
            .await
            .unwrap();

        let reopened = ImageIndex::open(dir.path()).await.unwrap();
        assert_eq!(reopened.stats().await, LocalStats { total: 1, synced: 1 });
        assert_eq!(reopened.find_local(&first.md5).await, Some(first.path.clone()));
        assert_eq!(reopened.random_local().await, Some(first.path));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let index = ImageIndex::open(dir.path()).await.unwrap();
        let saved = index.save_bytes(b"gone", "jpg").await.unwrap();
        std::fs::remove_file(&saved.path).unwrap();

        assert_eq!(index.find_local(&saved.md5).await, None);
        assert_eq!(index.random_local().await, None);
        assert_eq!(index.stats().await.unsynced(), 1);
    }
}
