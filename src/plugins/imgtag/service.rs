use anyhow::{Context as _, Result, bail};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default()
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImageRecord {
    pub id: i64,
    #[serde(alias = "image_url")]
    pub url: String,
    pub tags: Vec<String>,
    pub description: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ImageList {
    pub images: Vec<ImageRecord>,
    pub total: u64,
}

/// 上传后返回的图片信息
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AddedImage {
    pub id: Option<i64>,
    pub image_url: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AddImage<'a> {
    pub image_url: &'a str,
    pub auto_analyze: bool,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    pub tags: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Dashboard {
    pub images: ImageCounts,
    pub today: TodayCounts,
    pub queue: QueueCounts,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ImageCounts {
    pub total: u64,
    pub analyzed: u64,
    pub pending: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TodayCounts {
    pub uploaded: u64,
    pub analyzed: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct QueueCounts {
    pub total: u64,
    pub processing: u64,
    pub running: bool,
}

/// ImgTag 图床外部接口
pub struct ImgTagClient {
    api_url: String,
    api_key: String,
}

impl ImgTagClient {
    /// 地址或密钥缺失时返回 None
    pub fn new(api_url: &str, api_key: &str) -> Option<Self> {
        let api_url = api_url.trim().trim_end_matches('/');
        let api_key = api_key.trim();
        if api_url.is_empty() || api_key.is_empty() {
            return None;
        }
        Some(Self {
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}/api/v1/external{}", self.api_url, path))
            .with_context(|| format!("无效的 api_url: {}", self.api_url))
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let resp = req
            .header("api_key", &self.api_key)
            .send()
            .await
            .context("请求 ImgTag 失败")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("API 请求失败 [{}]: {}", status.as_u16(), text);
        }
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).context("解析 ImgTag 响应失败")
    }

    pub async fn add_image(&self, body: &AddImage<'_>) -> Result<AddedImage> {
        let url = self.endpoint("/images")?;
        let payload = serde_json::to_vec(body)?;
        let req = http_client()
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload);
        self.send(req).await
    }

    pub async fn search(&self, keyword: &str, tags: &[String], limit: usize) -> Result<ImageList> {
        let mut url = self.endpoint("/images/search")?;
        {
            let mut query = url.query_pairs_mut();
            if !keyword.is_empty() {
                query.append_pair("keyword", keyword);
            }
            for tag in tags {
                query.append_pair("tags", tag);
            }
            query.append_pair("limit", &limit.to_string());
        }
        self.send(http_client().get(url)).await
    }

    pub async fn random(&self, tags: &[String], count: usize) -> Result<ImageList> {
        let mut url = self.endpoint("/images/random")?;
        {
            let mut query = url.query_pairs_mut();
            for tag in tags {
                query.append_pair("tags", tag);
            }
            query.append_pair("count", &count.to_string());
        }
        self.send(http_client().get(url)).await
    }

    pub async fn detail(&self, id: i64) -> Result<ImageRecord> {
        let url = self.endpoint(&format!("/images/{}", id))?;
        self.send(http_client().get(url)).await
    }
}

/// 云端统计，无需密钥
pub async fn dashboard(api_url: &str) -> Result<Dashboard> {
    let api_url = api_url.trim().trim_end_matches('/');
    if api_url.is_empty() {
        bail!("请先配置 api_url");
    }
    let resp = http_client()
        .get(format!("{}/api/v1/system/dashboard", api_url))
        .send()
        .await
        .context("获取统计失败")?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        bail!("获取统计失败 [{}]: {}", status.as_u16(), text);
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).context("解析统计失败")
}

/// 下载图片，返回内容与 Content-Type
pub async fn download(url: &str) -> Result<(Vec<u8>, Option<String>)> {
    let resp = http_client()
        .get(url)
        .send()
        .await
        .with_context(|| format!("下载失败: {}", url))?;
    if !resp.status().is_success() {
        bail!("下载失败，状态码: {}", resp.status().as_u16());
    }
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let bytes = resp.bytes().await?;
    Ok((bytes.to_vec(), content_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_requires_url_and_key() {
        assert!(ImgTagClient::new("", "k").is_none());
        assert!(ImgTagClient::new("https://x", " ").is_none());
        let client = ImgTagClient::new("https://x/", "k").unwrap();
        let url = client.endpoint("/images/search").unwrap();
        assert_eq!(url.as_str(), "https://x/api/v1/external/images/search");
    }

    #[test]
    fn add_image_body_omits_empty_fields() {
        let body = AddImage {
            image_url: "https://a/b.png",
            auto_analyze: true,
            tags: &[],
            category_id: None,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["image_url"], "https://a/b.png");
        assert!(v.get("tags").is_none());
        assert!(v.get("category_id").is_none());
    }

    #[test]
    fn records_accept_either_url_field() {
        let list: ImageList = serde_json::from_str(
            r#"{"images":[{"id":1,"image_url":"https://a/1.png","tags":["猫"]},{"id":2,"url":"https://a/2.png"}],"total":2}"#,
        )
        .unwrap();
        assert_eq!(list.images[0].url, "https://a/1.png");
        assert_eq!(list.images[1].url, "https://a/2.png");
        assert!(list.images[1].tags.is_empty());
    }
}
