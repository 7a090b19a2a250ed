use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as base64_engine;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, SceneSearchError};

pub const MOONDREAM_API_KEY_ENV: &str = "MOONDREAM_API_KEY";
pub const DEFAULT_CAPTION_ENDPOINT: &str = "https://api.moondream.ai/v1/caption";
pub const DEFAULT_CAPTION_TIMEOUT_SECS: u64 = 60;

/// 图片字幕服务：输入一张场景图片，返回一句简短描述
#[async_trait]
pub trait Captioner: Send + Sync {
    async fn caption(&self, image_path: &Path) -> Result<String>;
}

#[async_trait]
impl<T: Captioner + ?Sized> Captioner for &T {
    async fn caption(&self, image_path: &Path) -> Result<String> {
        (**self).caption(image_path).await
    }
}

#[derive(Debug, Serialize)]
struct CaptionRequest<'a> {
    image_url: String,
    length: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CaptionResponse {
    caption: Option<String>,
}

/// Moondream 云端字幕服务客户端
pub struct MoondreamCaptioner {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl MoondreamCaptioner {
    pub fn new(api_key: String, endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SceneSearchError::CaptionService(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    /// 从环境变量 `MOONDREAM_API_KEY` 读取凭证，缺失时无法生成任何字幕
    pub fn from_env(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let api_key = std::env::var(MOONDREAM_API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or(SceneSearchError::MissingCredential(MOONDREAM_API_KEY_ENV))?;
        Self::new(api_key, endpoint, timeout)
    }
}

#[async_trait]
impl Captioner for MoondreamCaptioner {
    async fn caption(&self, image_path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(image_path).await.map_err(|e| {
            SceneSearchError::CaptionService(format!("读取图片失败 {}: {}", image_path.display(), e))
        })?;

        let request = CaptionRequest {
            image_url: jpeg_data_url(&bytes),
            length: "short",
            stream: false,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Moondream-Auth", self.api_key.as_str())
            .json(&request)
            .send()
            .await
            .map_err(|e| SceneSearchError::CaptionService(format!("请求失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SceneSearchError::CaptionService(format!(
                "服务返回错误状态: {} - {}",
                status, body
            )));
        }

        let payload: CaptionResponse = response
            .json()
            .await
            .map_err(|e| SceneSearchError::CaptionService(format!("解析响应失败: {}", e)))?;

        let caption = payload
            .caption
            .map(|c| c.trim().to_string())
            .ok_or_else(|| SceneSearchError::CaptionService("响应中没有 caption 字段".to_string()))?;

        debug!("[字幕] {} -> {}", image_path.display(), caption);
        Ok(caption)
    }
}

fn jpeg_data_url(bytes: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", base64_engine.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jpeg_data_url() {
        assert_eq!(jpeg_data_url(b"abc"), "data:image/jpeg;base64,YWJj");
    }

    #[test]
    fn test_request_shape() {
        let request = CaptionRequest {
            image_url: jpeg_data_url(b""),
            length: "short",
            stream: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["length"], "short");
        assert_eq!(json["stream"], false);
        assert_eq!(json["image_url"], "data:image/jpeg;base64,");
    }

    #[tokio::test]
    async fn test_missing_image_is_caption_error() {
        let captioner = MoondreamCaptioner::new(
            "test-key".to_string(),
            "http://127.0.0.1:9/v1/caption",
            Duration::from_secs(1),
        )
        .unwrap();
        let result = captioner.caption(Path::new("no/such/scene_1.jpg")).await;
        assert!(matches!(result, Err(SceneSearchError::CaptionService(_))));
    }
}
