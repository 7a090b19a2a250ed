use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{Result, SceneSearchError};

pub const GEMINI_API_KEY_ENV: &str = "GEMINI_KEY";
pub const DEFAULT_QUERY_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 300;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// 视频检索服务：自然语言查询 -> 匹配场景的开始时间（秒）
#[async_trait]
pub trait VideoQueryService: Send + Sync {
    async fn query_video(&self, query: &str, video: &Path) -> Result<Vec<f64>>;
}

/// 解析服务返回的时间戳数组
///
/// 返回内容可能被代码块标记或引号包裹，先去掉再按 JSON 数组解析。
/// 结果升序去重，负数视为无效。
pub fn parse_timestamps(payload: &str) -> Result<Vec<f64>> {
    let cleaned = strip_wrapping(payload);

    let mut timestamps: Vec<f64> = serde_json::from_str(cleaned).map_err(|e| {
        SceneSearchError::VideoQuery(format!("无法解析时间戳 {:?}: {}", cleaned, e))
    })?;

    if let Some(bad) = timestamps.iter().find(|t| !t.is_finite() || **t < 0.0) {
        return Err(SceneSearchError::VideoQuery(format!("无效的时间戳: {}", bad)));
    }

    timestamps.sort_by(f64::total_cmp);
    timestamps.dedup();
    Ok(timestamps)
}

/// 去掉两端的空白、代码块标记、引号以及 `json` 语言标记
fn strip_wrapping(payload: &str) -> &str {
    let mut text = payload;
    loop {
        let next = text
            .trim()
            .trim_matches(&['`', '\'', '"'][..])
            .trim();
        let next = next
            .strip_prefix("json")
            .or_else(|| next.strip_prefix("JSON"))
            .unwrap_or(next);
        if next == text {
            return text;
        }
        text = next;
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: GeminiFile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiFile {
    name: String,
    uri: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

/// Gemini 视频理解客户端
pub struct GeminiVideoQuery {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl GeminiVideoQuery {
    pub fn new(api_key: String, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SceneSearchError::VideoQuery(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            model: model.into(),
            base_url: GEMINI_API_BASE.to_string(),
            timeout,
        })
    }

    /// 从环境变量 `GEMINI_KEY` 读取凭证
    pub fn from_env(model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let api_key = std::env::var(GEMINI_API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or(SceneSearchError::MissingCredential(GEMINI_API_KEY_ENV))?;
        Self::new(api_key, model, timeout)
    }

    async fn upload(&self, video: &Path) -> Result<GeminiFile> {
        let bytes = tokio::fs::read(video)
            .await
            .map_err(|e| SceneSearchError::persistence(video, e))?;
        let mime_type = video_mime_type(video);
        let display_name = video
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());

        info!("⏳ [视频检索] 正在上传视频: {} ({} 字节)", video.display(), bytes.len());

        let start = self
            .client
            .post(format!("{}/upload/v1beta/files?key={}", self.base_url, self.api_key))
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", bytes.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "file": { "display_name": display_name } }))
            .send()
            .await?;
        let start = ensure_success(start, "创建上传会话").await?;

        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| SceneSearchError::VideoQuery("响应中没有上传地址".to_string()))?;

        let finish = self
            .client
            .post(upload_url)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(bytes)
            .send()
            .await?;
        let uploaded: UploadResponse = ensure_success(finish, "上传视频")
            .await?
            .json()
            .await
            .map_err(|e| SceneSearchError::VideoQuery(format!("解析上传响应失败: {}", e)))?;

        Ok(uploaded.file)
    }

    /// 等待服务端处理完视频
    async fn wait_until_active(&self, mut file: GeminiFile) -> Result<GeminiFile> {
        let wait_start = Instant::now();
        loop {
            match file.state.as_deref() {
                Some("ACTIVE") | None => return Ok(file),
                Some("FAILED") => {
                    return Err(SceneSearchError::VideoQuery(format!(
                        "服务端处理视频失败: {}",
                        file.name
                    )))
                }
                Some(state) => debug!("[视频检索] 视频状态: {}", state),
            }

            if wait_start.elapsed() > self.timeout {
                return Err(SceneSearchError::VideoQuery("等待视频处理超时".to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;

            let response = self
                .client
                .get(format!("{}/v1beta/{}?key={}", self.base_url, file.name, self.api_key))
                .send()
                .await?;
            file = ensure_success(response, "查询视频状态")
                .await?
                .json()
                .await
                .map_err(|e| SceneSearchError::VideoQuery(format!("解析视频状态失败: {}", e)))?;
        }
    }
}

#[async_trait]
impl VideoQueryService for GeminiVideoQuery {
    async fn query_video(&self, query: &str, video: &Path) -> Result<Vec<f64>> {
        let file = self.upload(video).await?;
        let file = self.wait_until_active(file).await?;
        let mime_type = file
            .mime_type
            .clone()
            .unwrap_or_else(|| video_mime_type(video).to_string());

        let body = json!({
            "contents": [{
                "parts": [
                    { "file_data": { "mime_type": mime_type, "file_uri": file.uri } },
                    { "text": timestamp_prompt(query) }
                ]
            }],
            "generationConfig": { "temperature": 0.3 }
        });

        let response = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:generateContent?key={}",
                self.base_url, self.model, self.api_key
            ))
            .json(&body)
            .send()
            .await?;
        let generated: GenerateResponse = ensure_success(response, "生成内容")
            .await?
            .json()
            .await
            .map_err(|e| SceneSearchError::VideoQuery(format!("解析生成结果失败: {}", e)))?;

        let text: String = generated
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect();
        if text.trim().is_empty() {
            return Err(SceneSearchError::VideoQuery("服务没有返回任何内容".to_string()));
        }

        debug!("[视频检索] 原始返回: {}", text);
        parse_timestamps(&text)
    }
}

fn timestamp_prompt(query: &str) -> String {
    format!(
        "Find every scene in this video that matches the query below. \
         For each matching scene give its start time in seconds with millisecond \
         precision. Reply with a JSON array of numbers only, for example \
         [0.0, 2.002, 7.925], and nothing else.\nQuery: {}",
        query
    )
}

fn video_mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .as_deref()
    {
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("mpeg") | Some("mpg") => "video/mpeg",
        _ => "video/mp4",
    }
}

async fn ensure_success(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SceneSearchError::VideoQuery(format!(
        "{}失败: {} - {}",
        action, status, body
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_array() {
        assert_eq!(parse_timestamps("[0.0, 2.002, 7.925]").unwrap(), vec![0.0, 2.002, 7.925]);
    }

    #[test]
    fn test_parse_strips_fences_and_quotes() {
        let fenced = "```json\n[1.5, 0.5]\n```";
        assert_eq!(parse_timestamps(fenced).unwrap(), vec![0.5, 1.5]);

        let quoted = "'''[3, 3, 1]'''";
        assert_eq!(parse_timestamps(quoted).unwrap(), vec![1.0, 3.0]);

        assert_eq!(parse_timestamps("  \"[12.25]\"  ").unwrap(), vec![12.25]);
        assert!(parse_timestamps("[]").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_invalid_payloads() {
        assert!(matches!(
            parse_timestamps("I could not find any scenes."),
            Err(SceneSearchError::VideoQuery(_))
        ));
        assert!(parse_timestamps("[1.0, \"two\"]").is_err());
        assert!(parse_timestamps("[-1.0, 2.0]").is_err());
    }

    #[test]
    fn test_video_mime_type() {
        assert_eq!(video_mime_type(Path::new("trailer.MP4")), "video/mp4");
        assert_eq!(video_mime_type(Path::new("clip.mov")), "video/quicktime");
        assert_eq!(video_mime_type(Path::new("noext")), "video/mp4");
    }

    #[test]
    fn test_prompt_contains_query() {
        assert!(timestamp_prompt("mario jumping").ends_with("Query: mario jumping"));
    }

    #[test]
    fn test_missing_credential() {
        if std::env::var(GEMINI_API_KEY_ENV).is_ok() {
            return;
        }
        assert!(matches!(
            GeminiVideoQuery::from_env(DEFAULT_QUERY_MODEL, Duration::from_secs(5)),
            Err(SceneSearchError::MissingCredential(GEMINI_API_KEY_ENV))
        ));
    }
}
