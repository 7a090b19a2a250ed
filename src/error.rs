//! 错误类型
//!
//! 库内所有可失败的操作都返回 [`SceneSearchError`]。单个场景级别的失败
//! （抽帧失败、字幕生成失败）由调用方记录日志后跳过，不会中断整批处理；
//! 结构性失败（视频无法打开、索引或拼图无法写入）则一路向上传播。

use std::{io::Error as IoError, path::PathBuf};

use ffmpeg_next::Error as FfmpegError;
use image::ImageError;
use thiserror::Error;

/// 场景检索流水线的统一错误类型
#[derive(Debug, Error)]
pub enum SceneSearchError {
    /// 视频文件不存在或无法解码，整个流程终止
    #[error("无法打开视频 {path}: {reason}")]
    MediaAccess {
        path: PathBuf,
        reason: String,
    },

    /// 单个场景的 seek/读帧失败
    #[error("场景 {scene} 抽帧失败（帧号 {frame_number}）: {reason}")]
    FrameExtraction {
        scene: u32,
        frame_number: u64,
        reason: String,
    },

    /// 字幕服务调用失败（单个场景）
    #[error("字幕服务错误: {0}")]
    CaptionService(String),

    /// 缺少外部服务凭证
    #[error("未找到环境变量 {0}，无法调用外部服务")]
    MissingCredential(&'static str),

    /// 索引、图片或拼图文件读写失败
    #[error("读写文件失败 {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: IoError,
    },

    /// 字幕索引文件存在但内容无法解析
    #[error("字幕索引文件已损坏 {path}: {reason}")]
    CorruptIndex {
        path: PathBuf,
        reason: String,
    },

    /// 视频检索服务调用失败或返回内容无法解析
    #[error("视频检索服务错误: {0}")]
    VideoQuery(String),

    /// 配置项不合法
    #[error("配置错误: {0}")]
    Config(String),

    #[error("JSON 序列化失败: {0}")]
    Json(#[from] serde_json::Error),

    #[error("FFmpeg 错误: {0}")]
    Ffmpeg(String),

    #[error("图片处理错误: {0}")]
    Image(#[from] ImageError),

    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<FfmpegError> for SceneSearchError {
    fn from(error: FfmpegError) -> Self {
        SceneSearchError::Ffmpeg(error.to_string())
    }
}

impl SceneSearchError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: IoError) -> Self {
        SceneSearchError::Persistence {
            path: path.into(),
            source,
        }
    }

    /// 是否为只影响单个场景、可以跳过的错误
    pub fn is_per_item(&self) -> bool {
        matches!(
            self,
            SceneSearchError::FrameExtraction { .. } | SceneSearchError::CaptionService(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SceneSearchError>;
