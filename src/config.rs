use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, Level};

use crate::captioner::{DEFAULT_CAPTION_ENDPOINT, DEFAULT_CAPTION_TIMEOUT_SECS};
use crate::error::{Result, SceneSearchError};
use crate::matcher::DEFAULT_MATCH_THRESHOLD;
use crate::scene_detector::{DEFAULT_MIN_SCENE_LENGTH, DEFAULT_THRESHOLD};
use crate::video_query::{DEFAULT_QUERY_MODEL, DEFAULT_QUERY_TIMEOUT_SECS};

pub const DEFAULT_SCENE_DIR: &str = "scene_image";
pub const DEFAULT_CAPTIONS_FILE: &str = "scene_captions.json";
pub const DEFAULT_COLLAGE_FILE: &str = "collage.png";
pub const DEFAULT_LOG_LEVEL: &str = "info";

const CONFIG_FILE_NAME: &str = "scene-search.ini";
const HIDDEN_CONFIG_FILE_NAME: &str = ".scene-search.ini";
const SYSTEM_CONFIG_FILE: &str = "/etc/scene-search.ini";

/// 合并后的完整配置
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// 镜头切换阈值
    pub threshold: f64,
    /// 最短镜头长度（秒）
    pub min_scene_length: f64,
    /// 字幕匹配阈值（0-100）
    pub match_threshold: f64,
    /// 输入视频，构建索引和视频检索时必填
    pub video: Option<PathBuf>,
    /// 场景图片目录
    pub scene_dir: PathBuf,
    /// 字幕索引文件
    pub captions: PathBuf,
    /// 拼图输出文件
    pub collage: PathBuf,
    pub caption_endpoint: String,
    pub caption_timeout_secs: u64,
    pub query_model: String,
    pub query_timeout_secs: u64,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_scene_length: DEFAULT_MIN_SCENE_LENGTH,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            video: None,
            scene_dir: PathBuf::from(DEFAULT_SCENE_DIR),
            captions: PathBuf::from(DEFAULT_CAPTIONS_FILE),
            collage: PathBuf::from(DEFAULT_COLLAGE_FILE),
            caption_endpoint: DEFAULT_CAPTION_ENDPOINT.to_string(),
            caption_timeout_secs: DEFAULT_CAPTION_TIMEOUT_SECS,
            query_model: DEFAULT_QUERY_MODEL.to_string(),
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl PipelineConfig {
    /// 检查取值范围
    pub fn validate(&self) -> Result<()> {
        if self.threshold.is_nan() || self.threshold < 0.0 {
            return Err(invalid("threshold 不能为负数", self.threshold));
        }
        if self.min_scene_length.is_nan() || self.min_scene_length < 0.0 {
            return Err(invalid("min_scene_length 不能为负数", self.min_scene_length));
        }
        if !(0.0..=100.0).contains(&self.match_threshold) {
            return Err(invalid("match_threshold 必须在 0-100 之间", self.match_threshold));
        }
        if self.caption_timeout_secs == 0 {
            return Err(SceneSearchError::Config("captioner timeout_secs 必须大于 0".to_string()));
        }
        if self.query_timeout_secs == 0 {
            return Err(SceneSearchError::Config("video_query timeout_secs 必须大于 0".to_string()));
        }
        self.tracing_level()?;
        Ok(())
    }

    /// 构建索引或视频检索需要的视频路径
    pub fn require_video(&self) -> Result<&Path> {
        self.video.as_deref().ok_or_else(|| {
            SceneSearchError::Config(
                "未指定视频文件（--video、SCENE_SEARCH_VIDEO 或配置文件 [paths] video）".to_string(),
            )
        })
    }

    pub fn tracing_level(&self) -> Result<Level> {
        Level::from_str(self.log_level.trim()).map_err(|_| {
            SceneSearchError::Config(format!("无效的日志级别: {}", self.log_level))
        })
    }

    pub fn caption_timeout(&self) -> Duration {
        Duration::from_secs(self.caption_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

fn invalid(message: &str, value: f64) -> SceneSearchError {
    SceneSearchError::Config(format!("{}: {}", message, value))
}

/// 单个来源（命令行 / 环境变量 / 配置文件）提供的配置，未设置的项为 `None`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub threshold: Option<f64>,
    pub min_scene_length: Option<f64>,
    pub match_threshold: Option<f64>,
    pub video: Option<PathBuf>,
    pub scene_dir: Option<PathBuf>,
    pub captions: Option<PathBuf>,
    pub collage: Option<PathBuf>,
    pub caption_endpoint: Option<String>,
    pub caption_timeout_secs: Option<u64>,
    pub query_model: Option<String>,
    pub query_timeout_secs: Option<u64>,
    pub log_level: Option<String>,
}

impl ConfigOverrides {
    /// 用 `lower` 补全本来源没有设置的项
    pub fn or(self, lower: ConfigOverrides) -> ConfigOverrides {
        ConfigOverrides {
            threshold: self.threshold.or(lower.threshold),
            min_scene_length: self.min_scene_length.or(lower.min_scene_length),
            match_threshold: self.match_threshold.or(lower.match_threshold),
            video: self.video.or(lower.video),
            scene_dir: self.scene_dir.or(lower.scene_dir),
            captions: self.captions.or(lower.captions),
            collage: self.collage.or(lower.collage),
            caption_endpoint: self.caption_endpoint.or(lower.caption_endpoint),
            caption_timeout_secs: self.caption_timeout_secs.or(lower.caption_timeout_secs),
            query_model: self.query_model.or(lower.query_model),
            query_timeout_secs: self.query_timeout_secs.or(lower.query_timeout_secs),
            log_level: self.log_level.or(lower.log_level),
        }
    }

    /// 未设置的项取默认值
    pub fn resolve(self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        PipelineConfig {
            threshold: self.threshold.unwrap_or(defaults.threshold),
            min_scene_length: self.min_scene_length.unwrap_or(defaults.min_scene_length),
            match_threshold: self.match_threshold.unwrap_or(defaults.match_threshold),
            video: self.video,
            scene_dir: self.scene_dir.unwrap_or(defaults.scene_dir),
            captions: self.captions.unwrap_or(defaults.captions),
            collage: self.collage.unwrap_or(defaults.collage),
            caption_endpoint: self.caption_endpoint.unwrap_or(defaults.caption_endpoint),
            caption_timeout_secs: self
                .caption_timeout_secs
                .unwrap_or(defaults.caption_timeout_secs),
            query_model: self.query_model.unwrap_or(defaults.query_model),
            query_timeout_secs: self.query_timeout_secs.unwrap_or(defaults.query_timeout_secs),
            log_level: self.log_level.unwrap_or(defaults.log_level),
        }
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    ///
    /// 显式指定的配置文件不存在时报错；未指定时按默认位置查找，找不到则跳过。
    pub fn load(config_file: Option<&Path>, cli: ConfigOverrides) -> Result<PipelineConfig> {
        // 1. 配置文件
        let file_config = match config_file {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_from_default_locations()?,
        };

        // 2. 环境变量
        let env_config = Self::load_from_env()?;

        // 3. 合并并校验
        let config = cli.or(env_config).or(file_config).resolve();
        config.validate()?;
        Ok(config)
    }

    /// 从环境变量加载配置
    pub fn load_from_env() -> Result<ConfigOverrides> {
        Self::load_from_lookup(|key| env::var(key).ok())
    }

    /// 通过 `lookup` 读取 `SCENE_SEARCH_*` 变量，空字符串视为未设置
    pub fn load_from_lookup<F>(lookup: F) -> Result<ConfigOverrides>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(ConfigOverrides {
            threshold: parse_value(get("SCENE_SEARCH_THRESHOLD"), "SCENE_SEARCH_THRESHOLD")?,
            min_scene_length: parse_value(
                get("SCENE_SEARCH_MIN_SCENE_LENGTH"),
                "SCENE_SEARCH_MIN_SCENE_LENGTH",
            )?,
            match_threshold: parse_value(
                get("SCENE_SEARCH_MATCH_THRESHOLD"),
                "SCENE_SEARCH_MATCH_THRESHOLD",
            )?,
            video: get("SCENE_SEARCH_VIDEO").map(PathBuf::from),
            scene_dir: get("SCENE_SEARCH_SCENE_DIR").map(PathBuf::from),
            captions: get("SCENE_SEARCH_CAPTIONS").map(PathBuf::from),
            collage: get("SCENE_SEARCH_COLLAGE").map(PathBuf::from),
            caption_endpoint: get("SCENE_SEARCH_CAPTION_ENDPOINT"),
            caption_timeout_secs: parse_value(
                get("SCENE_SEARCH_CAPTION_TIMEOUT"),
                "SCENE_SEARCH_CAPTION_TIMEOUT",
            )?,
            query_model: get("SCENE_SEARCH_QUERY_MODEL"),
            query_timeout_secs: parse_value(
                get("SCENE_SEARCH_QUERY_TIMEOUT"),
                "SCENE_SEARCH_QUERY_TIMEOUT",
            )?,
            log_level: get("SCENE_SEARCH_LOG_LEVEL"),
        })
    }

    /// 从INI配置文件加载配置
    pub fn load_from_file(config_path: &Path) -> Result<ConfigOverrides> {
        if !config_path.exists() {
            return Err(SceneSearchError::Config(format!(
                "配置文件不存在: {}",
                config_path.display()
            )));
        }

        let mut config_parser = configparser::ini::Ini::new();
        config_parser.load(config_path).map_err(|e| {
            SceneSearchError::Config(format!("读取配置文件失败: {}: {}", config_path.display(), e))
        })?;
        debug!("[配置] 已读取配置文件: {}", config_path.display());

        let get = |section: &str, key: &str| {
            config_parser
                .get(section, key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(ConfigOverrides {
            threshold: parse_value(get("detection", "threshold"), "detection/threshold")?,
            min_scene_length: parse_value(
                get("detection", "min_scene_length"),
                "detection/min_scene_length",
            )?,
            match_threshold: parse_value(
                get("search", "match_threshold"),
                "search/match_threshold",
            )?,
            video: get("paths", "video").map(PathBuf::from),
            scene_dir: get("paths", "scene_dir").map(PathBuf::from),
            captions: get("paths", "captions").map(PathBuf::from),
            collage: get("paths", "collage").map(PathBuf::from),
            caption_endpoint: get("captioner", "endpoint"),
            caption_timeout_secs: parse_value(
                get("captioner", "timeout_secs"),
                "captioner/timeout_secs",
            )?,
            query_model: get("video_query", "model"),
            query_timeout_secs: parse_value(
                get("video_query", "timeout_secs"),
                "video_query/timeout_secs",
            )?,
            log_level: get("logging", "level"),
        })
    }

    /// 从默认位置加载配置文件，都不存在时返回空配置
    fn load_from_default_locations() -> Result<ConfigOverrides> {
        match Self::default_locations().into_iter().find(|p| p.exists()) {
            Some(path) => Self::load_from_file(&path),
            None => Ok(ConfigOverrides::default()),
        }
    }

    /// 1. 当前目录的 scene-search.ini
    /// 2. 当前目录的 .scene-search.ini
    /// 3. 用户主目录的 .scene-search.ini
    /// 4. /etc/scene-search.ini
    pub fn default_locations() -> Vec<PathBuf> {
        let mut locations = vec![
            PathBuf::from(CONFIG_FILE_NAME),
            PathBuf::from(HIDDEN_CONFIG_FILE_NAME),
        ];
        if let Some(home) = env::var_os("HOME") {
            locations.push(PathBuf::from(home).join(HIDDEN_CONFIG_FILE_NAME));
        }
        locations.push(PathBuf::from(SYSTEM_CONFIG_FILE));
        locations
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = PipelineConfig::default();
        let mut config_parser = configparser::ini::Ini::new();
        config_parser.set("detection", "threshold", Some(defaults.threshold.to_string()));
        config_parser.set(
            "detection",
            "min_scene_length",
            Some(defaults.min_scene_length.to_string()),
        );
        config_parser.set(
            "search",
            "match_threshold",
            Some(defaults.match_threshold.to_string()),
        );
        config_parser.set("paths", "video", Some("".to_string()));
        config_parser.set("paths", "scene_dir", Some(DEFAULT_SCENE_DIR.to_string()));
        config_parser.set("paths", "captions", Some(DEFAULT_CAPTIONS_FILE.to_string()));
        config_parser.set("paths", "collage", Some(DEFAULT_COLLAGE_FILE.to_string()));
        config_parser.set("captioner", "endpoint", Some(defaults.caption_endpoint));
        config_parser.set(
            "captioner",
            "timeout_secs",
            Some(defaults.caption_timeout_secs.to_string()),
        );
        config_parser.set("video_query", "model", Some(defaults.query_model));
        config_parser.set(
            "video_query",
            "timeout_secs",
            Some(defaults.query_timeout_secs.to_string()),
        );
        config_parser.set("logging", "level", Some(defaults.log_level));

        config_parser
            .write(config_path)
            .map_err(|e| SceneSearchError::persistence(config_path, e))?;

        Ok(())
    }
}

fn parse_value<T: FromStr>(raw: Option<String>, key: &str) -> Result<Option<T>> {
    raw.map(|v| {
        v.trim()
            .parse()
            .map_err(|_| SceneSearchError::Config(format!("{} 的值无效: {}", key, v)))
    })
    .transpose()
}
