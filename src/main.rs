use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, Level};

use scene_search::{
    ask_video, complete, ensure_index, search_scenes, unique_completion, vocabulary,
    CollageOutcome, ConfigLoader, ConfigOverrides, GeminiVideoQuery, IndexOutcome, IndexSettings,
    IndexSource, MoondreamCaptioner, PipelineConfig, QueryMatcher, VideoDecoder,
};

/// 视频场景检索工具 - 检测镜头、生成场景字幕、按关键词检索并拼图
#[derive(Parser, Debug)]
#[command(name = "scene-search")]
#[command(about = "视频场景检索：镜头检测、场景字幕索引、关键词检索与拼图", long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

/// 所有子命令共用的参数
/// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
#[derive(clap::Args, Debug)]
struct CommonArgs {
    /// 配置文件路径（可选，支持 .ini 格式）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 输入视频文件（环境变量 SCENE_SEARCH_VIDEO）
    #[arg(long, global = true)]
    video: Option<PathBuf>,

    /// 场景图片目录（环境变量 SCENE_SEARCH_SCENE_DIR）
    #[arg(long, global = true)]
    scene_dir: Option<PathBuf>,

    /// 字幕索引文件（环境变量 SCENE_SEARCH_CAPTIONS）
    #[arg(long, global = true)]
    captions: Option<PathBuf>,

    /// 拼图输出文件（环境变量 SCENE_SEARCH_COLLAGE）
    #[arg(long, global = true)]
    collage: Option<PathBuf>,

    /// 镜头切换阈值（环境变量 SCENE_SEARCH_THRESHOLD）
    #[arg(long, global = true)]
    threshold: Option<f64>,

    /// 最短镜头长度，单位秒（环境变量 SCENE_SEARCH_MIN_SCENE_LENGTH）
    #[arg(long, global = true)]
    min_scene_length: Option<f64>,

    /// 字幕匹配阈值 0-100（环境变量 SCENE_SEARCH_MATCH_THRESHOLD）
    #[arg(long, global = true)]
    match_threshold: Option<f64>,
}

impl CommonArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            threshold: self.threshold,
            min_scene_length: self.min_scene_length,
            match_threshold: self.match_threshold,
            video: self.video.clone(),
            scene_dir: self.scene_dir.clone(),
            captions: self.captions.clone(),
            collage: self.collage.clone(),
            ..Default::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 构建字幕索引（已存在时直接复用）
    Index,
    /// 按关键词检索场景并生成拼图
    Search {
        /// 查询词，省略时交互式输入（以 ? 结尾可查看补全）
        #[arg(short, long)]
        query: Option<String>,
    },
    /// 列出字幕词表
    Vocab,
    /// 用视频理解服务直接检索视频
    Ask {
        /// 自然语言查询
        #[arg(short, long)]
        query: String,

        /// 抽帧输出目录
        #[arg(short, long, default_value = "query_scenes")]
        output_dir: PathBuf,
    },
    /// 生成默认配置文件
    InitConfig {
        /// 配置文件路径
        #[arg(default_value = "scene-search.ini")]
        path: PathBuf,

        /// 覆盖已有文件
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    if let Commands::InitConfig { path, force } = &args.command {
        init_tracing(Level::INFO);
        if path.exists() && !force {
            bail!("配置文件已存在: {}（使用 --force 覆盖）", path.display());
        }
        ConfigLoader::create_default_config(path)
            .with_context(|| format!("写入配置文件失败: {}", path.display()))?;
        println!("Default configuration written to {}", path.display());
        return Ok(());
    }

    let loaded = ConfigLoader::load(args.common.config.as_deref(), args.common.overrides());

    // 先初始化日志，配置加载失败时的错误也要写进日志
    init_tracing(startup_level(&loaded));
    let config = loaded.context("加载配置失败")?;

    match args.command {
        Commands::Index => {
            let outcome = prepare_index(&config).await?;
            match &outcome.source {
                IndexSource::Cached => println!(
                    "Caption index already exists at {} ({} captions).",
                    config.captions.display(),
                    outcome.index.len()
                ),
                IndexSource::Built(report) => {
                    println!(
                        "Indexed {} scenes ({} images, {} captions) into {}.",
                        report.scene_count(),
                        report.written_count(),
                        outcome.index.len(),
                        config.captions.display()
                    );
                    if !report.failed.is_empty() {
                        println!("Scenes without an image: {:?}", report.failed);
                    }
                }
                IndexSource::NoScenes => println!("No scenes detected in the video."),
            }
        }
        Commands::Search { query } => {
            let outcome = prepare_index(&config).await?;
            let query = match query {
                Some(query) => query,
                None => prompt_query(&vocabulary(&outcome.index))?,
            };
            let query = query.trim();

            let matcher = QueryMatcher::new(config.match_threshold);
            let result = search_scenes(
                &outcome.index,
                query,
                &matcher,
                &config.scene_dir,
                &config.collage,
            )
            .context("检索失败")?;

            if result.scenes.is_empty() {
                println!("No scenes found for the word '{}'.", query);
                return Ok(());
            }

            let scenes: Vec<String> = result.scenes.iter().map(u32::to_string).collect();
            println!("Scenes matching '{}': {}", query, scenes.join(", "));
            match result.collage {
                Some(CollageOutcome::Written(path)) => {
                    println!("Collage saved to {}", path.display())
                }
                Some(CollageOutcome::NoContent) => {
                    println!("No scene images available for a collage.")
                }
                None => {}
            }
        }
        Commands::Vocab => {
            let outcome = prepare_index(&config).await?;
            for word in vocabulary(&outcome.index) {
                println!("{}", word);
            }
        }
        Commands::Ask { query, output_dir } => {
            let video = config.require_video()?.to_path_buf();
            let service = GeminiVideoQuery::from_env(config.query_model.clone(), config.query_timeout())
                .context("初始化视频检索服务失败")?;

            let outcome = ask_video(
                &service,
                &query,
                &video,
                || VideoDecoder::open(&video),
                &output_dir,
                &config.collage,
            )
            .await
            .context("视频检索失败")?;

            if outcome.timestamps.is_empty() {
                println!("No scenes found for '{}'.", query);
                return Ok(());
            }

            let times: Vec<String> = outcome
                .timestamps
                .iter()
                .map(|t| format!("{:.3}s", t))
                .collect();
            println!("Scenes matching '{}' start at: {}", query, times.join(", "));
            if let Some(CollageOutcome::Written(path)) = outcome.collage {
                println!("Collage saved to {}", path.display());
            }
        }
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

/// 日志级别：取配置中的级别，配置无法加载时退回 info
fn startup_level(config: &scene_search::Result<PipelineConfig>) -> Level {
    config
        .as_ref()
        .ok()
        .and_then(|config| config.tracing_level().ok())
        .unwrap_or(Level::INFO)
}

fn init_tracing(level: Level) {
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// 读取或构建字幕索引；需要构建时才检查视频路径和字幕服务凭证
async fn prepare_index(config: &PipelineConfig) -> Result<IndexOutcome> {
    let settings = IndexSettings::from_config(config);
    ensure_index(
        &settings,
        || VideoDecoder::open(config.require_video()?),
        || MoondreamCaptioner::from_env(config.caption_endpoint.clone(), config.caption_timeout()),
    )
    .await
    .context("准备字幕索引失败")
}

/// 交互式读取查询词
///
/// 以 `?` 结尾时列出词表中的补全并重新提示；前缀只有一个补全时自动展开。
fn prompt_query(vocabulary: &[String]) -> Result<String> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("Enter a word to search (end with '?' for suggestions): ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            bail!("没有读取到查询词");
        }
        let input = line.trim();

        if let Some(prefix) = input.strip_suffix('?') {
            let suggestions = complete(vocabulary, prefix);
            if suggestions.is_empty() {
                println!("No suggestions for '{}'.", prefix.trim());
            } else {
                println!("{}", suggestions.join("  "));
            }
            continue;
        }

        return Ok(match unique_completion(vocabulary, input) {
            Some(word) => word.to_string(),
            None => input.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scene_search::SceneSearchError;

    #[test]
    fn test_startup_level_follows_config() {
        let config = PipelineConfig {
            log_level: "debug".to_string(),
            ..PipelineConfig::default()
        };
        assert_eq!(startup_level(&Ok(config)), Level::DEBUG);
        assert_eq!(startup_level(&Ok(PipelineConfig::default())), Level::INFO);
    }

    #[test]
    fn test_startup_level_without_config() {
        let failed = Err(SceneSearchError::Config("配置文件不存在: missing.ini".to_string()));
        assert_eq!(startup_level(&failed), Level::INFO);

        let bad_level = PipelineConfig {
            log_level: "loud".to_string(),
            ..PipelineConfig::default()
        };
        assert_eq!(startup_level(&Ok(bad_level)), Level::INFO);
    }

    #[test]
    fn test_missing_config_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.ini");
        let loaded = ConfigLoader::load(Some(missing.as_path()), ConfigOverrides::default());
        assert!(loaded.is_err());
        assert_eq!(startup_level(&loaded), Level::INFO);
    }
}
