use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::caption_index::CaptionIndex;
use crate::captioner::Captioner;
use crate::collage::{create_collage, CollageOutcome};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::frame_extractor::extract_scene_frames;
use crate::matcher::QueryMatcher;
use crate::metadata::ExtractionReport;
use crate::scene_detector::SceneDetector;
use crate::video_processor::FrameSource;
use crate::video_query::VideoQueryService;

/// 构建索引所需的参数
#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub detector: SceneDetector,
    /// 场景图片目录
    pub scene_dir: PathBuf,
    /// 字幕索引文件
    pub captions: PathBuf,
}

impl IndexSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            detector: SceneDetector::new(config.threshold, config.min_scene_length),
            scene_dir: config.scene_dir.clone(),
            captions: config.captions.clone(),
        }
    }
}

/// 索引来源
#[derive(Debug, Clone)]
pub enum IndexSource {
    /// 直接读取已有的索引文件
    Cached,
    /// 本次运行新建
    Built(ExtractionReport),
    /// 视频中没有检测到任何场景，保存了空索引
    NoScenes,
}

#[derive(Debug, Clone)]
pub struct IndexOutcome {
    pub index: CaptionIndex,
    pub source: IndexSource,
}

/// 确保字幕索引存在
///
/// 索引文件存在时直接读取，不打开视频也不调用字幕服务；不存在时依次执行
/// 场景检测、抽帧、生成字幕并保存。索引文件损坏直接返回错误。
/// `open_source` 和 `make_captioner` 只在需要构建时才会调用。
pub async fn ensure_index<S, C, OpenSource, MakeCaptioner>(
    settings: &IndexSettings,
    open_source: OpenSource,
    make_captioner: MakeCaptioner,
) -> Result<IndexOutcome>
where
    S: FrameSource,
    C: Captioner,
    OpenSource: FnOnce() -> Result<S>,
    MakeCaptioner: FnOnce() -> Result<C>,
{
    if let Some(index) = CaptionIndex::load(&settings.captions).map_err(|e| {
        error!("❌ [索引] 读取字幕索引失败: {}", e);
        e
    })? {
        info!(
            "📖 [索引] 使用已有字幕索引: {}（{} 条字幕）",
            settings.captions.display(),
            index.len()
        );
        return Ok(IndexOutcome {
            index,
            source: IndexSource::Cached,
        });
    }

    info!(
        "⏳ [索引] 未找到字幕索引 {}，开始构建",
        settings.captions.display()
    );
    // 先检查字幕服务凭证，避免解码完整个视频后才失败
    let captioner = make_captioner()?;
    let mut source = open_source()?;
    build_index(settings, &mut source, &captioner).await
}

/// 场景检测 -> 抽帧 -> 生成字幕 -> 保存索引
pub async fn build_index<S, C>(
    settings: &IndexSettings,
    source: &mut S,
    captioner: &C,
) -> Result<IndexOutcome>
where
    S: FrameSource + ?Sized,
    C: Captioner + ?Sized,
{
    let total_start = Instant::now();
    info!("🎬 [索引] 开始构建字幕索引");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // 1. 场景检测
    let detect_start = Instant::now();
    let start_times = settings.detector.detect_scenes(source).map_err(|e| {
        error!("❌ [索引] 场景检测失败: {}", e);
        e
    })?;
    let detect_duration = detect_start.elapsed();

    if start_times.is_empty() {
        warn!("⚠️  [索引] 视频中没有检测到任何场景，保存空索引");
        let index = CaptionIndex::new();
        index.save(&settings.captions)?;
        return Ok(IndexOutcome {
            index,
            source: IndexSource::NoScenes,
        });
    }

    // 2. 抽帧
    let extract_start = Instant::now();
    let report = extract_scene_frames(source, &start_times, &settings.scene_dir).map_err(|e| {
        error!("❌ [索引] 抽帧失败: {}", e);
        e
    })?;
    let extract_duration = extract_start.elapsed();
    if !report.is_complete() {
        warn!(
            "⚠️  [索引] {}/{} 个场景抽帧成功，失败的场景: {:?}",
            report.written_count(),
            report.scene_count(),
            report.failed
        );
    }

    // 3. 生成字幕并保存
    let caption_start = Instant::now();
    let index = CaptionIndex::build(
        report.scene_count(),
        &settings.scene_dir,
        captioner,
        &settings.captions,
    )
    .await
    .map_err(|e| {
        error!("❌ [索引] 生成字幕索引失败: {}", e);
        e
    })?;
    let caption_duration = caption_start.elapsed();

    let total_duration = total_start.elapsed();
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        "🎉 [索引] 构建完成！总耗时: {:.2}秒",
        total_duration.as_secs_f64()
    );
    info!("   • 场景检测: {:.2}秒", detect_duration.as_secs_f64());
    info!("   • 抽帧: {:.2}秒", extract_duration.as_secs_f64());
    info!("   • 生成字幕: {:.2}秒", caption_duration.as_secs_f64());
    info!(
        "📸 [索引] 场景数: {}，图片: {}，字幕: {}",
        report.scene_count(),
        report.written_count(),
        index.len()
    );

    Ok(IndexOutcome {
        index,
        source: IndexSource::Built(report),
    })
}

/// 一次检索的结果
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    /// 匹配的场景编号（升序）
    pub scenes: Vec<u32>,
    /// 有匹配时的拼图结果，没有匹配时为 `None`
    pub collage: Option<CollageOutcome>,
}

/// 按查询词检索场景，有匹配时生成拼图
pub fn search_scenes(
    index: &CaptionIndex,
    query: &str,
    matcher: &QueryMatcher,
    scene_dir: impl AsRef<Path>,
    collage_path: impl AsRef<Path>,
) -> Result<SearchOutcome> {
    let scenes = matcher.find(query, index);
    if scenes.is_empty() {
        info!("🔍 [检索] 没有场景匹配 '{}'", query);
        return Ok(SearchOutcome {
            scenes,
            collage: None,
        });
    }

    info!("🔍 [检索] '{}' 匹配到 {} 个场景: {:?}", query, scenes.len(), scenes);
    let collage = create_collage(&scenes, scene_dir, collage_path)?;
    Ok(SearchOutcome {
        scenes,
        collage: Some(collage),
    })
}

/// 视频检索结果
#[derive(Debug, Clone)]
pub struct AskOutcome {
    /// 服务返回的场景开始时间（秒）
    pub timestamps: Vec<f64>,
    /// 抽帧结果，没有时间戳时为 `None`
    pub report: Option<ExtractionReport>,
    pub collage: Option<CollageOutcome>,
}

/// 用视频检索服务定位场景，抽出对应帧并拼图
pub async fn ask_video<Q, S, OpenSource>(
    service: &Q,
    query: &str,
    video: &Path,
    open_source: OpenSource,
    output_dir: impl AsRef<Path>,
    collage_path: impl AsRef<Path>,
) -> Result<AskOutcome>
where
    Q: VideoQueryService + ?Sized,
    S: FrameSource,
    OpenSource: FnOnce() -> Result<S>,
{
    let output_dir = output_dir.as_ref();
    let query_start = Instant::now();
    info!("⏳ [视频检索] 正在检索: '{}'", query);

    let timestamps = service.query_video(query, video).await.map_err(|e| {
        error!("❌ [视频检索] 检索失败: {}", e);
        e
    })?;
    info!(
        "✅ [视频检索] 检索完成，耗时: {:.2}秒，{} 个时间点: {:?}",
        query_start.elapsed().as_secs_f64(),
        timestamps.len(),
        timestamps
    );

    if timestamps.is_empty() {
        return Ok(AskOutcome {
            timestamps,
            report: None,
            collage: None,
        });
    }

    let mut source = open_source()?;
    let report = extract_scene_frames(&mut source, &timestamps, output_dir)?;
    let scenes: Vec<u32> = report.scenes.iter().map(|scene| scene.index).collect();
    let collage = create_collage(&scenes, output_dir, collage_path)?;

    Ok(AskOutcome {
        timestamps,
        report: Some(report),
        collage: Some(collage),
    })
}
