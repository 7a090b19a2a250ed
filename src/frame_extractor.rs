use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SceneSearchError};
use crate::metadata::{scene_image_path, ExtractionReport, Scene};
use crate::video_processor::FrameSource;

/// 场景开始时间对应的帧号
pub fn frame_number_for(start_time_seconds: f64, fps: f64) -> u64 {
    (fps * start_time_seconds).max(0.0).round() as u64
}

/// 为每个场景抽取一帧代表图，保存为 `scene_<编号>.jpg`
///
/// 场景编号在抽帧前按顺序分配（从 1 开始），单个场景失败只记录日志并跳过，
/// 不影响后续场景的编号。输出目录无法创建时整体失败。
pub fn extract_scene_frames<S: FrameSource + ?Sized>(
    source: &mut S,
    start_times: &[f64],
    output_dir: impl AsRef<Path>,
) -> Result<ExtractionReport> {
    let output_dir = output_dir.as_ref();
    let extract_start = Instant::now();

    if !output_dir.exists() {
        std::fs::create_dir_all(output_dir).map_err(|e| {
            error!("❌ [抽帧] 创建输出目录失败: {} - {}", output_dir.display(), e);
            SceneSearchError::persistence(output_dir, e)
        })?;
        info!("📁 [抽帧] 已创建输出目录: {}", output_dir.display());
    }

    let fps = source.frame_rate();
    let mut report = ExtractionReport::default();

    for (i, &start_time) in start_times.iter().enumerate() {
        let index = (i + 1) as u32;
        let frame_number = frame_number_for(start_time, fps);
        let image_path = scene_image_path(output_dir, index);

        match save_scene_frame(source, index, frame_number, &image_path) {
            Ok(()) => {
                debug!(
                    "💾 [抽帧] 已保存: {} (帧 {}, 时间: {:.3}s)",
                    image_path.display(),
                    frame_number,
                    start_time
                );
            }
            Err(e) => {
                warn!("⚠️  [抽帧] 场景 {} 抽帧失败，跳过: {}", index, e);
                remove_stale_image(&image_path);
                report.failed.push(index);
            }
        }

        report.scenes.push(Scene {
            index,
            start_time_seconds: start_time,
            frame_number,
            image_path,
        });
    }

    info!(
        "✅ [抽帧] 抽帧完成，耗时: {:.2}秒，成功 {}/{} 个场景",
        extract_start.elapsed().as_secs_f64(),
        report.written_count(),
        report.scene_count()
    );
    if !report.is_complete() {
        warn!("⚠️  [抽帧] 以下场景没有图片，将无法被检索: {:?}", report.failed);
    }

    Ok(report)
}

fn save_scene_frame<S: FrameSource + ?Sized>(
    source: &mut S,
    index: u32,
    frame_number: u64,
    image_path: &Path,
) -> Result<()> {
    let frame = source
        .seek_and_read(frame_number)
        .map_err(|e| SceneSearchError::FrameExtraction {
            scene: index,
            frame_number,
            reason: e.to_string(),
        })?;
    frame
        .to_rgb8()
        .save(image_path)
        .map_err(|e| SceneSearchError::FrameExtraction {
            scene: index,
            frame_number,
            reason: format!("保存图片失败 {}: {}", image_path.display(), e),
        })
}

/// 删除上一次运行留下的同名图片，失败的场景不能带着旧画面进入拼图
fn remove_stale_image(image_path: &Path) {
    match std::fs::remove_file(image_path) {
        Ok(()) => debug!("🗑️  [抽帧] 已删除旧图片: {}", image_path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("⚠️  [抽帧] 删除旧图片失败 {}: {}", image_path.display(), e),
    }
}
