use image::{imageops, DynamicImage, RgbImage};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::error::{Result, SceneSearchError};
use crate::metadata::scene_image_path;

/// 拼图最多列数
pub const MAX_COLUMNS: u32 = 4;

/// 拼图结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollageOutcome {
    /// 拼图已写入该路径
    Written(PathBuf),
    /// 没有可用的场景图片，未写任何文件
    NoContent,
}

/// 网格布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridLayout {
    pub columns: u32,
    pub rows: u32,
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// 每张图片左上角在画布中的位置，按输入顺序
    pub offsets: Vec<(u32, u32)>,
}

/// 计算 `count` 张图片的网格布局，所有格子使用同一尺寸（按行优先排列）
pub fn grid_layout(count: usize, cell_width: u32, cell_height: u32) -> Option<GridLayout> {
    if count == 0 {
        return None;
    }
    let count = count as u32;
    let columns = count.min(MAX_COLUMNS);
    let rows = count.div_ceil(columns);

    let offsets = (0..count)
        .map(|idx| ((idx % columns) * cell_width, (idx / columns) * cell_height))
        .collect();

    Some(GridLayout {
        columns,
        rows,
        canvas_width: columns * cell_width,
        canvas_height: rows * cell_height,
        offsets,
    })
}

/// 把图片按网格拼到一张画布上
///
/// 格子尺寸取第一张图片的尺寸；尺寸不同的图片不缩放，直接贴在格子左上角，
/// 超出画布的部分被裁掉。
pub fn compose_images(images: &[DynamicImage]) -> Option<RgbImage> {
    let first = images.first()?;
    let layout = grid_layout(images.len(), first.width(), first.height())?;

    let mut canvas = RgbImage::new(layout.canvas_width, layout.canvas_height);
    for (image, &(x, y)) in images.iter().zip(&layout.offsets) {
        imageops::replace(&mut canvas, &image.to_rgb8(), x as i64, y as i64);
    }
    Some(canvas)
}

/// 根据场景编号读取 `scene_<编号>.jpg` 并拼成一张图片写入 `output_path`
///
/// 没有图片文件的场景直接忽略；一张图片都没有时返回
/// [`CollageOutcome::NoContent`]，不写文件。图片损坏或输出路径不可写时返回错误。
pub fn create_collage(
    scenes: &[u32],
    image_dir: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
) -> Result<CollageOutcome> {
    let image_dir = image_dir.as_ref();
    let output_path = output_path.as_ref();

    let mut images = Vec::new();
    for &scene in scenes {
        let path = scene_image_path(image_dir, scene);
        if !path.is_file() {
            continue;
        }
        let image = image::open(&path).map_err(|e| {
            error!("❌ [拼图] 读取场景图片失败: {} - {}", path.display(), e);
            SceneSearchError::Image(e)
        })?;
        images.push(image);
    }

    let Some(canvas) = compose_images(&images) else {
        warn!("⚠️  [拼图] 没有找到可用的场景图片");
        return Ok(CollageOutcome::NoContent);
    };

    canvas.save(output_path).map_err(|e| {
        error!("❌ [拼图] 保存拼图失败: {} - {}", output_path.display(), e);
        match e {
            image::ImageError::IoError(io) => SceneSearchError::persistence(output_path, io),
            other => SceneSearchError::Image(other),
        }
    })?;

    info!(
        "✅ [拼图] 拼图已保存到 {}（{} 张图片，{}x{}）",
        output_path.display(),
        images.len(),
        canvas.width(),
        canvas.height()
    );
    Ok(CollageOutcome::Written(output_path.to_path_buf()))
}
