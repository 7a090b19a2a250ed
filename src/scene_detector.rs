use image::DynamicImage;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::Result;
use crate::video_processor::FrameSource;

/// 默认场景变化阈值（HSV 内容差异单位）
pub const DEFAULT_THRESHOLD: f64 = 9.0;
/// 默认最小场景持续时间（秒）
pub const DEFAULT_MIN_SCENE_LENGTH: f64 = 0.6;

/// 尺寸不一致的两帧视为最大变化
const MAX_CONTENT_SCORE: f64 = 255.0;

/// 镜头切换检测器
///
/// 逐帧计算与上一帧的 HSV 内容差异，超过阈值即判定为新镜头；
/// 两次切换之间至少间隔 `min_scene_length * fps` 帧，过近的切换并入前一个镜头。
#[derive(Debug, Clone)]
pub struct SceneDetector {
    /// 场景变化阈值
    threshold: f64,
    /// 最小场景持续时间（秒）
    min_scene_length: f64,
}

impl Default for SceneDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_MIN_SCENE_LENGTH)
    }
}

impl SceneDetector {
    pub fn new(threshold: f64, min_scene_length: f64) -> Self {
        Self {
            threshold,
            min_scene_length,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// 两次切换之间的最小帧数（向下取整）
    pub fn min_gap_frames(&self, fps: f64) -> u64 {
        (self.min_scene_length * fps).max(0.0).floor() as u64
    }

    /// 计算两帧之间的内容差异
    /// 返回 H、S、V 三个通道平均绝对差的均值（H 取 0-180，S/V 取 0-255）
    pub fn calculate_frame_difference(&self, frame1: &DynamicImage, frame2: &DynamicImage) -> f64 {
        content_score(&HsvFrame::from_image(frame1), &HsvFrame::from_image(frame2))
    }

    /// 检测镜头切换点
    /// 返回每个场景的开始时间（秒），第一个场景总是从 0 开始
    pub fn detect_scenes<S: FrameSource + ?Sized>(&self, source: &mut S) -> Result<Vec<f64>> {
        let detect_start = Instant::now();
        let fps = source.frame_rate();
        let min_gap = self.min_gap_frames(fps);

        info!(
            "⏳ [场景检测] 开始检测（阈值: {:.1}, 最小场景间隔: {} 帧 @ {:.2} fps）",
            self.threshold, min_gap, fps
        );

        let mut tracker = BoundaryTracker::new(self.threshold, min_gap);
        let mut previous: Option<HsvFrame> = None;

        let frame_count = source.for_each_frame(&mut |frame_index, image| {
            let current = HsvFrame::from_image(image);
            match &previous {
                None => tracker.start(frame_index),
                Some(prev) => {
                    let score = content_score(prev, &current);
                    if tracker.observe(frame_index, score) {
                        debug!(
                            "[场景检测] 第 {} 帧检测到切换，差异: {:.2}",
                            frame_index, score
                        );
                    }
                }
            }
            previous = Some(current);
            Ok(())
        })?;

        let start_times = if frame_count == 0 {
            Vec::new()
        } else {
            start_times_from_cuts(tracker.cuts(), fps)
        };

        info!(
            "✅ [场景检测] 检测完成，耗时: {:.2}秒，共 {} 帧，{} 个场景",
            detect_start.elapsed().as_secs_f64(),
            frame_count,
            start_times.len()
        );

        Ok(start_times)
    }
}

/// 切换点跟踪：阈值判断 + 最小间隔合并
#[derive(Debug, Clone)]
pub struct BoundaryTracker {
    threshold: f64,
    min_gap: u64,
    last_cut: Option<u64>,
    cuts: Vec<u64>,
}

impl BoundaryTracker {
    pub fn new(threshold: f64, min_gap: u64) -> Self {
        Self {
            threshold,
            min_gap,
            last_cut: None,
            cuts: Vec::new(),
        }
    }

    /// 记录第一帧的位置，第一个切换点也要与它保持最小间隔
    pub fn start(&mut self, frame_index: u64) {
        self.last_cut.get_or_insert(frame_index);
    }

    /// 输入一帧的差异分数，判定为切换时返回 true
    pub fn observe(&mut self, frame_index: u64, score: f64) -> bool {
        let last_cut = *self.last_cut.get_or_insert(frame_index);
        if score < self.threshold || frame_index <= last_cut {
            return false;
        }
        if frame_index - last_cut < self.min_gap {
            return false;
        }
        self.cuts.push(frame_index);
        self.last_cut = Some(frame_index);
        true
    }

    pub fn cuts(&self) -> &[u64] {
        &self.cuts
    }
}

/// 切换帧号转换为场景开始时间，开头补 0
pub fn start_times_from_cuts(cuts: &[u64], fps: f64) -> Vec<f64> {
    std::iter::once(0.0)
        .chain(cuts.iter().map(|&frame| frame as f64 / fps))
        .collect()
}

/// 8 位 HSV 平面
struct HsvFrame {
    width: u32,
    height: u32,
    hue: Vec<u8>,
    saturation: Vec<u8>,
    value: Vec<u8>,
}

impl HsvFrame {
    fn from_image(image: &DynamicImage) -> Self {
        let rgb = image.to_rgb8();
        let pixel_count = (rgb.width() * rgb.height()) as usize;
        let mut hue = Vec::with_capacity(pixel_count);
        let mut saturation = Vec::with_capacity(pixel_count);
        let mut value = Vec::with_capacity(pixel_count);

        for pixel in rgb.pixels() {
            let (h, s, v) = rgb_to_hsv(pixel[0], pixel[1], pixel[2]);
            hue.push(h);
            saturation.push(s);
            value.push(v);
        }

        Self {
            width: rgb.width(),
            height: rgb.height(),
            hue,
            saturation,
            value,
        }
    }
}

/// HSV 内容差异分数
fn content_score(frame1: &HsvFrame, frame2: &HsvFrame) -> f64 {
    if frame1.width != frame2.width || frame1.height != frame2.height {
        return MAX_CONTENT_SCORE;
    }
    if frame1.hue.is_empty() {
        return 0.0;
    }

    let mean_delta = |a: &[u8], b: &[u8]| {
        let sum: u64 = a
            .iter()
            .zip(b)
            .map(|(&x, &y)| (x as i32 - y as i32).unsigned_abs() as u64)
            .sum();
        sum as f64 / a.len() as f64
    };

    let delta_hue = mean_delta(&frame1.hue, &frame2.hue);
    let delta_sat = mean_delta(&frame1.saturation, &frame2.saturation);
    let delta_val = mean_delta(&frame1.value, &frame2.value);

    (delta_hue + delta_sat + delta_val) / 3.0
}

/// RGB 转 8 位 HSV（H: 0-180, S: 0-255, V: 0-255）
fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let r = r as f64 / 255.0;
    let g = g as f64 / 255.0;
    let b = b as f64 / 255.0;

    let max = r.max(g.max(b));
    let min = r.min(g.min(b));
    let delta = max - min;

    // 色调（角度）
    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * (((b - r) / delta) + 2.0)
    } else {
        60.0 * (((r - g) / delta) + 4.0)
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    let s = if max == 0.0 { 0.0 } else { delta / max };

    (
        ((h / 2.0).round() as u32 % 180) as u8,
        (s * 255.0).round() as u8,
        (max * 255.0).round() as u8,
    )
}
