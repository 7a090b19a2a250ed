use ffmpeg_next as ffmpeg;
use image::{DynamicImage, RgbImage};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Result, SceneSearchError};

/// 场景检测时使用的分析宽度，降低分辨率以提高性能
const ANALYSIS_WIDTH: u32 = 256;

/// 容器未报告帧率时使用的默认值
const DEFAULT_FRAME_RATE: f64 = 30.0;

/// 视频帧来源
///
/// 场景检测按顺序遍历全部帧，抽帧时按帧号 seek 读取单帧。
/// 测试里可以用内存中的帧序列代替真实视频。
pub trait FrameSource {
    /// 平均帧率
    fn frame_rate(&self) -> f64;

    /// 按解码顺序遍历每一帧（缩小后的分析图像），帧号从 0 开始。
    /// 返回遍历的帧数。
    fn for_each_frame(
        &mut self,
        visit: &mut dyn FnMut(u64, &DynamicImage) -> Result<()>,
    ) -> Result<u64>;

    /// seek 到指定帧号并读取原始分辨率的 RGB 帧
    fn seek_and_read(&mut self, frame_number: u64) -> Result<DynamicImage>;
}

/// 视频基本信息
#[derive(Debug, Clone, Copy, PartialEq)]
struct VideoInfo {
    frame_rate: f64,
    width: u32,
    height: u32,
    /// 时长（秒），容器未报告时为 0
    duration: f64,
}

/// 基于 FFmpeg 的视频解码器
///
/// 打开时获取解封装句柄，drop 时释放，整个抽帧过程共用同一个句柄。
pub struct VideoDecoder {
    path: PathBuf,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    time_base: ffmpeg::Rational,
    /// 视频流起始时间（秒），用于把 pts 换算成帧号
    start_offset: f64,
    info: VideoInfo,
}

impl VideoDecoder {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let media_error = |reason: String| SceneSearchError::MediaAccess {
            path: path.clone(),
            reason,
        };

        if !path.is_file() {
            return Err(media_error("文件不存在".to_string()));
        }

        ffmpeg::init().map_err(|e| media_error(format!("初始化 FFmpeg 失败: {}", e)))?;

        // 只显示 FFmpeg 的错误和致命错误
        unsafe {
            ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
        }

        let input = ffmpeg::format::input(&path)
            .map_err(|e| media_error(format!("无法打开视频文件: {}", e)))?;

        let (stream_index, time_base, start_offset, frame_rate, parameters) = {
            let stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| media_error("未找到视频流".to_string()))?;

            let time_base = stream.time_base();
            let start_pts = stream.start_time();
            // AV_NOPTS_VALUE
            let start_offset = if start_pts == i64::MIN {
                0.0
            } else {
                rational_seconds(start_pts, time_base)
            };

            let rate = stream.avg_frame_rate();
            let frame_rate = if rate.numerator() > 0 && rate.denominator() > 0 {
                rate.numerator() as f64 / rate.denominator() as f64
            } else {
                DEFAULT_FRAME_RATE
            };

            (stream.index(), time_base, start_offset, frame_rate, stream.parameters())
        };

        let decoder = ffmpeg::codec::context::Context::from_parameters(parameters)
            .and_then(|context| context.decoder().video())
            .map_err(|e| media_error(format!("无法创建视频解码器: {}", e)))?;

        let duration = if input.duration() > 0 {
            input.duration() as f64 / 1_000_000.0
        } else {
            0.0
        };

        let info = VideoInfo {
            frame_rate,
            width: decoder.width(),
            height: decoder.height(),
            duration,
        };

        info!(
            "🎬 [解码器] 打开视频: {} ({}x{}, {:.2} fps, {:.2}秒)",
            path.display(),
            info.width,
            info.height,
            info.frame_rate,
            info.duration
        );

        Ok(Self {
            path,
            input,
            stream_index,
            time_base,
            start_offset,
            info,
        })
    }

    /// 为视频流创建一个新的解码器（每次遍历或 seek 都从干净状态开始）
    fn new_decoder(&self) -> Result<ffmpeg::decoder::Video> {
        let stream = self
            .input
            .stream(self.stream_index)
            .ok_or_else(|| SceneSearchError::Ffmpeg("视频流已失效".to_string()))?;
        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
        Ok(context.decoder().video()?)
    }
}

impl FrameSource for VideoDecoder {
    fn frame_rate(&self) -> f64 {
        self.info.frame_rate
    }

    fn for_each_frame(
        &mut self,
        visit: &mut dyn FnMut(u64, &DynamicImage) -> Result<()>,
    ) -> Result<u64> {
        // 之前可能做过 seek，回到开头
        if let Err(e) = self.input.seek(0, ..0) {
            debug!("[解码器] 回到视频开头失败（首次读取可忽略）: {}", e);
        }

        let mut decoder = self.new_decoder()?;
        let mut scaler: Option<ffmpeg::software::scaling::Context> = None;
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut frame_index = 0u64;

        let mut drain = |decoder: &mut ffmpeg::decoder::Video,
                         scaler: &mut Option<ffmpeg::software::scaling::Context>,
                         frame_index: &mut u64|
         -> Result<()> {
            while decoder.receive_frame(&mut decoded).is_ok() {
                if scaler.is_none() {
                    let (width, height) = analysis_size(decoded.width(), decoded.height());
                    *scaler = Some(ffmpeg::software::scaling::Context::get(
                        decoded.format(),
                        decoded.width(),
                        decoded.height(),
                        ffmpeg::format::Pixel::RGB24,
                        width,
                        height,
                        ffmpeg::software::scaling::Flags::BILINEAR,
                    )?);
                }

                let mut rgb_frame = ffmpeg::frame::Video::empty();
                if let Some(scaler) = scaler.as_mut() {
                    scaler.run(&decoded, &mut rgb_frame)?;
                }
                let image = frame_to_image(&rgb_frame)?;
                visit(*frame_index, &image)?;
                *frame_index += 1;
            }
            Ok(())
        };

        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            decoder
                .send_packet(&packet)
                .map_err(|e| SceneSearchError::MediaAccess {
                    path: self.path.clone(),
                    reason: format!("解码失败: {}", e),
                })?;
            drain(&mut decoder, &mut scaler, &mut frame_index)?;
        }

        decoder.send_eof()?;
        drain(&mut decoder, &mut scaler, &mut frame_index)?;

        debug!("[解码器] 顺序解码完成，共 {} 帧", frame_index);
        Ok(frame_index)
    }

    fn seek_and_read(&mut self, frame_number: u64) -> Result<DynamicImage> {
        let target_seconds = frame_number as f64 / self.info.frame_rate + self.start_offset;
        let timestamp = (target_seconds * 1_000_000.0) as i64;

        // 跳到目标之前最近的关键帧，再向后解码
        self.input.seek(timestamp, ..timestamp)?;

        let mut decoder = self.new_decoder()?;
        let (time_base, start_offset, frame_rate) =
            (self.time_base, self.start_offset, self.info.frame_rate);
        let reached = |frame: &ffmpeg::frame::Video| {
            frame_number_of(frame, time_base, start_offset, frame_rate)
                .is_some_and(|n| n >= frame_number)
        };
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut found: Option<ffmpeg::frame::Video> = None;

        'packets: for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            if decoder.send_packet(&packet).is_err() {
                continue;
            }
            while decoder.receive_frame(&mut decoded).is_ok() {
                if reached(&decoded) {
                    found = Some(decoded.clone());
                    break 'packets;
                }
            }
        }

        if found.is_none() {
            decoder.send_eof()?;
            while decoder.receive_frame(&mut decoded).is_ok() {
                if reached(&decoded) {
                    found = Some(decoded.clone());
                    break;
                }
            }
        }

        let frame = found.ok_or_else(|| {
            SceneSearchError::Ffmpeg(format!("在视频流中找不到第 {} 帧", frame_number))
        })?;

        let mut scaler = ffmpeg::software::scaling::Context::get(
            frame.format(),
            frame.width(),
            frame.height(),
            ffmpeg::format::Pixel::RGB24,
            frame.width(),
            frame.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )?;
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        scaler.run(&frame, &mut rgb_frame)?;
        frame_to_image(&rgb_frame)
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        debug!("🔚 [解码器] 释放视频句柄: {}", self.path.display());
    }
}

/// 解码帧的 pts 换算成帧号
fn frame_number_of(
    frame: &ffmpeg::frame::Video,
    time_base: ffmpeg::Rational,
    start_offset: f64,
    frame_rate: f64,
) -> Option<u64> {
    let pts = frame.timestamp().or_else(|| frame.pts())?;
    Some(frame_index_at(pts, time_base, start_offset, frame_rate))
}

/// pts 对应的帧号：先减去流的起始时间，早于起点的帧记为第 0 帧
fn frame_index_at(
    pts: i64,
    time_base: ffmpeg::Rational,
    start_offset: f64,
    frame_rate: f64,
) -> u64 {
    let seconds = rational_seconds(pts, time_base) - start_offset;
    (seconds.max(0.0) * frame_rate).round() as u64
}

fn rational_seconds(value: i64, time_base: ffmpeg::Rational) -> f64 {
    value as f64 * time_base.numerator() as f64 / time_base.denominator() as f64
}

/// 分析图像尺寸：宽度不超过 ANALYSIS_WIDTH，保持宽高比
fn analysis_size(width: u32, height: u32) -> (u32, u32) {
    if width <= ANALYSIS_WIDTH || width == 0 {
        return (width.max(1), height.max(1));
    }
    let scaled_height = (height as u64 * ANALYSIS_WIDTH as u64 / width as u64) as u32;
    (ANALYSIS_WIDTH, scaled_height.max(1))
}

/// 将 RGB24 格式的 FFmpeg 帧转换为 DynamicImage
fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<DynamicImage> {
    let width = frame.width();
    let height = frame.height();
    let stride = frame.stride(0);
    let row_bytes = width as usize * 3;
    let data = frame.data(0);

    let mut buffer = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        if end > data.len() {
            return Err(SceneSearchError::Ffmpeg("解码帧数据不完整".to_string()));
        }
        buffer.extend_from_slice(&data[start..end]);
    }

    RgbImage::from_raw(width, height, buffer)
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| SceneSearchError::Ffmpeg("无法从解码帧构建 RGB 图像".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_size_keeps_aspect() {
        assert_eq!(analysis_size(1920, 1080), (256, 144));
        assert_eq!(analysis_size(200, 100), (200, 100));
        assert_eq!(analysis_size(4000, 1), (256, 1));
    }

    #[test]
    fn test_frame_index_at() {
        let mpeg_ts = ffmpeg::Rational::new(1, 90_000);
        assert_eq!(frame_index_at(0, mpeg_ts, 0.0, 25.0), 0);
        assert_eq!(frame_index_at(90_000, mpeg_ts, 0.0, 25.0), 25);
        // 3600 = 0.04s，正好一帧
        assert_eq!(frame_index_at(3_600 * 7, mpeg_ts, 0.0, 25.0), 7);

        // 流从 1.4s 开始：pts 先减去起始时间
        assert_eq!(frame_index_at(126_000, mpeg_ts, 1.4, 25.0), 0);
        assert_eq!(frame_index_at(126_000 + 90_000, mpeg_ts, 1.4, 25.0), 25);
        // 起点之前的帧（B 帧重排等）不会变成负数
        assert_eq!(frame_index_at(90_000, mpeg_ts, 1.4, 25.0), 0);

        // 29.97 fps 的 1001/30000 时间基
        let ntsc = ffmpeg::Rational::new(1001, 30_000);
        assert_eq!(frame_index_at(300, ntsc, 0.0, 30_000.0 / 1001.0), 300);
        // 时间戳抖动按四舍五入归到最近的帧
        let ms = ffmpeg::Rational::new(1, 1000);
        assert_eq!(frame_index_at(1_033, ms, 0.0, 30.0), 31);
        assert_eq!(frame_index_at(1_050, ms, 0.0, 30.0), 32);
    }

    /// 用 ffmpeg 命令行生成 1 秒红色 + 1 秒蓝色、10 fps 的测试视频
    fn encode_two_color_video(path: &Path) {
        let status = std::process::Command::new("ffmpeg")
            .args([
                "-loglevel",
                "error",
                "-y",
                "-f",
                "lavfi",
                "-i",
                "color=c=red:s=64x48:r=10:d=1",
                "-f",
                "lavfi",
                "-i",
                "color=c=blue:s=64x48:r=10:d=1",
                "-filter_complex",
                "[0:v][1:v]concat=n=2:v=1:a=0,format=yuv420p[v]",
                "-map",
                "[v]",
                "-c:v",
                "mpeg4",
                "-q:v",
                "2",
                "-g",
                "5",
            ])
            .arg(path)
            .status()
            .expect("ffmpeg 命令行不可用");
        assert!(status.success(), "ffmpeg 生成测试视频失败");
    }

    fn is_red(image: &DynamicImage) -> bool {
        let pixel = image.to_rgb8().get_pixel(image.width() / 2, image.height() / 2).0;
        pixel[0] > 150 && pixel[2] < 100
    }

    fn is_blue(image: &DynamicImage) -> bool {
        let pixel = image.to_rgb8().get_pixel(image.width() / 2, image.height() / 2).0;
        pixel[2] > 150 && pixel[0] < 100
    }

    #[test]
    #[ignore = "需要系统安装 ffmpeg 命令行工具"]
    fn test_decode_and_seek_real_video() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("two_colors.mp4");
        encode_two_color_video(&path);

        let mut decoder = VideoDecoder::open(&path).unwrap();
        assert!((decoder.frame_rate() - 10.0).abs() < 1e-6);

        let mut colors = Vec::new();
        let count = decoder
            .for_each_frame(&mut |n, image| {
                assert_eq!(n as usize, colors.len());
                assert_eq!((image.width(), image.height()), (64, 48));
                colors.push((is_red(image), is_blue(image)));
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 20);
        assert!(colors[..10].iter().all(|&(red, _)| red));
        assert!(colors[10..].iter().all(|&(_, blue)| blue));

        // 乱序 seek，包括非关键帧和回退
        for frame_number in [15u64, 3, 10, 9, 19, 0] {
            let image = decoder.seek_and_read(frame_number).unwrap();
            assert_eq!((image.width(), image.height()), (64, 48));
            if frame_number < 10 {
                assert!(is_red(&image), "frame {} should be red", frame_number);
            } else {
                assert!(is_blue(&image), "frame {} should be blue", frame_number);
            }
        }

        assert!(decoder.seek_and_read(200).is_err());

        // seek 之后重新顺序遍历仍从第 0 帧开始
        let again = decoder.for_each_frame(&mut |_, _| Ok(())).unwrap();
        assert_eq!(again, 20);
    }

    #[test]
    fn test_open_missing_file() {
        let result = VideoDecoder::open("this_video_does_not_exist.mp4");
        match result {
            Err(SceneSearchError::MediaAccess { path, .. }) => {
                assert_eq!(path, PathBuf::from("this_video_does_not_exist.mp4"));
            }
            other => panic!("期望 MediaAccess 错误, 实际: {:?}", other.err()),
        }
    }

    #[test]
    fn test_open_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invalid.mp4");
        std::fs::write(&path, b"this is not a video").unwrap();

        let result = VideoDecoder::open(&path);
        assert!(matches!(result, Err(SceneSearchError::MediaAccess { .. })));
    }
}
