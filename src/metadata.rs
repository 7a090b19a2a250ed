use std::path::{Path, PathBuf};

/// 场景图片文件名：`scene_<编号>.jpg`
pub fn scene_image_name(index: u32) -> String {
    format!("scene_{}.jpg", index)
}

/// 场景图片在目录中的完整路径
pub fn scene_image_path(image_dir: impl AsRef<Path>, index: u32) -> PathBuf {
    image_dir.as_ref().join(scene_image_name(index))
}

/// 单个场景（镜头）
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    /// 场景编号（从 1 开始，连续无空洞）
    pub index: u32,
    /// 场景开始时间（秒）
    pub start_time_seconds: f64,
    /// 用于 seek 的帧号
    pub frame_number: u64,
    /// 代表帧图片路径
    pub image_path: PathBuf,
}

/// 抽帧结果汇总
#[derive(Debug, Clone, Default)]
pub struct ExtractionReport {
    /// 所有场景，编号在抽帧前就已确定
    pub scenes: Vec<Scene>,
    /// 抽帧或写图失败的场景编号
    pub failed: Vec<u32>,
}

impl ExtractionReport {
    /// 处理过的场景总数（包括失败的场景）
    pub fn scene_count(&self) -> usize {
        self.scenes.len()
    }

    /// 成功写出图片的场景数
    pub fn written_count(&self) -> usize {
        self.scenes.len() - self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_image_path() {
        let path = scene_image_path("scene_image", 12);
        assert_eq!(path, PathBuf::from("scene_image").join("scene_12.jpg"));
    }

    #[test]
    fn test_report_counts() {
        let scenes = (1..=3)
            .map(|i| Scene {
                index: i,
                start_time_seconds: i as f64,
                frame_number: i as u64 * 30,
                image_path: scene_image_path("out", i),
            })
            .collect();
        let report = ExtractionReport {
            scenes,
            failed: vec![2],
        };
        assert_eq!(report.scene_count(), 3);
        assert_eq!(report.written_count(), 2);
        assert!(!report.is_complete());
    }
}
