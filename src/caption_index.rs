use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::captioner::Captioner;
use crate::error::{Result, SceneSearchError};
use crate::metadata::scene_image_path;

/// 场景编号 -> 字幕文本
///
/// 按场景编号升序保存，遍历顺序即插入顺序。持久化为扁平 JSON 对象，
/// 键为字符串形式的场景编号。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptionIndex {
    entries: BTreeMap<u32, String>,
}

impl CaptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scene: u32, caption: impl Into<String>) {
        self.entries.insert(scene, caption.into());
    }

    pub fn get(&self, scene: u32) -> Option<&str> {
        self.entries.get(&scene).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 按场景编号升序遍历
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> + '_ {
        self.entries.iter().map(|(&scene, caption)| (scene, caption.as_str()))
    }

    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().is_file()
    }

    /// 读取索引文件
    ///
    /// 文件不存在返回 `Ok(None)`（需要重新构建），内容无法解析返回
    /// [`SceneSearchError::CorruptIndex`]。
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SceneSearchError::persistence(path, e)),
        };
        Self::from_json(&text, path).map(Some)
    }

    fn from_json(text: &str, path: &Path) -> Result<Self> {
        let corrupt = |reason: String| SceneSearchError::CorruptIndex {
            path: path.to_path_buf(),
            reason,
        };

        let raw: BTreeMap<String, String> =
            serde_json::from_str(text).map_err(|e| corrupt(e.to_string()))?;

        let mut entries = BTreeMap::new();
        for (key, caption) in raw {
            let scene = key
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|&scene| scene > 0)
                .ok_or_else(|| corrupt(format!("无效的场景编号: {:?}", key)))?;
            // "1" 和 "01" 指向同一个场景
            if entries.insert(scene, caption).is_some() {
                return Err(corrupt(format!("重复的场景编号: {:?}", key)));
            }
        }
        Ok(Self { entries })
    }

    /// 序列化为 4 空格缩进的 JSON
    pub fn to_json(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        self.entries.serialize(&mut serializer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = self.to_json().map_err(|e| {
            error!("❌ [字幕索引] 序列化索引失败: {}", e);
            e
        })?;
        std::fs::write(path, json).map_err(|e| {
            error!("❌ [字幕索引] 写入索引文件失败: {} - {}", path.display(), e);
            SceneSearchError::persistence(path, e)
        })
    }

    /// 为 `1..=scene_count` 的每个场景生成字幕并写入 `output`
    ///
    /// 场景按编号升序逐个调用字幕服务；图片不存在的场景直接跳过，
    /// 单个场景调用失败只记录日志。其他错误（如凭证失效）和写文件失败
    /// 则整体失败，不写出索引。
    pub async fn build<C: Captioner + ?Sized>(
        scene_count: usize,
        image_dir: impl AsRef<Path>,
        captioner: &C,
        output: impl AsRef<Path>,
    ) -> Result<Self> {
        let image_dir = image_dir.as_ref();
        let output = output.as_ref();
        let build_start = Instant::now();
        info!("⏳ [字幕索引] 正在为 {} 个场景生成字幕...", scene_count);

        let mut index = Self::new();
        for scene in 1..=scene_count as u32 {
            let image_path = scene_image_path(image_dir, scene);
            if !image_path.is_file() {
                warn!("⚠️  [字幕索引] 场景 {} 没有图片，跳过: {}", scene, image_path.display());
                continue;
            }

            match captioner.caption(&image_path).await {
                Ok(caption) => {
                    info!("📝 [字幕索引] 场景 {}: {}", scene, caption);
                    index.insert(scene, caption);
                }
                Err(e) if e.is_per_item() => {
                    error!("❌ [字幕索引] 场景 {} 生成字幕失败: {}", scene, e);
                }
                Err(e) => {
                    error!("❌ [字幕索引] 字幕服务不可用，终止构建: {}", e);
                    return Err(e);
                }
            }
        }

        index.save(output)?;
        info!(
            "✅ [字幕索引] 字幕已保存到 {}，耗时: {:.2}秒，{}/{} 个场景有字幕",
            output.display(),
            build_start.elapsed().as_secs_f64(),
            index.len(),
            scene_count
        );

        Ok(index)
    }
}

impl FromIterator<(u32, String)> for CaptionIndex {
    fn from_iter<I: IntoIterator<Item = (u32, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::{ImageBuffer, Rgb};
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// 按文件名返回固定字幕，`fail_on` 中的场景返回错误
    struct FakeCaptioner {
        fail_on: Vec<String>,
        calls: Mutex<Vec<PathBuf>>,
    }

    impl FakeCaptioner {
        fn new(fail_on: &[&str]) -> Self {
            Self {
                fail_on: fail_on.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Captioner for FakeCaptioner {
        async fn caption(&self, image_path: &Path) -> Result<String> {
            self.calls.lock().unwrap().push(image_path.to_path_buf());
            let name = image_path.file_stem().unwrap().to_string_lossy().to_string();
            if self.fail_on.contains(&name) {
                return Err(SceneSearchError::CaptionService("rate limited".to_string()));
            }
            Ok(format!("caption for {}", name))
        }
    }

    fn write_scene_images(dir: &Path, scenes: &[u32]) {
        for &scene in scenes {
            ImageBuffer::from_pixel(4, 4, Rgb([scene as u8, 0, 0]))
                .save(scene_image_path(dir, scene))
                .unwrap();
        }
    }

    #[test]
    fn test_load_absent_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene_captions.json");
        assert!(!CaptionIndex::exists(&path));
        assert!(CaptionIndex::load(&path).unwrap().is_none());
    }

    #[test]
    fn test_load_corrupt_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene_captions.json");

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            CaptionIndex::load(&path),
            Err(SceneSearchError::CorruptIndex { .. })
        ));

        std::fs::write(&path, r#"{"one": "a red car"}"#).unwrap();
        assert!(matches!(
            CaptionIndex::load(&path),
            Err(SceneSearchError::CorruptIndex { .. })
        ));

        std::fs::write(&path, r#"["a red car"]"#).unwrap();
        assert!(matches!(
            CaptionIndex::load(&path),
            Err(SceneSearchError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn test_json_format_and_numeric_order() {
        let index: CaptionIndex = vec![
            (10, "ten".to_string()),
            (2, "two".to_string()),
            (1, "one".to_string()),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            index.to_json().unwrap(),
            "{\n    \"1\": \"one\",\n    \"2\": \"two\",\n    \"10\": \"ten\"\n}"
        );
        assert_eq!(index.iter().map(|(s, _)| s).collect::<Vec<_>>(), vec![1, 2, 10]);
        assert_eq!(CaptionIndex::new().to_json().unwrap(), "{}");
    }

    #[test]
    fn test_save_writes_serialized_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("captions.json");
        let mut index = CaptionIndex::new();
        index.insert(2, "a blue sky");
        index.save(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, index.to_json().unwrap());
        assert_eq!(written, "{\n    \"2\": \"a blue sky\"\n}");
    }

    #[test]
    fn test_load_duplicate_scene_number_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene_captions.json");

        std::fs::write(&path, r#"{"1": "a red car", "01": "a blue sky"}"#).unwrap();
        match CaptionIndex::load(&path) {
            Err(SceneSearchError::CorruptIndex { reason, .. }) => {
                assert!(reason.contains("重复"), "unexpected reason: {}", reason)
            }
            other => panic!("expected CorruptIndex, got {:?}", other),
        }

        std::fs::write(&path, r#"{"1": "a red car", " 2": "a blue sky"}"#).unwrap();
        let loaded = CaptionIndex::load(&path).unwrap().unwrap();
        assert_eq!(loaded.get(2), Some("a blue sky"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("captions.json");
        let mut index = CaptionIndex::new();
        index.insert(1, "a red car driving");
        index.insert(3, "a red house on a hill");
        index.save(&path).unwrap();

        let loaded = CaptionIndex::load(&path).unwrap().unwrap();
        assert_eq!(loaded, index);
        assert_eq!(loaded.get(3), Some("a red house on a hill"));
        assert_eq!(loaded.get(2), None);
    }

    #[test]
    fn test_save_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("captions.json");
        assert!(matches!(
            CaptionIndex::new().save(&path),
            Err(SceneSearchError::Persistence { .. })
        ));
    }

    #[tokio::test]
    async fn test_build_skips_missing_and_failed_scenes() {
        let dir = tempfile::tempdir().unwrap();
        write_scene_images(dir.path(), &[1, 2, 4]);
        let captioner = FakeCaptioner::new(&["scene_2"]);
        let output = dir.path().join("scene_captions.json");

        let index = CaptionIndex::build(4, dir.path(), &captioner, &output).await.unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.get(1), Some("caption for scene_1"));
        assert_eq!(index.get(2), None);
        assert_eq!(index.get(3), None);
        assert_eq!(index.get(4), Some("caption for scene_4"));

        // 没有图片的场景不调用服务，其余按编号升序调用
        let calls = captioner.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                scene_image_path(dir.path(), 1),
                scene_image_path(dir.path(), 2),
                scene_image_path(dir.path(), 4),
            ]
        );

        let loaded = CaptionIndex::load(&output).unwrap().unwrap();
        assert_eq!(loaded, index);
    }

    /// 凭证失效时每次调用都返回同一个非场景级错误
    struct RevokedCaptioner;

    #[async_trait]
    impl Captioner for RevokedCaptioner {
        async fn caption(&self, _image_path: &Path) -> Result<String> {
            Err(SceneSearchError::MissingCredential("MOONDREAM_API_KEY"))
        }
    }

    #[tokio::test]
    async fn test_build_stops_on_service_level_error() {
        let dir = tempfile::tempdir().unwrap();
        write_scene_images(dir.path(), &[1, 2]);
        let output = dir.path().join("scene_captions.json");

        let result = CaptionIndex::build(2, dir.path(), &RevokedCaptioner, &output).await;

        assert!(matches!(
            result,
            Err(SceneSearchError::MissingCredential("MOONDREAM_API_KEY"))
        ));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_build_with_unwritable_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_scene_images(dir.path(), &[1]);
        let captioner = FakeCaptioner::new(&[]);
        let output = dir.path().join("no_such_dir").join("captions.json");

        let result = CaptionIndex::build(1, dir.path(), &captioner, &output).await;
        assert!(matches!(result, Err(SceneSearchError::Persistence { .. })));
    }
}
