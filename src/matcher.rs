use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, error};

use crate::caption_index::CaptionIndex;
use crate::fuzzy::partial_ratio;

/// 默认匹配阈值
pub const DEFAULT_MATCH_THRESHOLD: f64 = 70.0;

/// 词表提取时从词两端去掉的标点
const TOKEN_PUNCTUATION: &[char] = &[',', '.', '!', '?'];

/// 字幕检索：用部分匹配相似度比较查询词和每条字幕
#[derive(Debug, Clone)]
pub struct QueryMatcher {
    threshold: f64,
}

impl Default for QueryMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl QueryMatcher {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// 返回得分不低于阈值的场景编号
    ///
    /// 查询词和字幕都只做小写处理，标点保留。结果按场景编号升序排列，
    /// 与得分高低无关。
    pub fn find(&self, query: &str, index: &CaptionIndex) -> Vec<u32> {
        let query = query.to_lowercase();
        index
            .iter()
            .filter(|(scene, caption)| {
                let score = partial_ratio(&query, &caption.to_lowercase());
                debug!("[检索] 场景 {} 得分 {:.1}: {}", scene, score, caption);
                score >= self.threshold
            })
            .map(|(scene, _)| scene)
            .collect()
    }

    /// 直接从索引文件检索
    ///
    /// 文件不存在或内容损坏时记录错误并返回空结果。
    pub fn search_file(&self, query: &str, captions_path: impl AsRef<Path>) -> Vec<u32> {
        let captions_path = captions_path.as_ref();
        match CaptionIndex::load(captions_path) {
            Ok(Some(index)) => self.find(query, &index),
            Ok(None) => {
                error!("❌ [检索] 字幕索引文件不存在: {}", captions_path.display());
                Vec::new()
            }
            Err(e) => {
                error!("❌ [检索] 读取字幕索引失败: {}", e);
                Vec::new()
            }
        }
    }
}

/// 从所有字幕中提取去重、排序后的小写词表，用于输入补全
pub fn vocabulary(index: &CaptionIndex) -> Vec<String> {
    let words: BTreeSet<String> = index
        .iter()
        .flat_map(|(_, caption)| caption.split_whitespace())
        .map(|word| word.trim_matches(TOKEN_PUNCTUATION).to_lowercase())
        .filter(|word| !word.is_empty())
        .collect();
    words.into_iter().collect()
}

/// 词表中以 `prefix` 开头的词（忽略大小写），保持词表顺序
pub fn complete<'a>(vocabulary: &'a [String], prefix: &str) -> Vec<&'a str> {
    let prefix = prefix.trim().to_lowercase();
    vocabulary
        .iter()
        .filter(|word| word.starts_with(&prefix))
        .map(String::as_str)
        .collect()
}

/// 前缀在词表中只有一个补全时返回该词
pub fn unique_completion<'a>(vocabulary: &'a [String], prefix: &str) -> Option<&'a str> {
    if prefix.trim().is_empty() {
        return None;
    }
    match complete(vocabulary, prefix).as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}
