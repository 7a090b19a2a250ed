//! 模糊字符串相似度
//!
//! `partial_ratio` 衡量短字符串在长字符串中被"包含"的程度：把短串与长串中
//! 每个等长子串（以及两端较短的前缀/后缀子串）做归一化 indel 相似度比较，
//! 取最大值。结果范围 0-100，100 表示短串完整出现在长串中。

/// 部分匹配相似度（0-100）
pub fn partial_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() && b.is_empty() {
        return 100.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    if a.len() < b.len() {
        best_alignment(&a, &b)
    } else if a.len() > b.len() {
        best_alignment(&b, &a)
    } else {
        best_alignment(&a, &b).max(best_alignment(&b, &a))
    }
}

/// needle 与 haystack 所有对齐位置中的最高分
fn best_alignment(needle: &[char], haystack: &[char]) -> f64 {
    let n = needle.len();
    let m = haystack.len();
    let mut best = 0.0f64;

    let mut consider = |window: &[char]| -> bool {
        best = best.max(ratio_chars(needle, window));
        best >= 100.0
    };

    // 左端较短的前缀
    for end in 1..n {
        if consider(&haystack[..end]) {
            return 100.0;
        }
    }
    // 完整长度的窗口
    for start in 0..=(m - n) {
        if consider(&haystack[start..start + n]) {
            return 100.0;
        }
    }
    // 右端较短的后缀
    for start in (m - n + 1)..m {
        if consider(&haystack[start..]) {
            return 100.0;
        }
    }

    best
}

/// 两个字符序列的归一化 indel 相似度（0-100）
fn ratio_chars(a: &[char], b: &[char]) -> f64 {
    let total = a.len() + b.len();
    if total == 0 {
        return 100.0;
    }
    100.0 * 2.0 * longest_common_subsequence(a, b) as f64 / total as f64
}

fn longest_common_subsequence(a: &[char], b: &[char]) -> usize {
    let mut previous = vec![0usize; b.len() + 1];
    let mut current = vec![0usize; b.len() + 1];

    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            current[j + 1] = if ca == cb {
                previous[j] + 1
            } else {
                current[j].max(previous[j + 1])
            };
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn ratio(a: &str, b: &str) -> f64 {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();
        ratio_chars(&a, &b)
    }

    #[test]
    fn test_ratio() {
        assert!(approx(ratio("house", "house"), 100.0));
        assert!(approx(ratio("abc", "xyz"), 0.0));
        assert!(approx(ratio("abcd", "abce"), 75.0));
        assert!(approx(ratio("", ""), 100.0));
    }

    #[test]
    fn test_partial_ratio_contained() {
        assert!(approx(partial_ratio("red", "a red car driving"), 100.0));
        assert!(approx(partial_ratio("a red car driving", "red"), 100.0));
        assert!(approx(partial_ratio("this is a test", "this is a test!"), 100.0));
    }

    #[test]
    fn test_partial_ratio_tolerates_minor_edits() {
        assert!(approx(partial_ratio("huose", "a red house on a hill"), 80.0));
        assert!(approx(partial_ratio("abcd", "xxabdxx"), 75.0));
    }

    #[test]
    fn test_partial_ratio_unrelated() {
        let score = partial_ratio("red", "a blue sky with clouds");
        assert!(score < 70.0, "score = {}", score);
    }

    #[test]
    fn test_partial_ratio_edges() {
        assert!(approx(partial_ratio("", ""), 100.0));
        assert!(approx(partial_ratio("", "caption"), 0.0));
        assert!(approx(partial_ratio("query", ""), 0.0));
        // 左右边缘的部分对齐
        assert!(approx(partial_ratio("xab", "abyyyy"), 80.0));
    }

    #[test]
    fn test_partial_ratio_unicode() {
        assert!(approx(partial_ratio("café", "un café noir"), 100.0));
    }
}
