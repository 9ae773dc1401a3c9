//! 分词：供语义模式检索使用
//!
//! 小写化，按非字母数字切分；去掉单字符与常见 SQL / 英文停用词。

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

static WORD: OnceLock<Regex> = OnceLock::new();

fn word_regex() -> &'static Regex {
    WORD.get_or_init(|| Regex::new(r"[\p{L}\p{N}_]+").expect("static regex"))
}

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "of", "for", "by", "to", "in", "on", "and", "or", "me", "show", "what",
    "is", "are", "was", "were", "select", "from", "as", "with",
];

/// 分词为小写词序列
pub fn tokenize(text: &str) -> Vec<String> {
    word_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|w| w.chars().count() > 1 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// 分词为集合（去重）
pub fn token_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_drops_stop_words_and_punctuation() {
        let tokens = tokenize("Show me the monthly revenue, by region!");
        assert_eq!(tokens, vec!["monthly", "revenue", "region"]);
    }

    #[test]
    fn test_tokenize_keeps_identifiers() {
        let tokens = tokenize("SUM(amount) FROM transactions GROUP BY product_name");
        assert!(tokens.contains(&"amount".to_string()));
        assert!(tokens.contains(&"product_name".to_string()));
        assert!(!tokens.contains(&"from".to_string()));
    }
}
