//! 工具参数文本的规范化与解析
//!
//! LLM 给出的参数常被包一层引号或 Markdown 代码块。这里只剥离“完整包住全文”的一层，
//! 内部字符一律不动：`"""SELECT ... 'x'"""` 去掉三引号，`SELECT 'a "quoted" word'` 原样保留。

use serde_json::{Map, Value};

use crate::core::ToolError;
use crate::tools::ToolContext;

/// 三引号优先于单字符引号
const DELIMITERS: [&str; 4] = ["\"\"\"", "'''", "\"", "'"];

/// 剥离至多一层外层定界符
///
/// 条件：去掉首尾空白后首尾是同一定界符，且中间不存在该定界符的未转义出现；
/// 否则返回去掉首尾空白的原文本。
/// 剥离后的内容同样去掉首尾空白（`" SELECT 1 "` 得到 `SELECT 1`），内部空白不变。
pub fn strip_outer_delimiters(text: &str) -> &str {
    let trimmed = text.trim();
    for delim in DELIMITERS {
        let d = delim.len();
        if trimmed.len() < 2 * d || !trimmed.starts_with(delim) || !trimmed.ends_with(delim) {
            continue;
        }
        let inner = &trimmed[d..trimmed.len() - d];
        if contains_unescaped(inner, delim) {
            return trimmed;
        }
        return inner.trim();
    }
    trimmed
}

fn contains_unescaped(haystack: &str, delim: &str) -> bool {
    let bytes = haystack.as_bytes();
    haystack.match_indices(delim).any(|(idx, _)| {
        let backslashes = bytes[..idx].iter().rev().take_while(|b| **b == b'\\').count();
        backslashes % 2 == 0
    })
}

/// 去掉完整包住全文的 Markdown 代码块（```sql ... ```）
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.len() < 6 || !trimmed.starts_with("```") || !trimmed.ends_with("```") {
        return trimmed;
    }
    let inner = &trimmed[3..trimmed.len() - 3];
    if inner.contains("```") {
        return trimmed;
    }
    // 首行若只有语言标记（sql / json 等）则一并去掉
    let inner = match inner.split_once('\n') {
        Some((lang, rest))
            if lang
                .trim()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') =>
        {
            rest
        }
        _ => inner,
    };
    inner.trim()
}

/// 代码块 -> 外层定界符，依次剥离
pub fn normalize_argument_text(raw: &str) -> &str {
    strip_outer_delimiters(strip_code_fence(raw))
}

/// 将参数文本解析为 JSON 对象；空文本得到空对象；兼容被二次编码为字符串的 JSON
pub fn parse_json_object(raw: &str) -> Result<Map<String, Value>, ToolError> {
    let text = strip_code_fence(raw);
    if text.is_empty() {
        return Ok(Map::new());
    }
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ToolError::argument(format!("arguments are not valid JSON: {e}")))?;
    match value {
        Value::Object(map) => Ok(map),
        Value::String(inner) => match serde_json::from_str::<Value>(inner.trim()) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(ToolError::argument("expected a JSON object of arguments")),
        },
        _ => Err(ToolError::argument("expected a JSON object of arguments")),
    }
}

/// 可选的字符串参数；类型不对时报 ArgumentError
pub fn optional_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<Option<&'a str>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(ToolError::argument(format!(
            "`{key}` must be a string, got {other}"
        ))),
    }
}

/// 可选的正数参数
pub fn optional_positive_f64(args: &Map<String, Value>, key: &str) -> Result<Option<f64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match as_number(v) {
            Some(x) if x > 0.0 && x.is_finite() => Ok(Some(x)),
            _ => Err(ToolError::argument(format!(
                "`{key}` must be a positive number, got {v}"
            ))),
        },
    }
}

/// 数字或数字字符串
pub fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|x| x.is_finite()),
        _ => None,
    }
}

/// 分析工具的数据来源：参数中的 `data`（对象数组、JSON 字符串或数字数组），
/// 缺省时使用最近一次成功抽取的结果行
pub fn records_argument(
    args: &Map<String, Value>,
    ctx: &ToolContext,
) -> Result<Vec<Map<String, Value>>, ToolError> {
    let data = match args.get("data") {
        None | Some(Value::Null) => return Ok(ctx.prior_records.clone()),
        Some(Value::String(s)) => serde_json::from_str::<Value>(strip_code_fence(s))
            .map_err(|e| ToolError::argument(format!("`data` is not valid JSON: {e}")))?,
        Some(v) => v.clone(),
    };
    let Value::Array(items) = data else {
        return Err(ToolError::argument("`data` must be an array of rows"));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(row) => Ok(row),
            v @ (Value::Number(_) | Value::String(_)) => {
                let mut row = Map::new();
                row.insert("value".to_string(), v);
                Ok(row)
            }
            other => Err(ToolError::argument(format!(
                "`data` rows must be objects or numbers, got {other}"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triple_quotes_stripped_interior_preserved() {
        assert_eq!(
            strip_outer_delimiters(r#""""SELECT * FROM t WHERE s = 'x'""""#),
            "SELECT * FROM t WHERE s = 'x'"
        );
        assert_eq!(
            strip_outer_delimiters("'''SELECT \"a\" FROM t'''"),
            "SELECT \"a\" FROM t"
        );
    }

    #[test]
    fn test_embedded_quotes_untouched() {
        let q = r#"SELECT 'a "quoted" word'"#;
        assert_eq!(strip_outer_delimiters(q), q);
        // 首尾相同但中间有未转义的同种引号：不是一个完整包裹
        let q = "'a' || 'b'";
        assert_eq!(strip_outer_delimiters(q), q);
    }

    #[test]
    fn test_whitespace_inside_stripped_layer_trimmed() {
        assert_eq!(strip_outer_delimiters("\" SELECT  1 \""), "SELECT  1");
        assert_eq!(strip_outer_delimiters("'''\n SELECT 1\n'''"), "SELECT 1");
    }

    #[test]
    fn test_single_layer_only() {
        assert_eq!(strip_outer_delimiters("\"'SELECT 1'\""), "'SELECT 1'");
        assert_eq!(strip_outer_delimiters("  \"SELECT 1\"  "), "SELECT 1");
    }

    #[test]
    fn test_escaped_delimiter_allows_strip() {
        assert_eq!(
            strip_outer_delimiters(r#""say \"hi\"""#),
            r#"say \"hi\""#
        );
    }

    #[test]
    fn test_clean_input_idempotent() {
        for q in [
            "SELECT region, SUM(amount) FROM sales GROUP BY region",
            "SELECT 'x'",
            "",
        ] {
            let once = strip_outer_delimiters(q);
            assert_eq!(once, q.trim());
            assert_eq!(strip_outer_delimiters(once), once);
        }
    }

    #[test]
    fn test_code_fence_removed() {
        assert_eq!(
            normalize_argument_text("```sql\nSELECT 1\n```"),
            "SELECT 1"
        );
        assert_eq!(strip_code_fence("```SELECT 1```"), "SELECT 1");
        assert_eq!(strip_code_fence("SELECT '```'"), "SELECT '```'");
    }

    #[test]
    fn test_parse_json_object_variants() {
        assert_eq!(parse_json_object("  ").unwrap().len(), 0);
        let m = parse_json_object(r#"{"threshold": 2}"#).unwrap();
        assert_eq!(m["threshold"], 2);
        let m = parse_json_object(r#""{\"x\": \"ds\"}""#).unwrap();
        assert_eq!(m["x"], "ds");
        let m = parse_json_object("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(m["a"], 1);
        assert!(matches!(
            parse_json_object("[1, 2]"),
            Err(ToolError::Argument { .. })
        ));
        assert!(matches!(
            parse_json_object("{not json"),
            Err(ToolError::Argument { .. })
        ));
    }

    #[test]
    fn test_records_argument_sources() {
        let mut prior = Map::new();
        prior.insert("y".into(), Value::from(1));
        let ctx = ToolContext {
            row_limit: 100,
            prior_records: vec![prior],
        };

        let empty = Map::new();
        assert_eq!(records_argument(&empty, &ctx).unwrap().len(), 1);

        let args = parse_json_object(r#"{"data": [3, 4.5]}"#).unwrap();
        let rows = records_argument(&args, &ctx).unwrap();
        assert_eq!(rows[1]["value"], 4.5);

        let args = parse_json_object(r#"{"data": "[{\"a\": 1}]"}"#).unwrap();
        assert_eq!(records_argument(&args, &ctx).unwrap()[0]["a"], 1);

        let args = parse_json_object(r#"{"data": {"a": 1}}"#).unwrap();
        assert!(records_argument(&args, &ctx).is_err());
    }
}
