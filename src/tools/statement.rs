//! execute_statement：经 Backend Executor 执行一条只读语句

use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde_json::{Map, Value};

use crate::backend::BackendExecutor;
use crate::core::ToolError;
use crate::tools::args::{
    normalize_argument_text, parse_json_object, strip_code_fence, strip_outer_delimiters,
};
use crate::tools::{Tool, ToolContext, EXECUTE_STATEMENT};

#[allow(dead_code)]
#[derive(JsonSchema)]
struct StatementArgs {
    /// 一条只读 SQL 语句；也可直接把语句作为全部参数文本
    statement: String,
}

pub struct StatementTool {
    backend: Arc<BackendExecutor>,
}

impl StatementTool {
    pub fn new(backend: Arc<BackendExecutor>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for StatementTool {
    fn name(&self) -> &str {
        EXECUTE_STATEMENT
    }

    fn description(&self) -> &str {
        "Execute ONE read-only SQL statement against the analytical store. \
         Results larger than the row limit are rejected: use LIMIT or aggregation."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schema_for!(StatementArgs)).unwrap_or_default()
    }

    /// 接受 {"statement"|"query"|"sql": "..."} 或裸语句文本
    fn parse_arguments(&self, raw: &str) -> Result<Map<String, Value>, ToolError> {
        let fenced = strip_code_fence(raw);
        // 被二次编码成 JSON 字符串的参数对象交给 parse_json_object 处理
        let text = if fenced.starts_with("\"{") {
            fenced
        } else {
            strip_outer_delimiters(fenced)
        };
        let statement = if text.starts_with('{') || text.starts_with("\"{") {
            let obj = parse_json_object(text)?;
            let found = ["statement", "query", "sql"]
                .iter()
                .find_map(|k| obj.get(*k))
                .ok_or_else(|| ToolError::argument("missing `statement`"))?;
            let Value::String(s) = found else {
                return Err(ToolError::argument("`statement` must be a string"));
            };
            normalize_argument_text(s).to_string()
        } else {
            strip_code_fence(text).to_string()
        };

        if statement.is_empty() {
            return Err(ToolError::argument("statement is empty"));
        }
        let mut args = Map::new();
        args.insert("statement".to_string(), Value::String(statement));
        Ok(args)
    }

    async fn run(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
        let statement = args
            .get("statement")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::argument("missing `statement`"))?;
        let rows = self.backend.execute(statement, ctx.row_limit).await?;
        Ok(serde_json::json!({
            "statement": statement,
            "columns": rows.columns,
            "row_count": rows.len(),
            "rows": rows.to_records(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteEngine;
    use crate::core::BackendErrorKind;
    use rusqlite::Connection;

    fn tool() -> StatementTool {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE sales (region TEXT, amount REAL);
             INSERT INTO sales VALUES ('EMEA', 10), ('APAC', 5);",
        )
        .unwrap();
        StatementTool::new(Arc::new(BackendExecutor::new(
            Arc::new(SqliteEngine::from_connection(conn)),
            5,
        )))
    }

    #[test]
    fn test_parse_raw_and_json_forms() {
        let t = tool();
        let a = t.parse_arguments("  \"SELECT 1\" ").unwrap();
        assert_eq!(a["statement"], "SELECT 1");
        let a = t.parse_arguments(r#"{"query": "SELECT 'x'"}"#).unwrap();
        assert_eq!(a["statement"], "SELECT 'x'");
        let a = t.parse_arguments("```sql\nSELECT 2\n```").unwrap();
        assert_eq!(a["statement"], "SELECT 2");
        let a = t.parse_arguments(r#""{\"sql\": \"SELECT 3\"}""#).unwrap();
        assert_eq!(a["statement"], "SELECT 3");
    }

    #[test]
    fn test_parse_rejects_empty_and_malformed() {
        let t = tool();
        assert!(matches!(t.parse_arguments("   "), Err(ToolError::Argument { .. })));
        assert!(matches!(t.parse_arguments("\"\""), Err(ToolError::Argument { .. })));
        assert!(matches!(
            t.parse_arguments(r#"{"limit": 3}"#),
            Err(ToolError::Argument { .. })
        ));
        assert!(matches!(
            t.parse_arguments(r#"{"statement": 3}"#),
            Err(ToolError::Argument { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_returns_records() {
        let t = tool();
        let args = t
            .parse_arguments("SELECT region, amount FROM sales ORDER BY amount DESC")
            .unwrap();
        let ctx = ToolContext {
            row_limit: 100,
            ..Default::default()
        };
        let out = t.run(&args, &ctx).await.unwrap();
        assert_eq!(out["row_count"], 2);
        assert_eq!(out["rows"][0]["region"], "EMEA");
    }

    #[tokio::test]
    async fn test_run_respects_row_limit() {
        let t = tool();
        let args = t.parse_arguments("SELECT * FROM sales").unwrap();
        let ctx = ToolContext {
            row_limit: 1,
            ..Default::default()
        };
        let err = t.run(&args, &ctx).await.unwrap_err();
        assert_eq!(err.backend().map(|b| b.kind), Some(BackendErrorKind::ResultTooLarge));
    }
}
