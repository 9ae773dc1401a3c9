//! 错误恢复引擎（自愈循环）
//!
//! 把一次失败的尝试变成反馈给同一个 Worker 的诊断文本；失败次数达到 max_retries 时改为终止，
//! 并根据最后一次错误生成用户可见的说明。

use serde_json::{Map, Value};

use crate::core::{
    BackendErrorKind, ConversationState, HaltReason, RecoveryAction, RunError, ToolError,
};

#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_retries: u32,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RecoveryEngine {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// 工具结果写回对话的文本：成功为载荷 JSON，失败为自愈诊断
    pub fn tool_feedback(
        &self,
        tool_name: &str,
        arguments: &Map<String, Value>,
        outcome: &Result<Value, ToolError>,
        allowed_tools: &[&str],
    ) -> String {
        match outcome {
            Ok(payload) => payload.to_string(),
            Err(err) => self.failure_feedback(tool_name, arguments, err, allowed_tools),
        }
    }

    fn failure_feedback(
        &self,
        tool_name: &str,
        arguments: &Map<String, Value>,
        err: &ToolError,
        allowed_tools: &[&str],
    ) -> String {
        match err {
            ToolError::Backend(e) => {
                let statement = arguments
                    .get("statement")
                    .and_then(|v| v.as_str())
                    .unwrap_or("(none)");
                let instruction = match e.kind {
                    BackendErrorKind::ResultTooLarge => format!(
                        "The result is too large to return. REWRITE your query using LIMIT or aggregation \
                         (GROUP BY, SUM, COUNT), then call {tool_name} again."
                    ),
                    _ if e.timed_out => format!(
                        "The statement took too long and was stopped. Simplify it or aggregate earlier, \
                         then call {tool_name} again."
                    ),
                    _ => format!(
                        "Do not apologize. Analyze the error, check the schema for the correct table and \
                         column names, correct the statement and call {tool_name} again."
                    ),
                };
                format!(
                    "DATABASE ERROR: {e}\nPROCESSED QUERY: {statement}\nINSTRUCTION: {instruction}"
                )
            }
            ToolError::Argument { message } => format!(
                "ARGUMENT ERROR: {message}\nINSTRUCTION: Call {tool_name} again with valid arguments."
            ),
            ToolError::UnknownTool { name } => format!(
                "UNKNOWN TOOL: {name}\nINSTRUCTION: Use one of: {}.",
                allowed_tools.join(", ")
            ),
            ToolError::Computation { message } => format!(
                "COMPUTATION ERROR: {message}\nINSTRUCTION: Check the data and the arguments, then try again."
            ),
        }
    }

    /// Worker 输出不可用（completion 失败、格式错误）时的反馈
    pub fn worker_error_feedback(&self, detail: &str) -> String {
        format!(
            "FORMAT ERROR: {detail}\nINSTRUCTION: Reply with exactly one JSON tool call \
             {{\"tool\": \"<name>\", \"args\": ...}} or with `Final Answer: <text>`."
        )
    }

    /// 失败已记录之后调用：未达上限则让同一 Worker 重试，否则终止
    pub fn handle_failure(&self, state: &ConversationState, feedback: String) -> RecoveryAction {
        if state.retry_count() >= self.max_retries {
            RecoveryAction::Halt {
                reason: HaltReason::MaxRetriesExceeded,
                explanation: self.exhausted_explanation(state),
            }
        } else {
            RecoveryAction::RetryWithPrompt(feedback)
        }
    }

    /// RoutingError 不重试，直接终止
    pub fn handle_run_error(&self, err: &RunError) -> RecoveryAction {
        RecoveryAction::Halt {
            reason: HaltReason::FatalError,
            explanation: format!("The request could not be routed: {err}"),
        }
    }

    fn exhausted_explanation(&self, state: &ConversationState) -> String {
        let last = state.last_error().unwrap_or("unknown error");
        format!(
            "I could not complete the request after {} failed attempts. Last error: {last}",
            state.retry_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BackendError, WorkerId};

    fn stmt_args(s: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("statement".into(), Value::from(s));
        m
    }

    #[test]
    fn test_catalog_error_feedback_mentions_query() {
        let engine = RecoveryEngine::new(3);
        let err = ToolError::Backend(BackendError::new(
            BackendErrorKind::CatalogError,
            "no such column: amout",
        ));
        let text = engine.tool_feedback(
            "execute_statement",
            &stmt_args("SELECT amout FROM sales"),
            &Err(err),
            &["execute_statement"],
        );
        assert!(text.starts_with("DATABASE ERROR: CatalogError: no such column: amout"));
        assert!(text.contains("PROCESSED QUERY: SELECT amout FROM sales"));
        assert!(text.contains("Do not apologize"));
    }

    #[test]
    fn test_result_too_large_feedback_asks_for_limit() {
        let engine = RecoveryEngine::new(3);
        let err = ToolError::Backend(BackendError::result_too_large(101, 100));
        let text = engine.tool_feedback("execute_statement", &stmt_args("SELECT *"), &Err(err), &[]);
        assert!(text.contains("LIMIT or aggregation"));
    }

    #[test]
    fn test_unknown_tool_lists_allowed() {
        let engine = RecoveryEngine::new(3);
        let err = ToolError::UnknownTool { name: "drop".into() };
        let text = engine.tool_feedback("drop", &Map::new(), &Err(err), &["a", "b"]);
        assert!(text.contains("Use one of: a, b."));
    }

    #[test]
    fn test_handle_failure_halts_at_limit() {
        let engine = RecoveryEngine::new(2);
        let mut state = ConversationState::new("r", "q");
        state.delegate_to(WorkerId::Engineer);

        state.record_worker_error(WorkerId::Engineer, "bad json", "fb".into());
        assert!(matches!(
            engine.handle_failure(&state, "fb".into()),
            RecoveryAction::RetryWithPrompt(_)
        ));

        state.record_worker_error(WorkerId::Engineer, "bad json again", "fb".into());
        match engine.handle_failure(&state, "fb".into()) {
            RecoveryAction::Halt { reason, explanation } => {
                assert_eq!(reason, HaltReason::MaxRetriesExceeded);
                assert!(explanation.contains("bad json again"));
            }
            other => panic!("expected Halt, got {other:?}"),
        }
    }

    #[test]
    fn test_run_error_is_fatal() {
        let engine = RecoveryEngine::default();
        let action = engine.handle_run_error(&RunError::Routing("unknown target JANITOR".into()));
        assert!(matches!(
            action,
            RecoveryAction::Halt { reason: HaltReason::FatalError, .. }
        ));
    }
}
