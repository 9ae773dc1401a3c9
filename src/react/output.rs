//! Worker 输出解析
//!
//! 接受两种格式：
//! - JSON：`{"tool": "execute_statement", "args": "SELECT ..."}`（可包在 ```json 代码块里）
//! - ReAct 文本：`Action: <tool>` / `Action Input: <args>` / `Final Answer: <text>`
//!
//! 其它纯文本视为最终回答；看起来是 JSON 却无法解析时为 ErrorObservation。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Worker 单步的输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerOutput {
    FinalAnswer { text: String },
    ToolRequest { tool: String, raw_arguments: String },
    ErrorObservation { detail: String },
}

impl WorkerOutput {
    pub fn final_answer(text: impl Into<String>) -> Self {
        Self::FinalAnswer { text: text.into() }
    }

    pub fn tool_request(tool: impl Into<String>, raw_arguments: impl Into<String>) -> Self {
        Self::ToolRequest {
            tool: tool.into(),
            raw_arguments: raw_arguments.into(),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self::ErrorObservation {
            detail: detail.into(),
        }
    }
}

#[derive(Deserialize)]
struct ToolCallJson {
    #[serde(default)]
    tool: String,
    #[serde(default, alias = "arguments", alias = "input")]
    args: Value,
}

pub fn parse_worker_output(output: &str) -> WorkerOutput {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return WorkerOutput::error("empty completion");
    }

    if let Some(parsed) = parse_react_text(trimmed) {
        return parsed;
    }

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if trimmed.starts_with('{') {
        trimmed
    } else {
        return WorkerOutput::final_answer(trimmed);
    };

    let call: ToolCallJson = match serde_json::from_str(json_str) {
        Ok(c) => c,
        Err(e) => return WorkerOutput::error(format!("invalid tool call JSON ({e}): {json_str}")),
    };
    if call.tool.trim().is_empty() {
        return WorkerOutput::error(format!("tool call without a tool name: {json_str}"));
    }
    let raw_arguments = match call.args {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    };
    WorkerOutput::tool_request(call.tool.trim(), raw_arguments)
}

/// ReAct 文本格式；没有 Action / Final Answer 标记时返回 None
fn parse_react_text(text: &str) -> Option<WorkerOutput> {
    let action = text.find("Action:");
    let final_answer = text.find("Final Answer:");

    match (action, final_answer) {
        (Some(a), f) if f.map_or(true, |f| a < f) => {
            let after = &text[a + "Action:".len()..];
            let tool = after.lines().next().unwrap_or("").trim().trim_matches('`');
            if tool.is_empty() {
                return Some(WorkerOutput::error("`Action:` without a tool name"));
            }
            let raw = match after.find("Action Input:") {
                Some(i) => {
                    let input = &after[i + "Action Input:".len()..];
                    let end = input.find("\nObservation:").unwrap_or(input.len());
                    input[..end].trim()
                }
                None => "",
            };
            Some(WorkerOutput::tool_request(tool, raw))
        }
        (_, Some(f)) => {
            let answer = text[f + "Final Answer:".len()..].trim();
            if answer.is_empty() {
                Some(WorkerOutput::error("`Final Answer:` is empty"))
            } else {
                Some(WorkerOutput::final_answer(answer))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_tool_call_with_string_args() {
        let out = parse_worker_output(r#"{"tool": "execute_statement", "args": "SELECT 1"}"#);
        assert_eq!(out, WorkerOutput::tool_request("execute_statement", "SELECT 1"));
    }

    #[test]
    fn test_json_tool_call_with_object_args() {
        let out = parse_worker_output(
            "```json\n{\"tool\": \"compute_forecast\", \"args\": {\"periods\": 3}}\n```",
        );
        assert_eq!(
            out,
            WorkerOutput::tool_request("compute_forecast", r#"{"periods":3}"#)
        );
    }

    #[test]
    fn test_react_action_format() {
        let out = parse_worker_output(
            "Thought: need data\nAction: execute_statement\nAction Input: \"SELECT region FROM sales\"\n",
        );
        assert_eq!(
            out,
            WorkerOutput::tool_request("execute_statement", "\"SELECT region FROM sales\"")
        );
    }

    #[test]
    fn test_final_answer_marker_and_plain_text() {
        assert_eq!(
            parse_worker_output("Thought: done\nFinal Answer: Revenue was 42."),
            WorkerOutput::final_answer("Revenue was 42.")
        );
        assert_eq!(
            parse_worker_output("Revenue was 42."),
            WorkerOutput::final_answer("Revenue was 42.")
        );
    }

    #[test]
    fn test_malformed_outputs_are_error_observations() {
        assert!(matches!(
            parse_worker_output("{\"tool\": \"execute_statement\", "),
            WorkerOutput::ErrorObservation { .. }
        ));
        assert!(matches!(parse_worker_output("   "), WorkerOutput::ErrorObservation { .. }));
        assert!(matches!(
            parse_worker_output("{\"args\": \"SELECT 1\"}"),
            WorkerOutput::ErrorObservation { .. }
        ));
    }
}
