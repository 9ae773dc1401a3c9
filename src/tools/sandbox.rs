//! Tool Sandbox
//!
//! invoke(tool_name, raw_argument_text)：查找工具 -> 解析/校验参数 -> 执行。
//! 参数错误在任何后端调用之前返回；每次调用输出一行结构化审计日志（JSON）。

use std::time::Instant;

use serde_json::{Map, Value};

use crate::core::ToolError;
use crate::tools::{ToolContext, ToolRegistry};

/// 一次调用的结果：解析后的参数（失败时为空）+ 成功载荷或结构化错误
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub arguments: Map<String, Value>,
    pub outcome: Result<Value, ToolError>,
}

impl ToolResult {
    /// 载荷中的行数（execute_statement 才有）
    pub fn row_count(&self) -> Option<usize> {
        self.outcome
            .as_ref()
            .ok()
            .and_then(|v| v.get("row_count"))
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
    }
}

pub struct ToolSandbox {
    registry: ToolRegistry,
}

impl ToolSandbox {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn invoke(&self, tool_name: &str, raw_arguments: &str, ctx: &ToolContext) -> ToolResult {
        let start = Instant::now();
        let result = match self.registry.get(tool_name) {
            None => ToolResult {
                arguments: Map::new(),
                outcome: Err(ToolError::UnknownTool {
                    name: tool_name.to_string(),
                }),
            },
            Some(tool) => match tool.parse_arguments(raw_arguments) {
                Err(e) => ToolResult {
                    arguments: Map::new(),
                    outcome: Err(e),
                },
                Ok(arguments) => {
                    let outcome = tool.run(&arguments, ctx).await;
                    ToolResult { arguments, outcome }
                }
            },
        };

        let outcome = match &result.outcome {
            Ok(_) => "ok",
            Err(ToolError::Argument { .. }) => "argument_error",
            Err(ToolError::UnknownTool { .. }) => "unknown_tool",
            Err(ToolError::Backend(e)) if e.timed_out => "timeout",
            Err(ToolError::Backend(_)) => "backend_error",
            Err(ToolError::Computation { .. }) => "computation_error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": result.outcome.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "row_count": result.row_count(),
            "args_preview": args_preview(raw_arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }
}

fn args_preview(raw: &str) -> String {
    if raw.chars().count() > 200 {
        format!("{}...", raw.chars().take(200).collect::<String>())
    } else {
        raw.to_string()
    }
}
