//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parse_arguments / run），由 ToolRegistry 按名注册与查找；
//! ToolSandbox 在调用时先解析参数，再执行，并统一输出审计日志。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::core::ToolError;
use crate::tools::args::parse_json_object;

/// 单次调用的上下文（由状态机按运行配置与当前观察构造）
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// 本次运行的结果量熔断阈值
    pub row_limit: usize,
    /// 最近一次成功抽取的结果行；分析工具未显式给出 data 时使用
    pub prior_records: Vec<Map<String, Value>>,
}

/// 工具 trait
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 解析与校验阶段：在任何后端调用之前完成，失败即 ArgumentError
    fn parse_arguments(&self, raw: &str) -> Result<Map<String, Value>, ToolError> {
        parse_json_object(raw)
    }

    /// 执行；args 为 parse_arguments 的输出
    async fn run(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>，名称有序以保证 prompt 稳定
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 指定工具子集的 schema JSON，注入对应 Worker 的 prompt
    pub fn to_schema_json(&self, names: &[&str]) -> String {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .filter(|(name, _)| names.contains(&name.as_str()))
            .map(|(name, tool)| {
                serde_json::json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant;

    #[async_trait]
    impl Tool for Constant {
        fn name(&self) -> &str {
            "constant"
        }

        fn description(&self) -> &str {
            "Returns 42"
        }

        async fn run(&self, _args: &Map<String, Value>, _ctx: &ToolContext) -> Result<Value, ToolError> {
            Ok(Value::from(42))
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Constant);
        assert_eq!(registry.tool_names(), vec!["constant"]);
        let tool = registry.get("constant").unwrap();
        let args = tool.parse_arguments("{}").unwrap();
        assert_eq!(tool.run(&args, &ToolContext::default()).await.unwrap(), 42);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_schema_json_filters_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Constant);
        assert!(registry.to_schema_json(&["constant"]).contains("Returns 42"));
        assert_eq!(registry.to_schema_json(&["other"]), "[]");
    }
}
