//! Worker 节点：ENGINEER（抽取）与 SCIENTIST（分析）
//!
//! step 只读 ConversationState，返回一个 WorkerOutput；对状态的修改全部由状态机完成。
//! completion 失败不会向上抛错，而是作为 ErrorObservation 交给自愈循环。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::SchemaSummary;
use crate::core::{ConversationState, WorkerId};
use crate::llm::{complete_with_timeout, LlmClient};
use crate::memory::{Message, PatternRetriever};
use crate::react::output::{parse_worker_output, WorkerOutput};
use crate::react::prompts::{patterns_section, ENGINEER_PROMPT, SCIENTIST_PROMPT};
use crate::tools::{
    ToolRegistry, COMPUTE_ANOMALIES, COMPUTE_FORECAST, EXECUTE_STATEMENT, RENDER_CHART_SPEC,
};

#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> WorkerId;

    /// 该 Worker 可调用的工具
    fn allowed_tools(&self) -> &[&'static str];

    /// 委派前是否需要 Safe Mode 审批
    fn cost_bearing(&self) -> bool {
        true
    }

    async fn step(&self, state: &ConversationState) -> WorkerOutput;
}

/// 由 completion 服务驱动的 Worker
pub struct LlmWorker {
    id: WorkerId,
    llm: Arc<dyn LlmClient>,
    prompt_template: String,
    tools: Vec<&'static str>,
    tool_schema: String,
    schema_summary: String,
    retriever: Option<Arc<dyn PatternRetriever>>,
    top_k: usize,
    timeout: Duration,
    cost_bearing: bool,
}

impl LlmWorker {
    fn new(
        id: WorkerId,
        llm: Arc<dyn LlmClient>,
        prompt_template: &str,
        tools: Vec<&'static str>,
        registry: &ToolRegistry,
        schema: &SchemaSummary,
    ) -> Self {
        Self {
            id,
            llm,
            prompt_template: prompt_template.to_string(),
            tool_schema: registry.to_schema_json(&tools),
            tools,
            schema_summary: schema.to_string(),
            retriever: None,
            top_k: 2,
            timeout: Duration::from_secs(60),
            cost_bearing: true,
        }
    }

    pub fn engineer(llm: Arc<dyn LlmClient>, registry: &ToolRegistry, schema: &SchemaSummary) -> Self {
        Self::new(
            WorkerId::Engineer,
            llm,
            ENGINEER_PROMPT,
            vec![EXECUTE_STATEMENT],
            registry,
            schema,
        )
    }

    pub fn scientist(llm: Arc<dyn LlmClient>, registry: &ToolRegistry, schema: &SchemaSummary) -> Self {
        Self::new(
            WorkerId::Scientist,
            llm,
            SCIENTIST_PROMPT,
            vec![COMPUTE_ANOMALIES, COMPUTE_FORECAST, RENDER_CHART_SPEC],
            registry,
            schema,
        )
    }

    /// 在写语句前检索已验证的查询模式
    pub fn with_retriever(mut self, retriever: Arc<dyn PatternRetriever>, top_k: usize) -> Self {
        self.retriever = Some(retriever);
        self.top_k = top_k;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    pub fn with_cost_bearing(mut self, cost_bearing: bool) -> Self {
        self.cost_bearing = cost_bearing;
        self
    }

    /// 检索失败或超时都退化为无模式
    async fn retrieved_patterns(&self, state: &ConversationState) -> Vec<String> {
        let Some(retriever) = &self.retriever else {
            return Vec::new();
        };
        let search = retriever.search(state.latest_user_text(), self.top_k);
        match tokio::time::timeout(self.timeout, search).await {
            Ok(Ok(hits)) => hits.into_iter().map(|h| h.pattern).collect(),
            Ok(Err(e)) => {
                tracing::warn!(run_id = %state.run_id, error = %e, "pattern retrieval unavailable");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(
                    run_id = %state.run_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "pattern retrieval timed out"
                );
                Vec::new()
            }
        }
    }

    async fn system_prompt(&self, state: &ConversationState) -> String {
        let patterns = self.retrieved_patterns(state).await;
        self.prompt_template
            .replace("{schema}", &self.schema_summary)
            .replace("{tools}", &self.tool_schema)
            .replace("{patterns}", &patterns_section(&patterns))
    }
}

#[async_trait]
impl Worker for LlmWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn allowed_tools(&self) -> &[&'static str] {
        &self.tools
    }

    fn cost_bearing(&self) -> bool {
        self.cost_bearing
    }

    async fn step(&self, state: &ConversationState) -> WorkerOutput {
        let mut messages = Vec::with_capacity(state.history().len() + 1);
        messages.push(Message::system(self.system_prompt(state).await));
        messages.extend_from_slice(state.history());

        match complete_with_timeout(self.llm.as_ref(), &messages, self.timeout).await {
            Ok(text) => {
                let out = parse_worker_output(&text);
                tracing::debug!(run_id = %state.run_id, worker = %self.id, output = ?out, "worker step");
                out
            }
            Err(e) => WorkerOutput::error(format!("completion failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, ScriptedLlmClient};
    use crate::memory::{KeywordPatternIndex, PatternMatch, RetrievalError};

    struct HangingRetriever;

    #[async_trait]
    impl PatternRetriever for HangingRetriever {
        async fn search(&self, _query: &str, _k: usize) -> Result<Vec<PatternMatch>, RetrievalError> {
            std::future::pending().await
        }
    }

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        r.register(crate::tools::ChartTool);
        r
    }

    #[tokio::test]
    async fn test_engineer_prompt_includes_schema_and_patterns() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"tool": "execute_statement", "args": "SELECT 1"}"#,
        ]));
        let worker = LlmWorker::engineer(llm.clone(), &registry(), &SchemaSummary::default())
            .with_retriever(Arc::new(KeywordPatternIndex::with_golden_patterns()), 1);
        let state = ConversationState::new("r", "top products by revenue");
        let out = worker.step(&state).await;
        assert_eq!(out, WorkerOutput::tool_request("execute_statement", "SELECT 1"));

        let sent = llm.call(0).unwrap();
        assert!(sent[0].content.contains("Database is empty."));
        assert!(sent[0].content.contains("Top performers"));
        assert_eq!(sent[1].content, "top products by revenue");
    }

    #[tokio::test]
    async fn test_completion_failure_becomes_error_observation() {
        let llm = Arc::new(ScriptedLlmClient::default().then_error(LlmError::Timeout(60)));
        let worker = LlmWorker::scientist(llm, &registry(), &SchemaSummary::default());
        let out = worker.step(&ConversationState::new("r", "forecast")).await;
        assert!(matches!(out, WorkerOutput::ErrorObservation { .. }));
        assert_eq!(
            worker.allowed_tools(),
            &[COMPUTE_ANOMALIES, COMPUTE_FORECAST, RENDER_CHART_SPEC]
        );
    }

    #[tokio::test]
    async fn test_hanging_retriever_does_not_stall_step() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"tool": "execute_statement", "args": "SELECT 1"}"#,
        ]));
        let worker = LlmWorker::engineer(llm.clone(), &registry(), &SchemaSummary::default())
            .with_retriever(Arc::new(HangingRetriever), 3)
            .with_timeout(Duration::from_millis(50));
        let state = ConversationState::new("r", "top products by revenue");
        let out = tokio::time::timeout(Duration::from_secs(5), worker.step(&state))
            .await
            .unwrap();
        assert_eq!(out, WorkerOutput::tool_request("execute_statement", "SELECT 1"));
        assert!(!llm.call(0).unwrap()[0].content.contains("Verified query patterns"));
    }
}
