//! Router / Supervisor
//!
//! decide(state) 无副作用：返回本步的 RoutingDecision，新分类出的意图作为增量放在决策里，
//! 由状态机写回。顺序：
//! 1. 当前 Worker 尚未给出回答：继续交给它（工具循环、自愈重试）
//! 2. 否则按意图（已缓存或本次分类）选择下一个 Worker 或终止
//! 3. Safe Mode 下，控制权切换到有成本的 Worker 改为等待审批
//!
//! 分析 Worker 的硬性前提：至少有一条成功的数据观察，否则先交给抽取 Worker。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;

use crate::core::gate;
use crate::core::{ConversationState, Intent, RouteTarget, RoutingDecision, RunError, WorkerId};
use crate::llm::{complete_structured_with_timeout, LlmClient};
use crate::memory::Message;
use crate::react::prompts::ROUTER_PROMPT;

/// Router 的结构化输出
#[derive(Debug, Deserialize, JsonSchema)]
struct RouterReply {
    /// ENGINEER | SCIENTIST | FINISH
    next: String,
    /// 一句话理由
    #[serde(default)]
    reason: String,
    /// FINISH 时直接给用户的回复
    #[serde(default)]
    reply: Option<String>,
}

const ANALYTICS_KEYWORDS: &[&str] = &[
    "forecast", "predict", "projection", "project ", "trend", "anomal", "outlier", "spike",
    "unusual", "chart", "plot", "graph", "visuali",
];

const SMALL_TALK: &[&str] = &[
    "hi", "hello", "hey", "thanks", "thank you", "bye", "goodbye", "ok", "okay",
];

pub struct Router {
    llm: Option<Arc<dyn LlmClient>>,
    timeout: Duration,
    cost_bearing: HashSet<WorkerId>,
}

impl Router {
    /// llm 为 None 时只用关键词分类
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            llm,
            timeout: Duration::from_secs(30),
            cost_bearing: [WorkerId::Engineer, WorkerId::Scientist].into_iter().collect(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 设置需要 Safe Mode 审批的 Worker
    pub fn with_cost_bearing(mut self, workers: impl IntoIterator<Item = WorkerId>) -> Self {
        self.cost_bearing = workers.into_iter().collect();
        self
    }

    pub(crate) fn set_cost_bearing(&mut self, worker: WorkerId, cost_bearing: bool) {
        if cost_bearing {
            self.cost_bearing.insert(worker);
        } else {
            self.cost_bearing.remove(&worker);
        }
    }

    pub async fn decide(
        &self,
        state: &ConversationState,
        safe_mode: bool,
    ) -> Result<RoutingDecision, RunError> {
        let decision = self.route(state).await?;
        Ok(gate::screen(decision, state, safe_mode, |w| {
            self.cost_bearing.contains(&w)
        }))
    }

    async fn route(&self, state: &ConversationState) -> Result<RoutingDecision, RunError> {
        if let Some(worker) = state.active_worker() {
            if !state.worker_done() {
                return Ok(RoutingDecision::new(
                    RouteTarget::Worker(worker),
                    format!("{worker} is mid-task"),
                ));
            }
        }

        let (intent, fresh, reply, reason) = match state.intent() {
            Some(intent) => (intent, false, None, String::new()),
            None => {
                let (intent, reply, reason) = self.classify(state).await?;
                (intent, true, reply, reason)
            }
        };

        let mut decision = next_step(state, intent, reply, reason);
        if fresh {
            decision.intent = Some(intent);
        }
        Ok(decision)
    }

    /// 用 completion 服务分类；服务不可用时退回关键词分类；输出非法目标为 RoutingError
    async fn classify(
        &self,
        state: &ConversationState,
    ) -> Result<(Intent, Option<String>, String), RunError> {
        let text = state.latest_user_text();
        let Some(llm) = &self.llm else {
            return Ok((keyword_intent(text), None, "keyword classification".to_string()));
        };

        let schema = serde_json::to_value(schema_for!(RouterReply)).unwrap_or_default();
        let messages = [Message::system(ROUTER_PROMPT), Message::user(text)];
        let value = match complete_structured_with_timeout(llm.as_ref(), &messages, &schema, self.timeout).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(run_id = %state.run_id, error = %e, "router completion failed; using keywords");
                return Ok((keyword_intent(text), None, format!("keyword fallback ({e})")));
            }
        };
        let reply: RouterReply = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(run_id = %state.run_id, error = %e, "router reply malformed; using keywords");
                return Ok((keyword_intent(text), None, format!("keyword fallback ({e})")));
            }
        };

        let intent = match reply.next.trim().to_ascii_uppercase().as_str() {
            "ENGINEER" | "EXTRACTION" => Intent::ExtractionNeeded,
            "SCIENTIST" | "ANALYTICS" => Intent::AnalyticsNeeded,
            "FINISH" | "DIRECT" | "ANSWER" if reply.reply.is_some() => Intent::DirectlyAnswerable,
            "FINISH" | "HALT" | "DIRECT" | "ANSWER" => Intent::Halt,
            other => {
                return Err(RunError::Routing(format!(
                    "router produced unrecognized target `{other}`"
                )))
            }
        };
        Ok((intent, reply.reply, reply.reason))
    }
}

fn next_step(
    state: &ConversationState,
    intent: Intent,
    reply: Option<String>,
    reason: String,
) -> RoutingDecision {
    let halt_answered = |why: &str| {
        RoutingDecision::new(RouteTarget::Halt, why).with_reply(
            state
                .final_answer()
                .unwrap_or("No answer was produced.")
                .to_string(),
        )
    };

    match intent {
        Intent::ExtractionNeeded => {
            if state.has_answer_from(WorkerId::Engineer) {
                halt_answered("extraction answered")
            } else {
                RoutingDecision::new(RouteTarget::Worker(WorkerId::Engineer), reason_or(reason, "data extraction needed"))
            }
        }
        Intent::AnalyticsNeeded => {
            if state.has_answer_from(WorkerId::Scientist) {
                halt_answered("analysis answered")
            } else if state.has_data_observations() {
                RoutingDecision::new(RouteTarget::Worker(WorkerId::Scientist), reason_or(reason, "analysis over extracted data"))
            } else if state.has_answer_from(WorkerId::Engineer) {
                halt_answered("no data could be extracted for analysis")
            } else {
                RoutingDecision::new(
                    RouteTarget::Worker(WorkerId::Engineer),
                    "analysis needs data: extraction first",
                )
            }
        }
        Intent::DirectlyAnswerable => RoutingDecision::new(RouteTarget::Halt, reason_or(reason, "directly answerable"))
            .with_reply(reply.unwrap_or_else(|| {
                "I can help with questions about the data in the store.".to_string()
            })),
        Intent::Halt => RoutingDecision::new(RouteTarget::Halt, reason_or(reason, "nothing to do"))
            .with_reply(reply.unwrap_or_else(|| "Goodbye.".to_string())),
    }
}

fn reason_or(reason: String, default: &str) -> String {
    if reason.trim().is_empty() {
        default.to_string()
    } else {
        reason
    }
}

/// 关键词分类：分析词优先；短的寒暄为 Halt；其余（含歧义）先抽取
pub fn keyword_intent(text: &str) -> Intent {
    let lower = text.trim().to_lowercase();
    if ANALYTICS_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Intent::AnalyticsNeeded;
    }
    let bare = lower.trim_end_matches(['!', '.', '?']).trim();
    if SMALL_TALK.contains(&bare) {
        return Intent::Halt;
    }
    Intent::ExtractionNeeded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ToolInvocationRecord, ToolOutcome};
    use crate::llm::{LlmError, ScriptedLlmClient};
    use chrono::Utc;
    use serde_json::{Map, Value};

    fn success_record() -> ToolInvocationRecord {
        ToolInvocationRecord {
            worker: WorkerId::Engineer,
            tool_name: "execute_statement".into(),
            raw_arguments: "SELECT 1".into(),
            arguments: Map::new(),
            attempt_number: 1,
            outcome: ToolOutcome::Success { payload: Value::Null },
            row_count: Some(1),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_keyword_intent() {
        assert_eq!(keyword_intent("forecast revenue"), Intent::AnalyticsNeeded);
        assert_eq!(keyword_intent("Thanks!"), Intent::Halt);
        assert_eq!(keyword_intent("total revenue by region"), Intent::ExtractionNeeded);
        assert_eq!(keyword_intent("hmm"), Intent::ExtractionNeeded);
    }

    #[tokio::test]
    async fn test_forecast_without_data_routes_to_extraction() {
        let router = Router::new(None);
        let state = ConversationState::new("r", "forecast revenue");
        let d = router.decide(&state, false).await.unwrap();
        assert_eq!(d.target, RouteTarget::Worker(WorkerId::Engineer));
        assert_eq!(d.intent, Some(Intent::AnalyticsNeeded));
    }

    #[tokio::test]
    async fn test_analytics_after_extraction_goes_to_scientist() {
        let router = Router::new(None);
        let mut state = ConversationState::new("r", "forecast revenue");
        state.set_intent(Intent::AnalyticsNeeded);
        state.delegate_to(WorkerId::Engineer);
        state.record_tool_request(WorkerId::Engineer, "execute_statement", "SELECT 1");
        state.record_tool_result(success_record(), "{}".into());

        let d = router.decide(&state, false).await.unwrap();
        assert_eq!(d.target, RouteTarget::Worker(WorkerId::Engineer), "engineer still mid-task");

        state.record_worker_answer(WorkerId::Engineer, "fetched");
        let d = router.decide(&state, false).await.unwrap();
        assert_eq!(d.target, RouteTarget::Worker(WorkerId::Scientist));
        assert_eq!(d.intent, None, "cached intent is not re-emitted");

        state.delegate_to(WorkerId::Scientist);
        state.record_worker_answer(WorkerId::Scientist, "trend is up");
        let d = router.decide(&state, false).await.unwrap();
        assert_eq!(d.target, RouteTarget::Halt);
        assert_eq!(d.reply.as_deref(), Some("trend is up"));
    }

    #[tokio::test]
    async fn test_llm_finish_with_reply_is_direct_answer() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"next": "FINISH", "reason": "greeting", "reply": "Hello! Ask me about your data."}"#,
        ]));
        let router = Router::new(Some(llm));
        let d = router.decide(&ConversationState::new("r", "hi"), false).await.unwrap();
        assert_eq!(d.target, RouteTarget::Halt);
        assert_eq!(d.intent, Some(Intent::DirectlyAnswerable));
        assert_eq!(d.reply.as_deref(), Some("Hello! Ask me about your data."));
    }

    #[tokio::test]
    async fn test_unrecognized_target_is_routing_error() {
        let llm = Arc::new(ScriptedLlmClient::new([r#"{"next": "JANITOR", "reason": "?"}"#]));
        let router = Router::new(Some(llm));
        let err = router
            .decide(&ConversationState::new("r", "clean up"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Routing(_)));
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_to_keywords() {
        let llm = Arc::new(ScriptedLlmClient::default().then_error(LlmError::ApiError("503".into())));
        let router = Router::new(Some(llm));
        let d = router
            .decide(&ConversationState::new("r", "chart sales"), false)
            .await
            .unwrap();
        assert_eq!(d.intent, Some(Intent::AnalyticsNeeded));
        assert_eq!(d.target, RouteTarget::Worker(WorkerId::Engineer));
    }

    #[tokio::test]
    async fn test_safe_mode_wraps_delegation() {
        let router = Router::new(None);
        let d = router
            .decide(&ConversationState::new("r", "total revenue"), true)
            .await
            .unwrap();
        assert_eq!(d.target, RouteTarget::AwaitHumanApproval);
        assert_eq!(d.intent, Some(Intent::ExtractionNeeded));
        assert_eq!(
            d.deferred.as_ref().map(|x| x.target),
            Some(RouteTarget::Worker(WorkerId::Engineer))
        );
    }
}
