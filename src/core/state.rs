//! 状态定义：单次运行的 ConversationState
//!
//! 状态机独占持有；Router 与 Worker 只拿到只读引用并返回增量（决策、输出），
//! 所有修改都经由这里的方法完成，保证 history / observations 只追加、retry_count 的计数规则统一。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::ToolError;
use crate::memory::Message;

pub type RunId = String;

/// Worker 标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerId {
    /// 数据抽取（执行语句）
    Engineer,
    /// 分析（异常、预测、图表）
    Scientist,
}

impl WorkerId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Engineer => "ENGINEER",
            Self::Scientist => "SCIENTIST",
        }
    }

    /// 解析 Router 输出中的目标名（大小写不敏感）；无法识别时返回 None
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ENGINEER" | "EXTRACTION" => Some(Self::Engineer),
            "SCIENTIST" | "ANALYTICS" => Some(Self::Scientist),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 用户请求的意图分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    ExtractionNeeded,
    AnalyticsNeeded,
    DirectlyAnswerable,
    Halt,
}

/// 路由目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "worker", rename_all = "snake_case")]
pub enum RouteTarget {
    Worker(WorkerId),
    Halt,
    AwaitHumanApproval,
}

/// Router 每一步的决策；只进入 transcript，不持久化到状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub target: RouteTarget,
    /// 审计用，不参与控制
    pub rationale: String,
    /// 本次新分类出的意图（增量，由状态机写回）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    /// 可直接回答时附带的回复
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    /// AwaitHumanApproval 时被挂起的原始委派决策，批准后原样重放
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred: Option<Box<RoutingDecision>>,
}

impl RoutingDecision {
    pub fn new(target: RouteTarget, rationale: impl Into<String>) -> Self {
        Self {
            target,
            rationale: rationale.into(),
            intent: None,
            reply: None,
            deferred: None,
        }
    }

    pub fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// 委派的目标 Worker（仅 target 为 Worker 时）
    pub fn worker(&self) -> Option<WorkerId> {
        match self.target {
            RouteTarget::Worker(w) => Some(w),
            _ => None,
        }
    }
}

/// 运行终止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HaltReason {
    Answered,
    HumanRejected,
    MaxRetriesExceeded,
    FatalError,
    Cancelled,
    StepBudgetExhausted,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Answered => "answered",
            Self::HumanRejected => "human-rejected",
            Self::MaxRetriesExceeded => "max-retries-exceeded",
            Self::FatalError => "fatal-error",
            Self::Cancelled => "cancelled",
            Self::StepBudgetExhausted => "step-budget-exhausted",
        };
        f.write_str(s)
    }
}

/// 运行阶段：running -> awaiting-approval -> {running, halted}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "kebab-case")]
pub enum RunPhase {
    Running,
    /// 挂起，等待外部审批；批准后重放 decision
    AwaitingApproval { decision: RoutingDecision },
    Halted { reason: HaltReason },
}

/// 已记录、尚未返回结果的工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingToolCall {
    pub tool_name: String,
    pub raw_arguments: String,
    pub worker: WorkerId,
    pub attempt_number: u32,
}

/// 一次工具调用的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { payload: Value },
    Failure { error: ToolError },
}

/// 一次工具调用尝试；写入 observations 后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub worker: WorkerId,
    pub tool_name: String,
    pub raw_arguments: String,
    /// 参数名 -> 解析后的值（参数无法解析时为空）
    pub arguments: Map<String, Value>,
    pub attempt_number: u32,
    pub outcome: ToolOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    pub recorded_at: DateTime<Utc>,
}

impl ToolInvocationRecord {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    pub fn error(&self) -> Option<&ToolError> {
        match &self.outcome {
            ToolOutcome::Failure { error } => Some(error),
            ToolOutcome::Success { .. } => None,
        }
    }
}

/// Worker 给出的最终回答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAnswer {
    pub worker: WorkerId,
    pub text: String,
}

/// 单次运行的会话状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub run_id: RunId,
    pub user_request: String,
    history: Vec<Message>,
    active_worker: Option<WorkerId>,
    pending_tool_call: Option<PendingToolCall>,
    observations: Vec<ToolInvocationRecord>,
    retry_count: u32,
    phase: RunPhase,
    intent: Option<Intent>,
    answers: Vec<WorkerAnswer>,
    /// 当前 Worker 自接手以来是否已给出 FinalAnswer
    worker_done: bool,
    final_answer: Option<String>,
    last_error: Option<String>,
    step_count: usize,
}

impl ConversationState {
    pub fn new(run_id: impl Into<RunId>, user_request: impl Into<String>) -> Self {
        let user_request = user_request.into();
        Self {
            run_id: run_id.into(),
            history: vec![Message::user(user_request.clone())],
            user_request,
            active_worker: None,
            pending_tool_call: None,
            observations: Vec::new(),
            retry_count: 0,
            phase: RunPhase::Running,
            intent: None,
            answers: Vec::new(),
            worker_done: false,
            final_answer: None,
            last_error: None,
            step_count: 0,
        }
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn observations(&self) -> &[ToolInvocationRecord] {
        &self.observations
    }

    pub fn active_worker(&self) -> Option<WorkerId> {
        self.active_worker
    }

    pub fn pending_tool_call(&self) -> Option<&PendingToolCall> {
        self.pending_tool_call.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn phase(&self) -> &RunPhase {
        &self.phase
    }

    pub fn intent(&self) -> Option<Intent> {
        self.intent
    }

    pub fn answers(&self) -> &[WorkerAnswer] {
        &self.answers
    }

    pub fn worker_done(&self) -> bool {
        self.worker_done
    }

    pub fn final_answer(&self) -> Option<&str> {
        self.final_answer.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        match &self.phase {
            RunPhase::Halted { reason } => Some(*reason),
            _ => None,
        }
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.phase, RunPhase::Halted { .. })
    }

    /// 是否已有成功的数据观察（分析 Worker 的前置条件）
    pub fn has_data_observations(&self) -> bool {
        self.observations.iter().any(|o| o.is_success())
    }

    /// 指定 Worker 是否已给出回答
    pub fn has_answer_from(&self, worker: WorkerId) -> bool {
        self.answers.iter().any(|a| a.worker == worker)
    }

    /// 最近一条用户消息
    pub fn latest_user_text(&self) -> &str {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == crate::memory::Role::User && m.name.is_none())
            .map(|m| m.content.as_str())
            .unwrap_or(&self.user_request)
    }

    pub(crate) fn begin_step(&mut self) -> usize {
        self.step_count += 1;
        self.step_count
    }

    pub(crate) fn set_intent(&mut self, intent: Intent) {
        self.intent = Some(intent);
    }

    /// 控制权交给 worker；换人时重置 retry_count
    pub(crate) fn delegate_to(&mut self, worker: WorkerId) {
        if self.active_worker != Some(worker) {
            self.retry_count = 0;
            self.worker_done = false;
            self.pending_tool_call = None;
        }
        self.active_worker = Some(worker);
    }

    pub(crate) fn suspend_for_approval(&mut self, decision: RoutingDecision) {
        self.phase = RunPhase::AwaitingApproval { decision };
    }

    /// 结束挂起，返回待重放的决策
    pub(crate) fn resume(&mut self) -> Option<RoutingDecision> {
        match std::mem::replace(&mut self.phase, RunPhase::Running) {
            RunPhase::AwaitingApproval { decision } => Some(decision),
            other => {
                self.phase = other;
                None
            }
        }
    }

    /// 在调用前记录工具请求，返回本次尝试序号
    pub(crate) fn record_tool_request(
        &mut self,
        worker: WorkerId,
        tool_name: &str,
        raw_arguments: &str,
    ) -> u32 {
        let attempt_number = self.retry_count + 1;
        self.history.push(Message::assistant_named(
            worker.as_str(),
            format!("Calling `{tool_name}` with: {raw_arguments}"),
        ));
        self.pending_tool_call = Some(PendingToolCall {
            tool_name: tool_name.to_string(),
            raw_arguments: raw_arguments.to_string(),
            worker,
            attempt_number,
        });
        attempt_number
    }

    /// 调用后记录结果：成功重置计数，失败恰好加一
    pub(crate) fn record_tool_result(&mut self, record: ToolInvocationRecord, feedback: String) {
        match &record.outcome {
            ToolOutcome::Success { .. } => {
                self.retry_count = 0;
            }
            ToolOutcome::Failure { error } => {
                self.retry_count += 1;
                self.last_error = Some(error.to_string());
            }
        }
        self.history.push(Message::tool(record.tool_name.clone(), feedback));
        self.observations.push(record);
        self.pending_tool_call = None;
    }

    /// Worker 输出无法使用（如 completion 失败）：按一次失败尝试计数
    pub(crate) fn record_worker_error(&mut self, worker: WorkerId, detail: &str, feedback: String) {
        self.retry_count += 1;
        self.last_error = Some(detail.to_string());
        self.history.push(Message::user_named(worker.as_str(), feedback));
    }

    pub(crate) fn record_worker_answer(&mut self, worker: WorkerId, text: &str) {
        self.history
            .push(Message::assistant_named(worker.as_str(), text.to_string()));
        self.answers.push(WorkerAnswer {
            worker,
            text: text.to_string(),
        });
        self.worker_done = true;
        self.retry_count = 0;
        self.final_answer = Some(text.to_string());
    }

    /// 不可重试的错误（如路由失败）
    pub(crate) fn record_fatal_error(&mut self, detail: impl Into<String>) {
        self.last_error = Some(detail.into());
    }

    /// 终止运行：清除 active_worker 与挂起的工具调用，写入用户可见的最终文本
    pub(crate) fn halt(&mut self, reason: HaltReason, final_text: impl Into<String>) {
        self.phase = RunPhase::Halted { reason };
        self.active_worker = None;
        self.pending_tool_call = None;
        self.final_answer = Some(final_text.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BackendError, BackendErrorKind};

    fn record(worker: WorkerId, outcome: ToolOutcome, attempt: u32) -> ToolInvocationRecord {
        ToolInvocationRecord {
            worker,
            tool_name: "execute_statement".to_string(),
            raw_arguments: "SELECT 1".to_string(),
            arguments: Map::new(),
            attempt_number: attempt,
            outcome,
            row_count: None,
            recorded_at: Utc::now(),
        }
    }

    fn failure() -> ToolOutcome {
        ToolOutcome::Failure {
            error: ToolError::Backend(BackendError::new(
                BackendErrorKind::CatalogError,
                "no such column: amout",
            )),
        }
    }

    #[test]
    fn test_retry_count_increments_once_per_failure_and_resets_on_success() {
        let mut state = ConversationState::new("run-1", "total revenue");
        state.delegate_to(WorkerId::Engineer);

        let attempt = state.record_tool_request(WorkerId::Engineer, "execute_statement", "SELECT amout");
        assert_eq!(attempt, 1);
        assert!(state.pending_tool_call().is_some());
        state.record_tool_result(record(WorkerId::Engineer, failure(), attempt), "err".into());
        assert_eq!(state.retry_count(), 1);
        assert!(state.pending_tool_call().is_none());

        let attempt = state.record_tool_request(WorkerId::Engineer, "execute_statement", "SELECT amount");
        assert_eq!(attempt, 2);
        state.record_tool_result(
            record(
                WorkerId::Engineer,
                ToolOutcome::Success { payload: Value::Null },
                attempt,
            ),
            "ok".into(),
        );
        assert_eq!(state.retry_count(), 0);
        assert_eq!(state.observations().len(), 2);
        assert!(state.has_data_observations());
    }

    #[test]
    fn test_handoff_resets_retry_count() {
        let mut state = ConversationState::new("run-1", "q");
        state.delegate_to(WorkerId::Engineer);
        state.record_tool_result(record(WorkerId::Engineer, failure(), 1), "err".into());
        assert_eq!(state.retry_count(), 1);

        state.delegate_to(WorkerId::Engineer);
        assert_eq!(state.retry_count(), 1, "same worker keeps its chain");

        state.delegate_to(WorkerId::Scientist);
        assert_eq!(state.retry_count(), 0);
        assert_eq!(state.active_worker(), Some(WorkerId::Scientist));
    }

    #[test]
    fn test_halt_clears_active_worker() {
        let mut state = ConversationState::new("run-1", "q");
        state.delegate_to(WorkerId::Engineer);
        state.halt(HaltReason::Answered, "done");
        assert!(state.is_halted());
        assert_eq!(state.active_worker(), None);
        assert_eq!(state.halt_reason(), Some(HaltReason::Answered));
        assert_eq!(state.final_answer(), Some("done"));
    }

    #[test]
    fn test_resume_only_from_awaiting_approval() {
        let mut state = ConversationState::new("run-1", "q");
        assert!(state.resume().is_none());
        assert_eq!(state.phase(), &RunPhase::Running);

        let decision = RoutingDecision::new(RouteTarget::Worker(WorkerId::Engineer), "needs data");
        state.suspend_for_approval(decision.clone());
        assert_eq!(state.resume(), Some(decision));
        assert_eq!(state.phase(), &RunPhase::Running);
    }

    #[test]
    fn test_worker_id_parse() {
        assert_eq!(WorkerId::parse("engineer"), Some(WorkerId::Engineer));
        assert_eq!(WorkerId::parse(" SCIENTIST "), Some(WorkerId::Scientist));
        assert_eq!(WorkerId::parse("janitor"), None);
    }
}
