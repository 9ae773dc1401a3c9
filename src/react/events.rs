//! 运行过程事件与 transcript：每个状态机步骤追加一条 StepRecord，可序列化为 JSON 供调用方展示

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::core::{
    ConversationState, HaltReason, RoutingDecision, RunId, RunPhase, ToolInvocationRecord,
    WorkerId,
};
use crate::react::auditor::AuditVerdict;

/// 单步过程事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEvent {
    /// Router 的决策（含理由）
    Routing { decision: RoutingDecision },
    /// Safe Mode：等待外部审批
    ApprovalRequested { worker: Option<WorkerId> },
    ApprovalGranted { worker: Option<WorkerId> },
    ApprovalRejected { worker: Option<WorkerId> },
    /// 工具请求已记录、尚未执行
    ToolRequested {
        worker: WorkerId,
        tool: String,
        raw_arguments: String,
        attempt: u32,
    },
    /// 工具调用结果
    ToolResult { record: ToolInvocationRecord },
    WorkerAnswer { worker: WorkerId, text: String },
    /// Worker 输出不可用（completion 失败、格式错误）
    WorkerError {
        worker: WorkerId,
        detail: String,
        retry_count: u32,
    },
    Halt {
        reason: HaltReason,
        final_answer: Option<String>,
        last_error: Option<String>,
    },
    /// 影子审计结论（仅提示）
    Audit { verdict: AuditVerdict },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    pub at: DateTime<Utc>,
    pub event: StepEvent,
}

/// get_transcript 返回的运行快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTranscript {
    pub run_id: RunId,
    pub user_request: String,
    pub config: RunConfig,
    pub phase: RunPhase,
    pub halt_reason: Option<HaltReason>,
    pub final_answer: Option<String>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub steps: Vec<StepRecord>,
    pub observations: Vec<ToolInvocationRecord>,
    pub audit: Option<AuditVerdict>,
}

impl RunTranscript {
    pub fn new(
        state: &ConversationState,
        config: RunConfig,
        steps: &[StepRecord],
        audit: Option<&AuditVerdict>,
    ) -> Self {
        Self {
            run_id: state.run_id.clone(),
            user_request: state.user_request.clone(),
            config,
            phase: state.phase().clone(),
            halt_reason: state.halt_reason(),
            final_answer: state.final_answer().map(str::to_string),
            last_error: state.last_error().map(str::to_string),
            retry_count: state.retry_count(),
            steps: steps.to_vec(),
            observations: state.observations().to_vec(),
            audit: audit.cloned(),
        }
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.phase, RunPhase::Halted { .. })
    }

    pub fn is_awaiting_approval(&self) -> bool {
        matches!(self.phase, RunPhase::AwaitingApproval { .. })
    }

    /// 所有工具调用尝试次数
    pub fn attempts(&self, tool: &str) -> usize {
        self.observations.iter().filter(|o| o.tool_name == tool).count()
    }

    /// 指定类型事件的数量（按 serde tag 计）
    pub fn count_events(&self, kind: &str) -> usize {
        self.steps
            .iter()
            .filter(|s| {
                serde_json::to_value(&s.event)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == kind))
                    .unwrap_or(false)
            })
            .count()
    }
}
