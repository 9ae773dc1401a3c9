//! 编排状态机
//!
//! 每一步：Router 决策 -> 执行（委派 Worker / 挂起等待审批 / 终止）-> 更新状态 -> 再次决策。
//! 状态只在这里被修改；每个挂起点（Router、Worker、工具调用）都观察取消信号。
//! 终止后（取消除外）运行一次 Shadow Auditor，结论只进入 transcript。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::core::gate::{self, GateResolution};
use crate::core::{
    ConversationState, HaltReason, RecoveryAction, RecoveryEngine, RouteTarget, RoutingDecision,
    RunError, RunPhase, ToolError, ToolInvocationRecord, ToolOutcome, WorkerId,
};
use crate::react::{
    AuditVerdict, Router, RunTranscript, ShadowAuditor, StepEvent, StepRecord, Worker,
    WorkerOutput,
};
use crate::tools::{ToolContext, ToolResult, ToolSandbox, EXECUTE_STATEMENT};

/// 单次运行的全部记录：状态 + 过程事件 + 审计结论
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub state: ConversationState,
    pub config: RunConfig,
    pub steps: Vec<StepRecord>,
    pub audit: Option<AuditVerdict>,
}

impl RunRecord {
    pub fn new(state: ConversationState, config: RunConfig) -> Self {
        Self {
            state,
            config,
            steps: Vec::new(),
            audit: None,
        }
    }

    pub fn transcript(&self) -> RunTranscript {
        RunTranscript::new(&self.state, self.config, &self.steps, self.audit.as_ref())
    }

    fn push(&mut self, event: StepEvent) {
        self.steps.push(StepRecord {
            step: self.state.step_count(),
            at: Utc::now(),
            event,
        });
    }

    fn halt(&mut self, reason: HaltReason, final_text: impl Into<String>) {
        self.state.halt(reason, final_text);
        tracing::info!(run_id = %self.state.run_id, reason = %reason, "run halted");
        self.push(StepEvent::Halt {
            reason,
            final_answer: self.state.final_answer().map(str::to_string),
            last_error: self.state.last_error().map(str::to_string),
        });
    }
}

/// 一步执行后的去向
enum Flow {
    Continue,
    Suspended,
}

const CANCELLED_TEXT: &str = "The run was cancelled before it completed.";

pub struct Orchestrator {
    router: Router,
    workers: HashMap<WorkerId, Arc<dyn Worker>>,
    sandbox: Arc<ToolSandbox>,
    auditor: Option<Arc<ShadowAuditor>>,
}

impl Orchestrator {
    pub fn new(router: Router, sandbox: Arc<ToolSandbox>) -> Self {
        Self {
            router,
            workers: HashMap::new(),
            sandbox,
            auditor: None,
        }
    }

    /// 注册 Worker；其 cost_bearing 决定 Safe Mode 下是否需要审批
    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.router.set_cost_bearing(worker.id(), worker.cost_bearing());
        self.workers.insert(worker.id(), worker);
        self
    }

    pub fn with_auditor(mut self, auditor: Arc<ShadowAuditor>) -> Self {
        self.auditor = Some(auditor);
        self
    }

    /// 推进运行，直到终止或挂起等待审批
    pub async fn drive(
        &self,
        record: &mut RunRecord,
        cancel: &CancellationToken,
        publish: &watch::Sender<RunTranscript>,
    ) {
        loop {
            if record.state.is_halted() {
                break;
            }
            if matches!(record.state.phase(), RunPhase::AwaitingApproval { .. }) {
                publish.send_replace(record.transcript());
                return;
            }
            if cancel.is_cancelled() {
                record.halt(HaltReason::Cancelled, CANCELLED_TEXT);
                break;
            }
            if record.state.step_count() >= record.config.max_steps {
                let text = format!(
                    "The run stopped after {} steps without reaching an answer.",
                    record.config.max_steps
                );
                record.halt(HaltReason::StepBudgetExhausted, text);
                break;
            }

            let step = record.state.begin_step();
            let decided = tokio::select! {
                _ = cancel.cancelled() => {
                    record.halt(HaltReason::Cancelled, CANCELLED_TEXT);
                    break;
                }
                d = self.router.decide(&record.state, record.config.safe_mode) => d,
            };

            let decision = match decided {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(run_id = %record.state.run_id, step, error = %e, "routing failed");
                    self.fatal(record, &e);
                    break;
                }
            };
            tracing::info!(
                run_id = %record.state.run_id,
                step,
                target = ?decision.target,
                rationale = %decision.rationale,
                "routing"
            );
            if let Some(intent) = decision.intent {
                record.state.set_intent(intent);
            }
            record.push(StepEvent::Routing {
                decision: decision.clone(),
            });

            let flow = self.apply(record, decision, cancel).await;
            if let Flow::Suspended = flow {
                publish.send_replace(record.transcript());
                return;
            }
            if !record.state.is_halted() {
                publish.send_replace(record.transcript());
            }
        }

        self.finish(record).await;
        publish.send_replace(record.transcript());
    }

    /// 应用审批信号。拒绝：终止并审计，返回 None；批准：返回待重放的决策，由 resume 继续推进
    pub async fn resolve_approval(
        &self,
        record: &mut RunRecord,
        approved: bool,
        publish: &watch::Sender<RunTranscript>,
    ) -> Result<Option<RoutingDecision>, RunError> {
        let worker = match record.state.phase() {
            RunPhase::AwaitingApproval { decision } => decision.worker(),
            _ => None,
        };
        match gate::resolve(&mut record.state, approved)? {
            GateResolution::Rejected => {
                record.push(StepEvent::ApprovalRejected { worker });
                record.push(StepEvent::Halt {
                    reason: HaltReason::HumanRejected,
                    final_answer: record.state.final_answer().map(str::to_string),
                    last_error: record.state.last_error().map(str::to_string),
                });
                tracing::info!(run_id = %record.state.run_id, "delegation rejected");
                self.finish(record).await;
                publish.send_replace(record.transcript());
                Ok(None)
            }
            GateResolution::Approved(decision) => {
                record.push(StepEvent::ApprovalGranted { worker });
                tracing::info!(run_id = %record.state.run_id, worker = ?worker, "delegation approved");
                publish.send_replace(record.transcript());
                Ok(Some(decision))
            }
        }
    }

    /// 批准后：执行被挂起的决策，然后继续推进
    pub async fn resume(
        &self,
        record: &mut RunRecord,
        decision: RoutingDecision,
        cancel: &CancellationToken,
        publish: &watch::Sender<RunTranscript>,
    ) {
        if cancel.is_cancelled() {
            record.halt(HaltReason::Cancelled, CANCELLED_TEXT);
        } else {
            record.state.begin_step();
            if let Flow::Suspended = self.apply(record, decision, cancel).await {
                publish.send_replace(record.transcript());
                return;
            }
        }
        self.drive(record, cancel, publish).await;
    }

    /// 取消一个挂起中的运行（不在 drive 中，无人观察取消信号）
    pub fn cancel_suspended(&self, record: &mut RunRecord, publish: &watch::Sender<RunTranscript>) {
        if record.state.is_halted() {
            return;
        }
        record.halt(HaltReason::Cancelled, CANCELLED_TEXT);
        publish.send_replace(record.transcript());
    }

    async fn apply(
        &self,
        record: &mut RunRecord,
        decision: RoutingDecision,
        cancel: &CancellationToken,
    ) -> Flow {
        match decision.target {
            RouteTarget::Halt => {
                let text = decision
                    .reply
                    .or_else(|| record.state.final_answer().map(str::to_string))
                    .unwrap_or_else(|| "No answer was produced.".to_string());
                record.halt(HaltReason::Answered, text);
                Flow::Continue
            }
            RouteTarget::AwaitHumanApproval => match decision.deferred {
                Some(deferred) => {
                    let worker = deferred.worker();
                    record.state.suspend_for_approval(*deferred);
                    record.push(StepEvent::ApprovalRequested { worker });
                    tracing::info!(run_id = %record.state.run_id, worker = ?worker, "awaiting approval");
                    Flow::Suspended
                }
                None => {
                    let e = RunError::Routing("approval requested without a deferred delegation".into());
                    self.fatal(record, &e);
                    Flow::Continue
                }
            },
            RouteTarget::Worker(worker) => {
                self.worker_step(record, worker, cancel).await;
                Flow::Continue
            }
        }
    }

    async fn worker_step(&self, record: &mut RunRecord, worker_id: WorkerId, cancel: &CancellationToken) {
        let Some(worker) = self.workers.get(&worker_id).cloned() else {
            let e = RunError::Routing(format!("no worker registered for {worker_id}"));
            self.fatal(record, &e);
            return;
        };
        let recovery = RecoveryEngine::new(record.config.max_retries);
        record.state.delegate_to(worker_id);

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                record.halt(HaltReason::Cancelled, CANCELLED_TEXT);
                return;
            }
            out = worker.step(&record.state) => out,
        };

        match output {
            WorkerOutput::FinalAnswer { text } => {
                record.state.record_worker_answer(worker_id, &text);
                record.push(StepEvent::WorkerAnswer {
                    worker: worker_id,
                    text,
                });
            }
            WorkerOutput::ErrorObservation { detail } => {
                let feedback = recovery.worker_error_feedback(&detail);
                record.state.record_worker_error(worker_id, &detail, feedback.clone());
                tracing::warn!(
                    run_id = %record.state.run_id,
                    worker = %worker_id,
                    retry_count = record.state.retry_count(),
                    detail = %detail,
                    "worker output unusable"
                );
                record.push(StepEvent::WorkerError {
                    worker: worker_id,
                    detail,
                    retry_count: record.state.retry_count(),
                });
                self.recover(record, &recovery, feedback);
            }
            WorkerOutput::ToolRequest { tool, raw_arguments } => {
                let attempt = record.state.record_tool_request(worker_id, &tool, &raw_arguments);
                record.push(StepEvent::ToolRequested {
                    worker: worker_id,
                    tool: tool.clone(),
                    raw_arguments: raw_arguments.clone(),
                    attempt,
                });

                let allowed = worker.allowed_tools();
                let result = if allowed.iter().any(|t| *t == tool) {
                    let ctx = ToolContext {
                        row_limit: record.config.row_limit,
                        prior_records: prior_records(&record.state),
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            record.halt(HaltReason::Cancelled, CANCELLED_TEXT);
                            return;
                        }
                        r = self.sandbox.invoke(&tool, &raw_arguments, &ctx) => r,
                    }
                } else {
                    tracing::warn!(run_id = %record.state.run_id, worker = %worker_id, tool = %tool, "tool not available to worker");
                    ToolResult {
                        arguments: Map::new(),
                        outcome: Err(ToolError::UnknownTool { name: tool.clone() }),
                    }
                };

                let feedback = recovery.tool_feedback(&tool, &result.arguments, &result.outcome, allowed);
                let row_count = result.row_count();
                let invocation = ToolInvocationRecord {
                    worker: worker_id,
                    tool_name: tool,
                    raw_arguments,
                    arguments: result.arguments,
                    attempt_number: attempt,
                    outcome: match result.outcome {
                        Ok(payload) => ToolOutcome::Success { payload },
                        Err(error) => ToolOutcome::Failure { error },
                    },
                    row_count,
                    recorded_at: Utc::now(),
                };
                let failed = !invocation.is_success();
                tracing::info!(
                    run_id = %record.state.run_id,
                    worker = %worker_id,
                    tool = %invocation.tool_name,
                    attempt,
                    ok = !failed,
                    "tool result"
                );
                record.state.record_tool_result(invocation.clone(), feedback.clone());
                record.push(StepEvent::ToolResult { record: invocation });
                if failed {
                    self.recover(record, &recovery, feedback);
                }
            }
        }
    }

    /// 失败已记录：未达上限则交回同一 Worker，否则终止
    fn recover(&self, record: &mut RunRecord, recovery: &RecoveryEngine, feedback: String) {
        match recovery.handle_failure(&record.state, feedback) {
            RecoveryAction::RetryWithPrompt(_) => {
                tracing::debug!(
                    run_id = %record.state.run_id,
                    retry_count = record.state.retry_count(),
                    "retrying with diagnostic"
                );
            }
            RecoveryAction::Halt { reason, explanation } => record.halt(reason, explanation),
        }
    }

    fn fatal(&self, record: &mut RunRecord, err: &RunError) {
        record.state.record_fatal_error(err.to_string());
        if let RecoveryAction::Halt { reason, explanation } =
            RecoveryEngine::default().handle_run_error(err)
        {
            record.halt(reason, explanation);
        }
    }

    /// 终止后的影子审计：每次运行最多一次，取消的运行不审计
    async fn finish(&self, record: &mut RunRecord) {
        if record.audit.is_some() || record.state.halt_reason() == Some(HaltReason::Cancelled) {
            return;
        }
        let Some(auditor) = &self.auditor else {
            return;
        };
        let answer = record.state.final_answer().unwrap_or_default().to_string();
        let verdict = auditor
            .audit(&record.state.user_request, &answer, record.state.observations())
            .await;
        record.push(StepEvent::Audit {
            verdict: verdict.clone(),
        });
        record.audit = Some(verdict);
    }
}

/// 最近一次成功的 execute_statement 结果行，作为分析工具的默认输入
fn prior_records(state: &ConversationState) -> Vec<Map<String, Value>> {
    state
        .observations()
        .iter()
        .rev()
        .filter(|o| o.tool_name == EXECUTE_STATEMENT)
        .find_map(|o| match &o.outcome {
            ToolOutcome::Success { payload } => payload.get("rows").and_then(|r| r.as_array()),
            ToolOutcome::Failure { .. } => None,
        })
        .map(|rows| {
            rows.iter()
                .filter_map(|r| r.as_object().cloned())
                .collect()
        })
        .unwrap_or_default()
}
