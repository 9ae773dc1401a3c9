//! Human-in-the-Loop 门控（Safe Mode）
//!
//! running -> awaiting-approval -> {running, halted(human-rejected)}。
//! 只在控制权切换到有成本的 Worker 时要求审批；同一 Worker 的工具循环继续执行不再打断。
//! Safe Mode 关闭时完全透明。

use crate::core::{ConversationState, HaltReason, RouteTarget, RoutingDecision, RunError, WorkerId};

/// 审批结果
#[derive(Debug, Clone, PartialEq)]
pub enum GateResolution {
    /// 批准：重放挂起的原始决策
    Approved(RoutingDecision),
    Rejected,
}

/// 对 Router 的委派决策做 Safe Mode 筛查
pub fn screen(
    decision: RoutingDecision,
    state: &ConversationState,
    safe_mode: bool,
    cost_bearing: impl Fn(WorkerId) -> bool,
) -> RoutingDecision {
    let Some(worker) = decision.worker() else {
        return decision;
    };
    if !safe_mode || !cost_bearing(worker) || state.active_worker() == Some(worker) {
        return decision;
    }
    let mut gated = RoutingDecision::new(
        RouteTarget::AwaitHumanApproval,
        format!("safe mode: approval required before delegating to {worker}"),
    );
    gated.intent = decision.intent;
    gated.deferred = Some(Box::new(decision));
    gated
}

/// 应用外部审批信号
pub fn resolve(state: &mut ConversationState, approved: bool) -> Result<GateResolution, RunError> {
    if state.is_halted() {
        return Err(RunError::AlreadyHalted(state.run_id.clone()));
    }
    let decision = state
        .resume()
        .ok_or_else(|| RunError::NotAwaitingApproval(state.run_id.clone()))?;
    if approved {
        Ok(GateResolution::Approved(decision))
    } else {
        let worker = decision.worker().map(|w| w.to_string()).unwrap_or_default();
        state.halt(
            HaltReason::HumanRejected,
            format!("The delegation to {worker} was not approved, so no work was performed."),
        );
        Ok(GateResolution::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunPhase;

    fn delegate(worker: WorkerId) -> RoutingDecision {
        RoutingDecision::new(RouteTarget::Worker(worker), "needs data")
    }

    #[test]
    fn test_transparent_when_safe_mode_off() {
        let state = ConversationState::new("r", "q");
        let d = screen(delegate(WorkerId::Engineer), &state, false, |_| true);
        assert_eq!(d.target, RouteTarget::Worker(WorkerId::Engineer));
    }

    #[test]
    fn test_gates_change_of_control_only() {
        let mut state = ConversationState::new("r", "q");
        let d = screen(delegate(WorkerId::Engineer), &state, true, |_| true);
        assert_eq!(d.target, RouteTarget::AwaitHumanApproval);
        assert_eq!(d.deferred.as_deref(), Some(&delegate(WorkerId::Engineer)));

        state.delegate_to(WorkerId::Engineer);
        let d = screen(delegate(WorkerId::Engineer), &state, true, |_| true);
        assert_eq!(d.target, RouteTarget::Worker(WorkerId::Engineer));

        let d = screen(delegate(WorkerId::Engineer), &ConversationState::new("r", "q"), true, |_| false);
        assert_eq!(d.target, RouteTarget::Worker(WorkerId::Engineer), "free workers pass");
    }

    #[test]
    fn test_halt_decisions_pass_through() {
        let state = ConversationState::new("r", "q");
        let d = screen(RoutingDecision::new(RouteTarget::Halt, "done"), &state, true, |_| true);
        assert_eq!(d.target, RouteTarget::Halt);
    }

    #[test]
    fn test_resolve_approve_and_reject() {
        let mut state = ConversationState::new("r", "q");
        state.suspend_for_approval(delegate(WorkerId::Engineer));
        assert_eq!(
            resolve(&mut state, true).unwrap(),
            GateResolution::Approved(delegate(WorkerId::Engineer))
        );
        assert_eq!(state.phase(), &RunPhase::Running);
        assert!(matches!(resolve(&mut state, true), Err(RunError::NotAwaitingApproval(_))));

        state.suspend_for_approval(delegate(WorkerId::Engineer));
        assert_eq!(resolve(&mut state, false).unwrap(), GateResolution::Rejected);
        assert_eq!(state.halt_reason(), Some(HaltReason::HumanRejected));
        assert_eq!(state.active_worker(), None);
        assert!(matches!(resolve(&mut state, false), Err(RunError::AlreadyHalted(_))));
    }
}
