//! 核心编排层：错误与恢复、会话状态、Safe Mode 门控、编排状态机、运行监管

pub mod error;
pub mod gate;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use error::{BackendError, BackendErrorKind, RecoveryAction, RunError, ToolError};
pub use gate::GateResolution;
pub use orchestrator::{Orchestrator, RunRecord};
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
pub use state::{
    ConversationState, HaltReason, Intent, PendingToolCall, RouteTarget, RoutingDecision, RunId,
    RunPhase, ToolInvocationRecord, ToolOutcome, WorkerAnswer, WorkerId,
};
