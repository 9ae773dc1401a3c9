//! 认知层：Worker 输出解析、Worker、Router、Shadow Auditor、Prompt 模板、过程事件

pub mod auditor;
pub mod events;
pub mod output;
pub mod prompts;
pub mod router;
pub mod worker;

pub use auditor::{AuditFlag, AuditVerdict, ShadowAuditor};
pub use events::{RunTranscript, StepEvent, StepRecord};
pub use output::{parse_worker_output, WorkerOutput};
pub use router::{keyword_intent, Router};
pub use worker::{LlmWorker, Worker};
