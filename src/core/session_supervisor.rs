//! 运行监管：单个运行的取消
//!
//! 每个运行持有一个 CancellationToken；状态机在每个挂起点（completion、后端调用、等待审批）观察它。

use tokio_util::sync::CancellationToken;

use crate::core::RunId;

#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    run_id: RunId,
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    pub fn new(run_id: impl Into<RunId>) -> Self {
        Self {
            run_id: run_id.into(),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消；已取消时无操作
    pub fn cancel(&self) {
        if !self.cancel_token.is_cancelled() {
            tracing::info!(run_id = %self.run_id, "run cancellation requested");
            self.cancel_token.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let sup = SessionSupervisor::new("run-1");
        let token = sup.cancel_token();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        sup.cancel();
        sup.cancel();
        waiter.await.unwrap();
        assert!(sup.is_cancelled());
    }
}
