//! Backend Executor：单条语句的执行、结果量熔断与超时
//!
//! 向引擎请求至多 row_limit + 1 行；多于 row_limit 行时整体丢弃并返回 ResultTooLarge，
//! 绝不返回部分成功。错误原样分类透传，执行器自身不重试。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::backend::engine::{EngineError, InterruptSlot, RowSet, SchemaSummary, TabularEngine};
use crate::core::{BackendError, BackendErrorKind};

pub struct BackendExecutor {
    engine: Arc<dyn TabularEngine>,
    timeout: Duration,
}

impl BackendExecutor {
    pub fn new(engine: Arc<dyn TabularEngine>, timeout_secs: u64) -> Self {
        Self {
            engine,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 执行一条只读语句；成功时行数保证 <= row_limit
    ///
    /// 调用方丢弃返回的 future（取消）时，正在执行的语句同样会被中断。
    pub async fn execute(&self, statement: &str, row_limit: usize) -> Result<RowSet, BackendError> {
        let start = Instant::now();
        let engine = self.engine.clone();
        let owned = statement.to_string();
        let guard = InterruptOnDrop::new(InterruptSlot::new());
        let task_slot = guard.slot.clone();
        let probe = row_limit.saturating_add(1);

        let handle =
            tokio::task::spawn_blocking(move || engine.fetch(&owned, probe, &task_slot));

        let joined = match timeout(self.timeout, handle).await {
            Ok(joined) => {
                guard.disarm();
                joined
            }
            Err(_) => {
                guard.slot.fire();
                tracing::warn!(
                    event = "backend_timeout",
                    timeout_ms = self.timeout.as_millis() as u64,
                    "statement timed out; interrupted"
                );
                return Err(BackendError::timeout(self.timeout));
            }
        };
        let rows = match joined {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => return Err(to_backend_error(e, self.timeout)),
            Err(join) => {
                return Err(BackendError::new(
                    BackendErrorKind::Other,
                    format!("backend task failed: {join}"),
                ))
            }
        };

        if rows.len() > row_limit {
            tracing::info!(
                event = "result_too_large",
                row_limit,
                observed_at_least = rows.len(),
                "circuit breaker tripped"
            );
            return Err(BackendError::result_too_large(rows.len(), row_limit));
        }

        tracing::debug!(
            rows = rows.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "statement ok"
        );
        Ok(rows)
    }

    pub async fn describe_schema(&self) -> Result<SchemaSummary, BackendError> {
        let engine = self.engine.clone();
        let handle = tokio::task::spawn_blocking(move || engine.describe_schema());
        match timeout(self.timeout, handle).await {
            Ok(Ok(Ok(schema))) => Ok(schema),
            Ok(Ok(Err(e))) => Err(to_backend_error(e, self.timeout)),
            Ok(Err(join)) => Err(BackendError::new(
                BackendErrorKind::Other,
                format!("backend task failed: {join}"),
            )),
            Err(_) => Err(BackendError::timeout(self.timeout)),
        }
    }
}

/// 语句未正常完成就被丢弃时触发中断，释放引擎占用的连接
struct InterruptOnDrop {
    slot: InterruptSlot,
    armed: bool,
}

impl InterruptOnDrop {
    fn new(slot: InterruptSlot) -> Self {
        Self { slot, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if self.armed && !self.slot.is_fired() {
            tracing::debug!("backend call dropped before completion; interrupting statement");
            self.slot.fire();
        }
    }
}

fn to_backend_error(e: EngineError, limit: Duration) -> BackendError {
    match e {
        EngineError::Parse(m) => BackendError::new(BackendErrorKind::ParseError, m),
        EngineError::Catalog(m) => BackendError::new(BackendErrorKind::CatalogError, m),
        EngineError::Interrupted => BackendError::timeout(limit),
        EngineError::Other(m) => BackendError::new(BackendErrorKind::Other, m),
    }
}
