//! 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：工具 / 后端失败先交给发起的 Worker 自愈（RetryWithPrompt），
//! 重试耗尽或 RoutingError 才升级给调用方（Halt）。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::HaltReason;

/// 后端错误种类；原样透传给 Worker，执行器本身不重试
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// 语法错误
    ParseError,
    /// 未知列 / 未知表 / 类型不匹配
    CatalogError,
    /// 结果行数超过熔断阈值
    ResultTooLarge,
    /// 其它（含超时）
    Other,
}

impl std::fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ParseError => "ParseError",
            Self::CatalogError => "CatalogError",
            Self::ResultTooLarge => "ResultTooLarge",
            Self::Other => "Other",
        };
        f.write_str(s)
    }
}

/// 后端结构化错误
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
    /// ResultTooLarge 时观测到的行数下界
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_rows: Option<usize>,
    /// 超时按 Other 处理，但单独标记便于观测
    #[serde(default)]
    pub timed_out: bool,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            observed_rows: None,
            timed_out: false,
        }
    }

    pub fn result_too_large(observed_at_least: usize, limit: usize) -> Self {
        Self {
            kind: BackendErrorKind::ResultTooLarge,
            message: format!(
                "statement returned more than {limit} rows (observed at least {observed_at_least})"
            ),
            observed_rows: Some(observed_at_least),
            timed_out: false,
        }
    }

    pub fn timeout(limit: std::time::Duration) -> Self {
        Self {
            kind: BackendErrorKind::Other,
            message: format!(
                "statement exceeded the {}ms timeout and was interrupted",
                limit.as_millis()
            ),
            observed_rows: None,
            timed_out: true,
        }
    }
}

/// Tool Sandbox 返回的结构化失败
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolError {
    /// 参数文本无法解析或校验失败（发生在任何后端调用之前）
    #[error("ArgumentError: {message}")]
    Argument { message: String },

    /// Worker 请求了不存在或无权使用的工具
    #[error("UnknownTool: {name}")]
    UnknownTool { name: String },

    #[error("BackendError: {0}")]
    Backend(BackendError),

    /// 计算类工具在合法参数上失败（如数据不足以拟合）
    #[error("ComputationError: {message}")]
    Computation { message: String },
}

impl ToolError {
    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument {
            message: message.into(),
        }
    }

    pub fn computation(message: impl Into<String>) -> Self {
        Self::Computation {
            message: message.into(),
        }
    }

    pub fn backend(&self) -> Option<&BackendError> {
        match self {
            Self::Backend(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BackendError> for ToolError {
    fn from(e: BackendError) -> Self {
        Self::Backend(e)
    }
}

/// 运行级错误：对调用方可见
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    /// Router 产出无效目标：控制逻辑缺陷，立即终止、不重试
    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {0} is not awaiting approval")]
    NotAwaitingApproval(String),

    #[error("Run {0} has already halted")]
    AlreadyHalted(String),

    #[error("Cancelled")]
    Cancelled,
}

/// 恢复引擎给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 将诊断注入下一轮，让同一个 Worker 修正后重试
    RetryWithPrompt(String),
    /// 终止运行，附带用户可见的说明
    Halt { reason: HaltReason, explanation: String },
}
