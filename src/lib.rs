//! DataLens - 多 Agent 数据分析编排核心
//!
//! 模块划分：
//! - **agent**: 运行 API（start_run / submit_approval / get_transcript / cancel_run）
//! - **backend**: 表格查询引擎（SQLite）与带超时、结果量熔断的执行器
//! - **config**: 应用配置加载（TOML + 环境变量）与单次运行配置
//! - **core**: 错误、会话状态、自愈恢复、Safe Mode 门控、编排状态机、运行监管
//! - **llm**: completion 服务抽象与实现（OpenAI 兼容 / Scripted Mock）、嵌入
//! - **memory**: 对话消息、分词、已验证查询模式的检索
//! - **observability**: 日志初始化
//! - **react**: Worker、Router、输出解析、Shadow Auditor、过程事件
//! - **tools**: 工具注册表、参数规范化、Sandbox 与四个内置工具

pub mod agent;
pub mod backend;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::{AgentBuilder, AgentService, RunHandle};
pub use config::{load_config, AppConfig, RunConfig};
pub use react::RunTranscript;
