//! LLM 层：completion 服务抽象与实现（OpenAI 兼容 / Scripted Mock）、嵌入

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use embedding::{cosine_similarity, EmbeddingProvider, OpenAiEmbedder};
pub use mock::{ScriptedLlmClient, ScriptedReply};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{
    complete_structured_with_timeout, complete_with_timeout, extract_json_object, LlmClient,
    LlmError,
};

use crate::config::AppConfig;

/// 根据配置创建 Worker 与 Router 使用的两个客户端：(worker, router)
///
/// 需要 OPENAI_API_KEY；未设置时返回 None，由调用方决定如何处理。
pub fn create_llms_from_config(cfg: &AppConfig) -> Option<(Arc<dyn LlmClient>, Arc<dyn LlmClient>)> {
    let key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty())?;
    let base = cfg.llm.base_url.as_deref();
    let worker_model = cfg.llm.model.clone();
    let router_model = cfg
        .llm
        .router_model
        .clone()
        .unwrap_or_else(|| worker_model.clone());
    tracing::info!(
        provider = %cfg.llm.provider,
        worker_model = %worker_model,
        router_model = %router_model,
        "Using OpenAI-compatible completion service"
    );
    let worker: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(base, &worker_model, Some(&key)));
    let router: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(base, &router_model, Some(&key)));
    Some((worker, router))
}
