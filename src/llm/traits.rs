//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Scripted Mock）实现 LlmClient：complete 返回文本，
//! complete_structured 在 prompt 中附带 JSON Schema 并解析出 JSON 对象。
//! 调用均视为带超时的阻塞调用；对编排核心而言所有失败都是 Other 类错误。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::memory::Message;

/// completion 服务错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Completion timed out after {0}s")]
    Timeout(u64),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Structured output error: {0}")]
    StructuredOutput(String),

    #[error("Scripted responses exhausted")]
    Exhausted,
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 结构化输出：将 schema 作为约束追加到 system 消息，解析回复中的第一个 JSON 对象
    async fn complete_structured(
        &self,
        messages: &[Message],
        schema: &Value,
    ) -> Result<Value, LlmError> {
        let mut full = Vec::with_capacity(messages.len() + 1);
        full.extend_from_slice(messages);
        full.push(Message::system(format!(
            "Respond with ONLY a JSON object matching this JSON Schema, no prose:\n{schema}"
        )));
        let text = self.complete(&full).await?;
        extract_json_object(&text)
            .ok_or_else(|| LlmError::StructuredOutput(format!("no JSON object in: {text}")))
    }
}

/// 从模型回复中提取第一个 JSON 对象（兼容 ```json 代码块与前后多余文字）
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

/// 带超时的 complete；超时转为 LlmError::Timeout
pub async fn complete_with_timeout(
    llm: &dyn LlmClient,
    messages: &[Message],
    timeout: Duration,
) -> Result<String, LlmError> {
    match tokio::time::timeout(timeout, llm.complete(messages)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(timeout.as_secs())),
    }
}

/// 带超时的 complete_structured
pub async fn complete_structured_with_timeout(
    llm: &dyn LlmClient,
    messages: &[Message],
    schema: &Value,
    timeout: Duration,
) -> Result<Value, LlmError> {
    match tokio::time::timeout(timeout, llm.complete_structured(messages, schema)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(timeout.as_secs())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_block() {
        let v = extract_json_object("```json\n{\"next\": \"ENGINEER\"}\n```").unwrap();
        assert_eq!(v["next"], "ENGINEER");
    }

    #[test]
    fn test_extract_json_with_surrounding_prose() {
        let v = extract_json_object("Sure. {\"groundedness\": 0.9} Hope that helps").unwrap();
        assert_eq!(v["groundedness"], 0.9);
    }

    #[test]
    fn test_extract_json_rejects_non_objects() {
        assert!(extract_json_object("[1, 2, 3]").is_none());
        assert!(extract_json_object("no json here").is_none());
    }
}
