//! Scripted LLM 客户端（用于测试与离线演示，无需 API）
//!
//! 按顺序返回预置回复；脚本用尽后返回 LlmError::Exhausted。记录每次收到的消息，便于断言调用次数与 prompt 内容。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;

/// 预置回复的一项：文本或错误
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Error(LlmError),
}

/// 按脚本回复的 Mock 客户端
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<ScriptedReply>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|r| ScriptedReply::Text(r.into()))
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 追加一条错误回复
    pub fn then_error(self, err: LlmError) -> Self {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(ScriptedReply::Error(err));
        }
        self
    }

    /// 追加一条文本回复
    pub fn then_text(self, text: impl Into<String>) -> Self {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(ScriptedReply::Text(text.into()));
        }
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// 第 n 次调用收到的消息
    pub fn call(&self, n: usize) -> Option<Vec<Message>> {
        self.calls.lock().ok().and_then(|c| c.get(n).cloned())
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        let next = self
            .replies
            .lock()
            .map_err(|e| LlmError::ApiError(e.to_string()))?
            .pop_front();
        match next {
            Some(ScriptedReply::Text(t)) => Ok(t),
            Some(ScriptedReply::Error(e)) => Err(e),
            None => Err(LlmError::Exhausted),
        }
    }
}
