//! 记忆层：对话消息、分词、语义模式检索

pub mod conversation;
pub mod patterns;
pub mod tokenizer;

pub use conversation::{Message, Role};
pub use patterns::{
    EmbeddingPatternIndex, KeywordPatternIndex, PatternMatch, PatternRetriever, RetrievalError,
    GOLDEN_PATTERNS,
};
