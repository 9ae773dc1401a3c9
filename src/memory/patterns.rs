//! 语义模式检索：已验证的查询模式（golden queries）
//!
//! 抽取 Worker 在写语句前调用 search(query, k) 获取相似的已验证模式；检索是尽力而为，
//! 失败只降低 grounding 质量，不会让运行失败。
//! KeywordPatternIndex 按词重叠打分（无需外部服务）；EmbeddingPatternIndex 按余弦相似度打分。

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::{cosine_similarity, EmbeddingProvider};
use crate::memory::tokenizer::token_set;

/// 一条检索结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub pattern: String,
    pub score: f32,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetrievalError {
    #[error("Pattern index unavailable: {0}")]
    Unavailable(String),
}

/// 语义模式检索 trait（只读）
#[async_trait]
pub trait PatternRetriever: Send + Sync {
    /// 按相关度降序返回最多 k 条
    async fn search(&self, query: &str, k: usize) -> Result<Vec<PatternMatch>, RetrievalError>;
}

/// 内置的已验证查询模式
pub const GOLDEN_PATTERNS: &[&str] = &[
    "Time-series aggregation by month: SELECT strftime('%Y-%m', transaction_date) AS month, SUM(amount) AS revenue FROM transactions GROUP BY 1 ORDER BY 1;",
    "Top performers by revenue: SELECT product_name, SUM(amount) AS total_revenue FROM transactions GROUP BY product_name ORDER BY total_revenue DESC LIMIT 5;",
    "Anomaly candidates beyond three standard deviations: SELECT * FROM transactions WHERE amount > (SELECT AVG(amount) + 3 * (SELECT sqrt(AVG(amount * amount) - AVG(amount) * AVG(amount)) FROM transactions) FROM transactions) LIMIT 100;",
    "Preparing data for forecasting (ds, y): SELECT date(transaction_date) AS ds, SUM(amount) AS y FROM transactions WHERE region = 'EMEA' GROUP BY ds ORDER BY ds ASC;",
    "Filter successful revenue only: SELECT SUM(amount) AS revenue FROM transactions WHERE status = 'Successful';",
];

/// 词重叠索引：score = 交集大小 / 查询词数
#[derive(Clone, Default)]
pub struct KeywordPatternIndex {
    store: Arc<RwLock<Vec<(String, HashSet<String>)>>>,
}

impl KeywordPatternIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置 GOLDEN_PATTERNS 的索引
    pub fn with_golden_patterns() -> Self {
        let index = Self::new();
        for p in GOLDEN_PATTERNS {
            index.add(p);
        }
        index
    }

    pub fn add(&self, pattern: &str) {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return;
        }
        if let Ok(mut store) = self.store.write() {
            store.push((pattern.to_string(), token_set(pattern)));
        }
    }

    pub fn len(&self) -> usize {
        self.store.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PatternRetriever for KeywordPatternIndex {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<PatternMatch>, RetrievalError> {
        let query_tokens = token_set(query);
        if query_tokens.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let store = self
            .store
            .read()
            .map_err(|e| RetrievalError::Unavailable(e.to_string()))?;
        let mut scored: Vec<PatternMatch> = store
            .iter()
            .filter_map(|(text, doc_tokens)| {
                let overlap = query_tokens.intersection(doc_tokens).count();
                (overlap > 0).then(|| PatternMatch {
                    pattern: text.clone(),
                    score: overlap as f32 / query_tokens.len() as f32,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }
}

/// 向量索引：添加时计算嵌入，检索时按余弦相似度排序
pub struct EmbeddingPatternIndex {
    embedder: Arc<dyn EmbeddingProvider>,
    store: RwLock<Vec<(String, Vec<f32>)>>,
}

impl EmbeddingPatternIndex {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedder,
            store: RwLock::new(Vec::new()),
        }
    }

    /// 索引一条模式；嵌入失败时返回错误，不写入
    pub async fn add(&self, pattern: &str) -> Result<(), RetrievalError> {
        let vector = self
            .embedder
            .embed(pattern)
            .await
            .map_err(RetrievalError::Unavailable)?;
        let mut store = self
            .store
            .write()
            .map_err(|e| RetrievalError::Unavailable(e.to_string()))?;
        store.push((pattern.to_string(), vector));
        Ok(())
    }
}

#[async_trait]
impl PatternRetriever for EmbeddingPatternIndex {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<PatternMatch>, RetrievalError> {
        let q = self
            .embedder
            .embed(query)
            .await
            .map_err(RetrievalError::Unavailable)?;
        let store = self
            .store
            .read()
            .map_err(|e| RetrievalError::Unavailable(e.to_string()))?;
        let mut scored: Vec<PatternMatch> = store
            .iter()
            .map(|(text, v)| PatternMatch {
                pattern: text.clone(),
                score: cosine_similarity(&q, v),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }
}
