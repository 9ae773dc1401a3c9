//! 表格查询引擎抽象
//!
//! 引擎是同步的（在 spawn_blocking 中运行），只负责“一条语句 -> 行或类型化错误”；
//! 熔断、超时与错误分类到 BackendError 由 BackendExecutor 负责。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// 引擎原生错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("{0}")]
    Parse(String),

    #[error("{0}")]
    Catalog(String),

    #[error("statement interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}

/// 查询结果：列名 + 按列顺序的行
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 每行转为 {列名: 值} 对象，供 Worker 与分析工具消费
    pub fn to_records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<Map<String, Value>>()
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

/// 表结构摘要，注入 Worker 的 system prompt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSummary {
    pub tables: Vec<TableInfo>,
}

impl fmt::Display for SchemaSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tables.is_empty() {
            return f.write_str("Database is empty.");
        }
        for (i, table) in self.tables.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "Table: {}", table.name)?;
            for col in &table.columns {
                writeln!(f, "  - {} ({})", col.name, col.data_type)?;
            }
        }
        Ok(())
    }
}

type InterruptFn = Box<dyn Fn() + Send>;

/// 超时中断槽：引擎在开始执行时登记中断回调，执行器超时时触发
#[derive(Clone, Default)]
pub struct InterruptSlot {
    callback: Arc<Mutex<Option<InterruptFn>>>,
    fired: Arc<AtomicBool>,
}

impl InterruptSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记中断回调；已触发时立即调用
    pub fn register(&self, f: impl Fn() + Send + 'static) {
        if let Ok(mut slot) = self.callback.lock() {
            if self.fired.load(Ordering::SeqCst) {
                f();
            }
            *slot = Some(Box::new(f));
        }
    }

    /// 语句结束后注销，避免中断到共享连接上的下一条语句
    pub fn clear(&self) {
        if let Ok(mut slot) = self.callback.lock() {
            *slot = None;
        }
    }

    pub fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        if let Ok(slot) = self.callback.lock() {
            if let Some(f) = slot.as_ref() {
                f();
            }
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// 表格查询引擎：只读，一次一条语句
pub trait TabularEngine: Send + Sync {
    /// 执行语句，最多取 max_rows 行（调用方传 limit + 1 以探测超限）
    fn fetch(
        &self,
        statement: &str,
        max_rows: usize,
        interrupt: &InterruptSlot,
    ) -> Result<RowSet, EngineError>;

    fn describe_schema(&self) -> Result<SchemaSummary, EngineError>;
}
