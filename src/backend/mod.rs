//! 数据后端：表格查询引擎与带熔断的执行器

pub mod engine;
pub mod executor;
pub mod sqlite;

pub use engine::{
    ColumnInfo, EngineError, InterruptSlot, RowSet, SchemaSummary, TableInfo, TabularEngine,
};
pub use executor::BackendExecutor;
pub use sqlite::SqliteEngine;
