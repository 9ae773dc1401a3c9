//! SQLite 表格引擎（rusqlite）
//!
//! 两种模式：
//! - 共享连接：内存库，所有调用串行使用同一个 Connection（测试与演示）
//! - 文件只读：每次调用以 SQLITE_OPEN_READ_ONLY 打开新连接，多个运行可并发读
//!
//! 两种模式都用 Statement::readonly 拒绝写语句。

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use serde_json::Value;

use crate::backend::engine::{
    ColumnInfo, EngineError, InterruptSlot, RowSet, SchemaSummary, TableInfo, TabularEngine,
};

enum Mode {
    Shared(Mutex<Connection>),
    ReadOnlyFile(PathBuf),
}

pub struct SqliteEngine {
    mode: Mode,
}

impl SqliteEngine {
    /// 包装一个已建好的连接（通常是预先写入数据的内存库）
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            mode: Mode::Shared(Mutex::new(conn)),
        }
    }

    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory().map_err(classify)?;
        Ok(Self::from_connection(conn))
    }

    /// 以只读方式使用数据库文件；打开一次以校验文件可用
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        open_read_only_connection(&path)?;
        Ok(Self {
            mode: Mode::ReadOnlyFile(path),
        })
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        match &self.mode {
            Mode::Shared(conn) => {
                let conn = conn
                    .lock()
                    .map_err(|e| EngineError::Other(format!("connection lock poisoned: {e}")))?;
                f(&conn)
            }
            Mode::ReadOnlyFile(path) => {
                let conn = open_read_only_connection(path)?;
                f(&conn)
            }
        }
    }
}

fn open_read_only_connection(path: &Path) -> Result<Connection, EngineError> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| EngineError::Other(format!("cannot open {}: {e}", path.display())))
}

impl TabularEngine for SqliteEngine {
    fn fetch(
        &self,
        statement: &str,
        max_rows: usize,
        interrupt: &InterruptSlot,
    ) -> Result<RowSet, EngineError> {
        let statement = statement.trim().trim_end_matches(';').trim_end();
        if statement.is_empty() {
            return Err(EngineError::Parse("empty statement".to_string()));
        }

        self.with_connection(|conn| {
            if interrupt.is_fired() {
                return Err(EngineError::Interrupted);
            }
            let handle = conn.get_interrupt_handle();
            interrupt.register(move || handle.interrupt());
            let result = run_statement(conn, statement, max_rows);
            interrupt.clear();
            result
        })
    }

    fn describe_schema(&self) -> Result<SchemaSummary, EngineError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master \
                     WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
                     ORDER BY name",
                )
                .map_err(classify)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(classify)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(classify)?;

            let mut tables = Vec::with_capacity(names.len());
            for name in names {
                let mut cols = conn
                    .prepare("SELECT name, type FROM pragma_table_info(?1)")
                    .map_err(classify)?;
                let columns = cols
                    .query_map([&name], |row| {
                        Ok(ColumnInfo {
                            name: row.get(0)?,
                            data_type: row.get(1)?,
                        })
                    })
                    .map_err(classify)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(classify)?;
                tables.push(TableInfo { name, columns });
            }
            Ok(SchemaSummary { tables })
        })
    }
}

fn run_statement(conn: &Connection, statement: &str, max_rows: usize) -> Result<RowSet, EngineError> {
    let mut stmt = conn.prepare(statement).map_err(classify)?;
    if !stmt.readonly() {
        return Err(EngineError::Other(
            "only read-only statements are allowed".to_string(),
        ));
    }
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();

    let mut rows = stmt.query([]).map_err(classify)?;
    let mut out = Vec::new();
    while out.len() < max_rows {
        let Some(row) = rows.next().map_err(classify)? else {
            break;
        };
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(to_json(row.get_ref(i).map_err(classify)?));
        }
        out.push(values);
    }
    Ok(RowSet { columns, rows: out })
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
    }
}

/// 按错误消息分类
fn classify(err: rusqlite::Error) -> EngineError {
    if let rusqlite::Error::MultipleStatement = err {
        return EngineError::Parse("only one statement may be executed at a time".to_string());
    }
    if let rusqlite::Error::SqliteFailure(ref e, _) = err {
        if e.code == ErrorCode::OperationInterrupted {
            return EngineError::Interrupted;
        }
    }
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("no such column")
        || lower.contains("no such table")
        || lower.contains("no such function")
        || lower.contains("datatype mismatch")
        || lower.contains("ambiguous column")
    {
        EngineError::Catalog(message)
    } else if lower.contains("syntax error")
        || lower.contains("incomplete input")
        || lower.contains("unrecognized token")
    {
        EngineError::Parse(message)
    } else {
        EngineError::Other(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> SqliteEngine {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE sales (id INTEGER PRIMARY KEY, region TEXT, amount REAL);
             INSERT INTO sales (region, amount) VALUES ('EMEA', 10.0), ('APAC', 20.5), ('EMEA', NULL);",
        )
        .unwrap();
        SqliteEngine::from_connection(conn)
    }

    #[test]
    fn test_fetch_rows_and_columns() {
        let engine = seeded();
        let rs = engine
            .fetch("SELECT region, amount FROM sales ORDER BY id;", 10, &InterruptSlot::new())
            .unwrap();
        assert_eq!(rs.columns, vec!["region", "amount"]);
        assert_eq!(rs.len(), 3);
        assert_eq!(rs.rows[1][1], Value::from(20.5));
        assert_eq!(rs.rows[2][1], Value::Null);
    }

    #[test]
    fn test_fetch_stops_at_max_rows() {
        let engine = seeded();
        let rs = engine
            .fetch("SELECT * FROM sales", 2, &InterruptSlot::new())
            .unwrap();
        assert_eq!(rs.len(), 2);
    }

    #[test]
    fn test_error_classification() {
        let engine = seeded();
        let slot = InterruptSlot::new();
        assert!(matches!(
            engine.fetch("SELECT amout FROM sales", 10, &slot),
            Err(EngineError::Catalog(_))
        ));
        assert!(matches!(
            engine.fetch("SELECT * FROM nope", 10, &slot),
            Err(EngineError::Catalog(_))
        ));
        assert!(matches!(
            engine.fetch("SELEC * FROM sales", 10, &slot),
            Err(EngineError::Parse(_))
        ));
        assert!(matches!(
            engine.fetch("SELECT 1; SELECT 2", 10, &slot),
            Err(EngineError::Parse(_))
        ));
    }

    #[test]
    fn test_write_statements_rejected() {
        let engine = seeded();
        let err = engine
            .fetch("DELETE FROM sales", 10, &InterruptSlot::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::Other(_)));
        let rs = engine
            .fetch("SELECT COUNT(*) FROM sales", 10, &InterruptSlot::new())
            .unwrap();
        assert_eq!(rs.rows[0][0], Value::from(3));
    }

    #[test]
    fn test_fired_slot_short_circuits() {
        let engine = seeded();
        let slot = InterruptSlot::new();
        slot.fire();
        assert_eq!(
            engine.fetch("SELECT 1", 10, &slot),
            Err(EngineError::Interrupted)
        );
    }

    #[test]
    fn test_describe_schema() {
        let engine = seeded();
        let schema = engine.describe_schema().unwrap();
        assert_eq!(schema.tables.len(), 1);
        assert_eq!(schema.tables[0].name, "sales");
        let names: Vec<_> = schema.tables[0].columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "region", "amount"]);

        let empty = SqliteEngine::open_in_memory().unwrap();
        assert_eq!(empty.describe_schema().unwrap().to_string(), "Database is empty.");
    }

    #[test]
    fn test_read_only_file_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1), (2);")
                .unwrap();
        }
        let engine = SqliteEngine::open_read_only(&path).unwrap();
        let rs = engine
            .fetch("SELECT SUM(x) AS total FROM t", 10, &InterruptSlot::new())
            .unwrap();
        assert_eq!(rs.rows[0][0], Value::from(3));
        assert!(engine
            .fetch("INSERT INTO t VALUES (3)", 10, &InterruptSlot::new())
            .is_err());
        assert!(SqliteEngine::open_read_only(dir.path().join("missing.db")).is_err());
    }
}
