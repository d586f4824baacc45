//! Embedded SQLite store
//!
//! One connection behind a mutex: statements from the writer and the readers
//! are serialized, so a reader never observes a half-applied row.

use super::{Dialect, Store};
use crate::error::{NdbError, Result};
use crate::types::{Row, Value};
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const MEMORY: &str = ":memory:";

/// Thread-safe SQLite connection wrapper
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Option<Connection>>>,
    file_backed: bool,
}

impl SqliteStore {
    /// Open `location`, a file path or `:memory:`
    pub fn open(location: &str) -> Result<Self> {
        info!(location, "Opening SQLite store");

        let file_backed = location != MEMORY;
        let conn = if file_backed {
            if let Some(parent) = Path::new(location).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        NdbError::Store(format!("Failed to create directory: {}", e))
                    })?;
                }
            }
            Connection::open(location)?
        } else {
            Connection::open_in_memory()?
        };

        Self::configure_pragmas(&conn, file_backed)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            file_backed,
        })
    }

    /// Private in-memory store
    pub fn memory() -> Result<Self> {
        Self::open(MEMORY)
    }

    fn configure_pragmas(conn: &Connection, file_backed: bool) -> Result<()> {
        debug!("Configuring SQLite pragmas");
        if file_backed {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        }
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch("PRAGMA temp_store = MEMORY;")?;
        Ok(())
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let guard = self.conn.lock();
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(NdbError::Closed),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            Value::Real(v) => ToSqlOutput::Borrowed(ValueRef::Real(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
        })
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

impl Store for SqliteStore {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            Ok(stmt.execute(rusqlite::params_from_iter(params.iter()))?)
        })
    }

    fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with_connection(|conn| Ok(conn.execute_batch(sql)?))
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let width = stmt.column_count();
            let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
                (0..width)
                    .map(|i| row.get_ref(i).map(from_sql))
                    .collect::<rusqlite::Result<Row>>()
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<Row>>>()?)
        })
    }

    fn commit(&self) -> Result<()> {
        // autocommit: every statement is already durable, only fold the WAL back
        if self.file_backed {
            self.with_connection(|conn| Ok(conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?))
        } else {
            self.with_connection(|_| Ok(()))
        }
    }

    fn close(&self) -> Result<()> {
        let conn = self.conn.lock().take();
        match conn {
            Some(conn) => conn.close().map_err(|(_, e)| NdbError::Sqlite(e)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store() {
        let store = SqliteStore::memory().unwrap();
        store
            .execute_batch("CREATE TABLE t (f_a INTEGER, f_b TEXT);")
            .unwrap();
        let n = store
            .execute(
                "INSERT INTO t (f_a, f_b) VALUES (?, ?)",
                &[Value::Integer(1), Value::Null],
            )
            .unwrap();
        assert_eq!(n, 1);
        let rows = store.query("SELECT f_a, f_b FROM t", &[]).unwrap();
        assert_eq!(rows, vec![vec![Value::Integer(1), Value::Null]]);
    }

    #[test]
    fn test_file_store_uses_wal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ndb.db");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        let rows = store.query("PRAGMA journal_mode;", &[]).unwrap();
        assert_eq!(rows[0][0].as_str().map(str::to_lowercase), Some("wal".to_string()));
        store.commit().unwrap();
    }

    #[test]
    fn test_closed_store_rejects_calls() {
        let store = SqliteStore::memory().unwrap();
        store.close().unwrap();
        store.close().unwrap();
        assert!(matches!(store.query("SELECT 1", &[]), Err(NdbError::Closed)));
        assert!(matches!(store.commit(), Err(NdbError::Closed)));
    }

    #[test]
    fn test_query_error_is_untranslated() {
        let store = SqliteStore::memory().unwrap();
        assert!(matches!(
            store.query("SELECT * FROM missing", &[]),
            Err(NdbError::Sqlite(_))
        ));
    }
}
