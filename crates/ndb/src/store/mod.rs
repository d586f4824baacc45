//! Relational store adapters
//!
//! Contract: one writer (the dispatch thread, through [`crate::schema::Schema`])
//! and any number of concurrent readers, with no locking on the caller side.

pub mod postgres;
pub mod sqlite;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;
use crate::schema::FieldType;
use crate::types::{Row, Value};
use std::fmt;
use std::sync::Arc;

pub use sqlite::SqliteStore;

/// SQL flavour spoken by a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Bind placeholder for the `n`-th parameter (1-based)
    ///
    /// PostgreSQL gets an explicit cast so NULL binds stay typed.
    pub fn placeholder(self, n: usize, ty: Option<FieldType>) -> String {
        match (self, ty) {
            (Dialect::Sqlite, _) => "?".to_string(),
            (Dialect::Postgres, None) => format!("${}", n),
            (Dialect::Postgres, Some(FieldType::Integer)) => format!("${}::BIGINT", n),
            (Dialect::Postgres, Some(FieldType::Text)) => format!("${}::TEXT", n),
        }
    }

    pub fn column_type(self, ty: FieldType) -> &'static str {
        match (self, ty) {
            (Dialect::Sqlite, FieldType::Integer) => "INTEGER",
            (Dialect::Postgres, FieldType::Integer) => "BIGINT",
            (_, FieldType::Text) => "TEXT",
        }
    }
}

/// A relational store
pub trait Store: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Run one statement, returning the number of affected rows
    fn execute(&self, sql: &str, params: &[Value]) -> Result<usize>;

    /// Run several `;`-separated statements without parameters
    fn execute_batch(&self, sql: &str) -> Result<()>;

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Make everything written so far durable
    fn commit(&self) -> Result<()>;

    /// Release the connection; later calls fail with `NdbError::Closed`
    fn close(&self) -> Result<()>;
}

/// Read-only view of a store handed to callers and entity key completion
#[derive(Clone)]
pub struct StoreReader {
    store: Arc<dyn Store>,
}

impl StoreReader {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn dialect(&self) -> Dialect {
        self.store.dialect()
    }

    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.store.query(sql, params)
    }
}

impl fmt::Debug for StoreReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreReader")
            .field("dialect", &self.dialect())
            .finish()
    }
}

/// Open the configured store
pub fn open(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    match config.backend {
        StoreBackend::Sqlite => Ok(Arc::new(SqliteStore::open(&config.location)?)),
        StoreBackend::Postgres => postgres::open(&config.location),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Sqlite.placeholder(3, Some(FieldType::Integer)), "?");
        assert_eq!(
            Dialect::Postgres.placeholder(2, Some(FieldType::Text)),
            "$2::TEXT"
        );
        assert_eq!(Dialect::Postgres.placeholder(1, None), "$1");
    }

    #[test]
    fn test_open_sqlite_memory() {
        let store = open(&StoreConfig::default()).unwrap();
        assert_eq!(store.dialect(), Dialect::Sqlite);
        let rows = StoreReader::new(store).query("SELECT 1 + 1", &[]).unwrap();
        assert_eq!(rows, vec![vec![Value::Integer(2)]]);
    }

    #[cfg(not(feature = "postgres"))]
    #[test]
    fn test_postgres_requires_feature() {
        let config = StoreConfig {
            backend: StoreBackend::Postgres,
            location: "postgres://localhost/ndb".to_string(),
        };
        assert!(matches!(
            open(&config),
            Err(crate::error::NdbError::Config(_))
        ));
    }
}
