//! Client-server PostgreSQL store
//!
//! sqlx is async-only; the store owns a small private runtime and blocks on
//! it, so callers on plain threads never see an executor.

use super::Store;
use crate::error::Result;
use std::sync::Arc;

#[cfg(not(feature = "postgres"))]
pub fn open(_location: &str) -> Result<Arc<dyn Store>> {
    Err(crate::error::NdbError::Config(
        "postgres backend requires building with the `postgres` feature".to_string(),
    ))
}

#[cfg(feature = "postgres")]
pub fn open(location: &str) -> Result<Arc<dyn Store>> {
    Ok(Arc::new(imp::PostgresStore::connect(location)?))
}

#[cfg(feature = "postgres")]
pub use imp::PostgresStore;

#[cfg(feature = "postgres")]
mod imp {
    use super::super::{Dialect, Store};
    use crate::error::{NdbError, Result};
    use crate::types::{Row, Value};
    use parking_lot::RwLock;
    use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
    use sqlx::query::Query;
    use sqlx::{Column, Postgres, Row as _, TypeInfo};
    use tokio::runtime::Runtime;
    use tracing::info;

    const MAX_CONNECTIONS: u32 = 4;

    fn store_err(e: sqlx::Error) -> NdbError {
        NdbError::Store(e.to_string())
    }

    pub struct PostgresStore {
        runtime: Runtime,
        pool: RwLock<Option<PgPool>>,
    }

    impl PostgresStore {
        pub fn connect(url: &str) -> Result<Self> {
            info!("Connecting to PostgreSQL store");
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("ndb-pg")
                .enable_all()
                .build()?;
            let pool = runtime
                .block_on(
                    PgPoolOptions::new()
                        .max_connections(MAX_CONNECTIONS)
                        .connect(url),
                )
                .map_err(store_err)?;
            Ok(Self {
                runtime,
                pool: RwLock::new(Some(pool)),
            })
        }

        fn pool(&self) -> Result<PgPool> {
            self.pool.read().clone().ok_or(NdbError::Closed)
        }
    }

    fn bind<'q>(
        mut query: Query<'q, Postgres, PgArguments>,
        params: &'q [Value],
    ) -> Query<'q, Postgres, PgArguments> {
        for param in params {
            query = match param {
                Value::Null => query.bind(None::<String>),
                Value::Integer(v) => query.bind(*v),
                Value::Real(v) => query.bind(*v),
                Value::Text(v) => query.bind(v.as_str()),
            };
        }
        query
    }

    fn decode(row: &PgRow) -> Result<Row> {
        row.columns()
            .iter()
            .map(|col| {
                let i = col.ordinal();
                let value = match col.type_info().name() {
                    "INT2" => row
                        .try_get::<Option<i16>, _>(i)
                        .map(|v| v.map(|v| Value::Integer(v.into()))),
                    "INT4" => row
                        .try_get::<Option<i32>, _>(i)
                        .map(|v| v.map(|v| Value::Integer(v.into()))),
                    "INT8" => row.try_get::<Option<i64>, _>(i).map(|v| v.map(Value::Integer)),
                    "FLOAT4" => row
                        .try_get::<Option<f32>, _>(i)
                        .map(|v| v.map(|v| Value::Real(v.into()))),
                    "FLOAT8" => row.try_get::<Option<f64>, _>(i).map(|v| v.map(Value::Real)),
                    "BOOL" => row
                        .try_get::<Option<bool>, _>(i)
                        .map(|v| v.map(|v| Value::Integer(v as i64))),
                    _ => row.try_get::<Option<String>, _>(i).map(|v| v.map(Value::Text)),
                };
                value.map(|v| v.unwrap_or(Value::Null)).map_err(store_err)
            })
            .collect()
    }

    impl Store for PostgresStore {
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }

        fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
            let pool = self.pool()?;
            let done = self
                .runtime
                .block_on(bind(sqlx::query(sql), params).execute(&pool))
                .map_err(store_err)?;
            Ok(done.rows_affected() as usize)
        }

        fn execute_batch(&self, sql: &str) -> Result<()> {
            let pool = self.pool()?;
            self.runtime
                .block_on(sqlx::raw_sql(sql).execute(&pool))
                .map_err(store_err)?;
            Ok(())
        }

        fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
            let pool = self.pool()?;
            let rows = self
                .runtime
                .block_on(bind(sqlx::query(sql), params).fetch_all(&pool))
                .map_err(store_err)?;
            rows.iter().map(decode).collect()
        }

        fn commit(&self) -> Result<()> {
            // pooled connections run in autocommit mode
            self.pool().map(|_| ())
        }

        fn close(&self) -> Result<()> {
            if let Some(pool) = self.pool.write().take() {
                self.runtime.block_on(pool.close());
            }
            Ok(())
        }
    }
}
