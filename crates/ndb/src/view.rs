//! Per-entity read surface: live handles, dumps, CSV and summaries
//!
//! Every read here runs synchronously on the calling thread. Row sequences
//! are restartable: each fetch re-issues the query against the store.

use crate::engine::Shared;
use crate::entity::{Entity, Key};
use crate::error::Result;
use crate::handle::Handle;
use crate::schema::TARGET;
use crate::types::{Row, Value};
use std::marker::PhantomData;
use std::sync::Arc;

/// Read access to one entity table
pub struct View<E: Entity> {
    shared: Arc<Shared>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> View<E> {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            _entity: PhantomData,
        }
    }

    /// New live handle for `key`; every call returns a distinct handle
    pub fn get(&self, key: impl Into<Key>) -> Result<Handle<E>> {
        let reader = self.shared.reader()?;
        let key = E::shorthand(key.into())?;
        let key = E::complete_key(key, &reader)?;
        Handle::register(self.shared.clone(), key)
    }

    /// Rows matching every `(field, value)` pair, by raw or short field name
    pub fn dump<K, I>(&self, matches: I) -> Result<Dump>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let spec = E::SPEC;
        let dialect = self.shared.reader()?.dialect();

        let mut conditions = Vec::new();
        let mut params = Vec::new();
        for (name, value) in matches {
            let name = spec.resolve(name.as_ref())?;
            conditions.push(format!(
                "rs.{} = {}",
                spec.column(name),
                dialect.placeholder(conditions.len() + 1, spec.field_type(name))
            ));
            params.push(spec.coerce(name, value));
        }

        let (base, header) = match E::DUMP {
            Some(projection) => (projection.sql.to_string(), to_header(projection.header)),
            None => {
                let columns: Vec<String> =
                    spec.columns().iter().map(|c| format!("rs.{}", c)).collect();
                (
                    format!("SELECT {} FROM {} AS rs", columns.join(", "), spec.table),
                    spec.header(),
                )
            }
        };
        let sql = if conditions.is_empty() {
            base
        } else {
            format!("{} WHERE {}", base, conditions.join(" AND "))
        };

        Ok(Dump::new(self.shared.clone(), sql, params, header))
    }

    /// [`View::dump`] rendered as CSV lines
    pub fn csv<K, I>(&self, matches: I) -> Result<Csv>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Ok(Csv(self.dump(matches)?))
    }

    /// Curated overview; falls back to the key columns
    pub fn summary(&self) -> Result<Dump> {
        let spec = E::SPEC;
        let dump = match E::SUMMARY {
            Some(projection) => Dump::new(
                self.shared.clone(),
                projection.sql.to_string(),
                Vec::new(),
                to_header(projection.header),
            ),
            None => {
                let header: Vec<String> = std::iter::once(TARGET)
                    .chain(spec.key.iter().copied())
                    .map(|name| spec.column(name))
                    .collect();
                let sql = format!("SELECT {} FROM {}", header.join(", "), spec.table);
                Dump::new(self.shared.clone(), sql, Vec::new(), header)
            }
        };
        Ok(dump)
    }
}

fn to_header(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

/// A restartable query result
#[derive(Clone)]
pub struct Dump {
    shared: Arc<Shared>,
    sql: String,
    params: Vec<Value>,
    header: Vec<String>,
}

impl Dump {
    fn new(shared: Arc<Shared>, sql: String, params: Vec<Value>, header: Vec<String>) -> Self {
        Self {
            shared,
            sql,
            params,
            header,
        }
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Data rows, freshly queried
    pub fn rows(&self) -> Result<Vec<Row>> {
        self.shared.reader()?.query(&self.sql, &self.params)
    }

    /// Header row followed by the data rows
    pub fn fetch(&self) -> Result<Vec<Row>> {
        let header: Row = self.header.iter().cloned().map(Value::Text).collect();
        let mut rows = vec![header];
        rows.extend(self.rows()?);
        Ok(rows)
    }

    /// Iterate header first; the query runs when this is called
    pub fn iter(&self) -> Result<std::vec::IntoIter<Row>> {
        Ok(self.fetch()?.into_iter())
    }
}

impl std::fmt::Debug for Dump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dump")
            .field("sql", &self.sql)
            .field("params", &self.params)
            .field("header", &self.header)
            .finish()
    }
}

/// CSV rendering of a [`Dump`]
#[derive(Debug, Clone)]
pub struct Csv(Dump);

impl Csv {
    /// Header line followed by one line per row, freshly queried
    pub fn lines(&self) -> Result<Vec<String>> {
        Ok(self.0.fetch()?.iter().map(|row| csv_line(row)).collect())
    }
}

/// Integers and reals bare, null empty, anything else single-quoted
pub fn csv_line(row: &[Value]) -> String {
    row.iter()
        .map(|value| match value {
            Value::Null => String::new(),
            Value::Integer(v) => v.to_string(),
            Value::Real(v) => v.to_string(),
            Value::Text(v) => format!("'{}'", v),
        })
        .collect::<Vec<_>>()
        .join(",")
}
