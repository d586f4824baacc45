//! Table layouts and the single-writer schema maintainer
//!
//! Each entity owns one table whose columns are the raw protocol field names
//! prefixed with `f_`, plus `f_target`. Rows are unique per
//! (target, entity key). Only the dispatch loop holds a [`Schema`].

use crate::error::{NdbError, Result};
use crate::store::{Dialect, Store, StoreReader};
use crate::types::{RtnlKind, RtnlMessage, Value, nla2name};
use std::sync::Arc;
use tracing::{debug, info};

/// Name under which the target column is addressed in keys and matches
pub const TARGET: &str = "target";

/// Table appended to when the protocol log is enabled
pub const LOG_TABLE: &str = "rtnl_log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Text,
}

/// One column of an entity table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Raw protocol name, `index` or `IFLA_IFNAME`
    pub name: &'static str,
    pub ty: FieldType,
}

impl Field {
    pub const fn int(name: &'static str) -> Self {
        Self {
            name,
            ty: FieldType::Integer,
        }
    }

    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            ty: FieldType::Text,
        }
    }

    /// Column name in the store
    pub fn column(&self) -> String {
        format!("f_{}", self.name)
    }

    /// Short display name, `ifname` for `IFLA_IFNAME`
    pub fn short_name(&self) -> String {
        nla2name(self.name)
    }

    /// Value stored for a key column that the message left out
    pub fn key_default(&self) -> Value {
        match self.ty {
            FieldType::Integer => Value::Integer(0),
            FieldType::Text => Value::Text(String::new()),
        }
    }

    /// Bring a caller-supplied value to the column type
    pub fn coerce(&self, value: Value) -> Value {
        match (self.ty, value) {
            (FieldType::Integer, Value::Text(s)) => match s.trim().parse::<i64>() {
                Ok(v) => Value::Integer(v),
                Err(_) => Value::Text(s),
            },
            (FieldType::Integer, Value::Real(v)) if v.fract() == 0.0 => Value::Integer(v as i64),
            (FieldType::Text, Value::Integer(v)) => Value::Text(v.to_string()),
            (_, v) => v,
        }
    }
}

/// Static layout of one entity table
#[derive(Debug)]
pub struct TableSpec {
    pub table: &'static str,
    pub kind: RtnlKind,
    pub fields: &'static [Field],
    /// Natural key within a target, as raw field names
    pub key: &'static [&'static str],
    /// Column holding the owning link's index; rows go away with the link
    pub link_column: Option<&'static str>,
}

impl TableSpec {
    /// Find a field by raw or short name
    pub fn lookup(&self, name: &str) -> Option<&'static Field> {
        let fields: &'static [Field] = self.fields;
        fields
            .iter()
            .find(|f| f.name == name)
            .or_else(|| fields.iter().find(|f| f.short_name() == name))
    }

    /// Resolve a caller-supplied name to a raw field name or [`TARGET`]
    pub fn resolve(&self, name: &str) -> Result<&'static str> {
        if name == TARGET {
            return Ok(TARGET);
        }
        self.lookup(name)
            .map(|f| f.name)
            .ok_or_else(|| NdbError::UnknownField {
                table: self.table,
                field: name.to_string(),
            })
    }

    /// Column for a resolved name
    pub fn column(&self, name: &str) -> String {
        format!("f_{}", name)
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        if name == TARGET {
            return Some(FieldType::Text);
        }
        self.lookup(name).map(|f| f.ty)
    }

    pub fn is_key(&self, name: &str) -> bool {
        self.key.contains(&name)
    }

    /// Coerce a value for a resolved name
    pub fn coerce(&self, name: &str, value: Value) -> Value {
        match self.lookup(name) {
            Some(field) => field.coerce(value),
            None => value,
        }
    }

    /// Value of `name` in a message, with absent key fields at their default
    pub fn message_value(&self, msg: &RtnlMessage, name: &str) -> Value {
        let Some(field) = self.lookup(name) else {
            return Value::Null;
        };
        match msg.get(field.name) {
            Some(v) => field.coerce(v.clone()),
            None if self.is_key(field.name) => field.key_default(),
            None => Value::Null,
        }
    }

    /// Every column, target first, in table order
    pub fn columns(&self) -> Vec<String> {
        std::iter::once(self.column(TARGET))
            .chain(self.fields.iter().map(Field::column))
            .collect()
    }

    /// Header names for `SELECT *`: target plus the short name of every field
    pub fn header(&self) -> Vec<String> {
        std::iter::once(TARGET.to_string())
            .chain(self.fields.iter().map(Field::short_name))
            .collect()
    }

    fn key_columns(&self) -> Vec<String> {
        std::iter::once(self.column(TARGET))
            .chain(self.key.iter().map(|k| self.column(k)))
            .collect()
    }

    pub fn create_sql(&self, dialect: Dialect) -> String {
        let mut columns = vec![format!("{} TEXT NOT NULL DEFAULT ''", self.column(TARGET))];
        for field in self.fields {
            let ty = dialect.column_type(field.ty);
            if self.is_key(field.name) {
                let default = match field.ty {
                    FieldType::Integer => "0",
                    FieldType::Text => "''",
                };
                columns.push(format!("{} {} NOT NULL DEFAULT {}", field.column(), ty, default));
            } else {
                columns.push(format!("{} {}", field.column(), ty));
            }
        }
        columns.push(format!("UNIQUE ({})", self.key_columns().join(", ")));
        format!("CREATE TABLE {} ({})", self.table, columns.join(", "))
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", self.table)
    }

    pub fn upsert_sql(&self, dialect: Dialect) -> String {
        let columns = self.columns();
        let placeholders: Vec<String> = std::iter::once(dialect.placeholder(1, Some(FieldType::Text)))
            .chain(
                self.fields
                    .iter()
                    .enumerate()
                    .map(|(i, f)| dialect.placeholder(i + 2, Some(f.ty))),
            )
            .collect();
        let updates: Vec<String> = self
            .fields
            .iter()
            .filter(|f| !self.is_key(f.name))
            .map(|f| format!("{0} = excluded.{0}", f.column()))
            .collect();
        let action = if updates.is_empty() {
            "NOTHING".to_string()
        } else {
            format!("UPDATE SET {}", updates.join(", "))
        };
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO {}",
            self.table,
            columns.join(", "),
            placeholders.join(", "),
            self.key_columns().join(", "),
            action
        )
    }

    pub fn delete_sql(&self, dialect: Dialect) -> String {
        let names: Vec<&str> = std::iter::once(TARGET).chain(self.key.iter().copied()).collect();
        format!(
            "DELETE FROM {} WHERE {}",
            self.table,
            self.where_clause(dialect, &names, 1)
        )
    }

    /// `f_a = ? AND f_b = ?` for resolved names, placeholders from `first`
    pub fn where_clause(&self, dialect: Dialect, names: &[&str], first: usize) -> String {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                format!(
                    "{} = {}",
                    self.column(name),
                    dialect.placeholder(first + i, self.field_type(name))
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Row parameters for the upsert: target, then every field
    pub fn row_values(&self, target: &str, msg: &RtnlMessage) -> Vec<Value> {
        std::iter::once(Value::Text(target.to_string()))
            .chain(self.fields.iter().map(|f| self.message_value(msg, f.name)))
            .collect()
    }

    /// Delete parameters: target, then every key field
    pub fn key_values(&self, target: &str, msg: &RtnlMessage) -> Vec<Value> {
        std::iter::once(Value::Text(target.to_string()))
            .chain(self.key.iter().map(|k| self.message_value(msg, k)))
            .collect()
    }
}

/// Owner of the tables; applies protocol messages to rows
///
/// Constructed once, then rebound whenever the lifecycle manager reopens the
/// store. Tables are recreated on every bind so stale rows never survive a
/// reconnect.
pub struct Schema {
    store: Arc<dyn Store>,
    tables: &'static [&'static TableSpec],
    verbose: bool,
    applied: u64,
}

impl Schema {
    pub fn new(
        store: Arc<dyn Store>,
        tables: &'static [&'static TableSpec],
        verbose: bool,
    ) -> Result<Self> {
        let schema = Self {
            store,
            tables,
            verbose,
            applied: 0,
        };
        schema.create_tables()?;
        Ok(schema)
    }

    /// Switch to a freshly opened store and recreate the tables there
    pub fn rebind(&mut self, store: Arc<dyn Store>) -> Result<()> {
        self.store = store;
        self.create_tables()
    }

    fn create_tables(&self) -> Result<()> {
        let dialect = self.store.dialect();
        for spec in self.tables {
            self.store.execute_batch(&spec.drop_sql())?;
            self.store.execute_batch(&spec.create_sql(dialect))?;
        }
        self.store
            .execute_batch(&format!("DROP TABLE IF EXISTS {}", LOG_TABLE))?;
        if self.verbose {
            self.store.execute_batch(&format!(
                "CREATE TABLE {} (f_tstamp TEXT NOT NULL, f_target TEXT NOT NULL, \
                 f_kind TEXT NOT NULL, f_action TEXT NOT NULL, f_fields TEXT)",
                LOG_TABLE
            ))?;
        }
        info!(tables = self.tables.len(), verbose = self.verbose, "Schema bound");
        Ok(())
    }

    pub fn reader(&self) -> StoreReader {
        StoreReader::new(self.store.clone())
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn spec(&self, kind: RtnlKind) -> Option<&'static TableSpec> {
        self.tables.iter().copied().find(|s| s.kind == kind)
    }

    /// Number of messages applied since construction
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Apply one message: upsert on New, delete (with link cascade) on Del
    pub fn apply(&mut self, target: &str, msg: &RtnlMessage) -> Result<()> {
        let Some(spec) = self.spec(msg.kind) else {
            debug!(kind = msg.kind.as_str(), "No table for message kind");
            return Ok(());
        };
        let dialect = self.store.dialect();
        match msg.action {
            crate::types::Action::New => {
                self.store
                    .execute(&spec.upsert_sql(dialect), &spec.row_values(target, msg))?;
            }
            crate::types::Action::Del => {
                self.store
                    .execute(&spec.delete_sql(dialect), &spec.key_values(target, msg))?;
                if msg.kind == RtnlKind::Link {
                    self.cascade(target, spec.message_value(msg, "index"))?;
                }
            }
        }
        if self.verbose {
            self.log(target, msg)?;
        }
        self.applied += 1;
        Ok(())
    }

    fn cascade(&self, target: &str, index: Value) -> Result<()> {
        let dialect = self.store.dialect();
        for spec in self.tables {
            let Some(column) = spec.link_column else {
                continue;
            };
            let sql = format!(
                "DELETE FROM {} WHERE {}",
                spec.table,
                spec.where_clause(dialect, &[TARGET, column], 1)
            );
            let removed = self
                .store
                .execute(&sql, &[Value::Text(target.to_string()), index.clone()])?;
            if removed > 0 {
                debug!(table = spec.table, removed, "Cascaded link removal");
            }
        }
        Ok(())
    }

    fn log(&self, target: &str, msg: &RtnlMessage) -> Result<()> {
        let dialect = self.store.dialect();
        let fields = serde_json::to_string(&msg.fields)
            .map_err(|e| NdbError::Store(format!("Failed to encode log entry: {}", e)))?;
        let placeholders: Vec<String> = (1..=5)
            .map(|n| dialect.placeholder(n, Some(FieldType::Text)))
            .collect();
        let sql = format!(
            "INSERT INTO {} (f_tstamp, f_target, f_kind, f_action, f_fields) VALUES ({})",
            LOG_TABLE,
            placeholders.join(", ")
        );
        self.store.execute(
            &sql,
            &[
                Value::Text(chrono::Utc::now().to_rfc3339()),
                Value::Text(target.to_string()),
                Value::Text(msg.kind.as_str().to_string()),
                Value::Text(msg.action.as_str().to_string()),
                Value::Text(fields),
            ],
        )?;
        Ok(())
    }

    /// Commit the current store
    pub fn commit(&self) -> Result<()> {
        self.store.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Address, Entity, Interface, TABLES};
    use crate::store::SqliteStore;
    use crate::types::Action;
    use pretty_assertions::assert_eq;

    fn schema(verbose: bool) -> Schema {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::memory().unwrap());
        Schema::new(store, TABLES, verbose).unwrap()
    }

    fn link(action: Action, index: u32, name: &str) -> RtnlMessage {
        RtnlMessage::new(RtnlKind::Link, action)
            .with("index", index)
            .with("IFLA_IFNAME", name)
            .with("flags", 65609u32)
    }

    fn count(schema: &Schema, table: &str) -> i64 {
        let rows = schema
            .reader()
            .query(&format!("SELECT COUNT(*) FROM {}", table), &[])
            .unwrap();
        rows[0][0].as_i64().unwrap()
    }

    #[test]
    fn test_lookup_by_raw_and_short_name() {
        let spec = Interface::SPEC;
        assert_eq!(spec.resolve("IFLA_IFNAME").unwrap(), "IFLA_IFNAME");
        assert_eq!(spec.resolve("ifname").unwrap(), "IFLA_IFNAME");
        assert_eq!(spec.resolve("target").unwrap(), TARGET);
        assert!(matches!(
            spec.resolve("bogus"),
            Err(NdbError::UnknownField { table: "interfaces", .. })
        ));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(Field::int("index").coerce(Value::from("7")), Value::Integer(7));
        assert_eq!(Field::text("IFA_ADDRESS").coerce(Value::Integer(1)), Value::from("1"));
    }

    #[test]
    fn test_upsert_replaces_row() {
        let mut schema = schema(false);
        schema.apply("localhost", &link(Action::New, 1, "lo")).unwrap();
        schema.apply("localhost", &link(Action::New, 1, "lo0")).unwrap();
        schema.apply("ns0", &link(Action::New, 1, "lo")).unwrap();
        assert_eq!(count(&schema, "interfaces"), 2);
        let rows = schema
            .reader()
            .query(
                "SELECT f_IFLA_IFNAME FROM interfaces WHERE f_target = ?",
                &[Value::from("localhost")],
            )
            .unwrap();
        assert_eq!(rows, vec![vec![Value::from("lo0")]]);
        assert_eq!(schema.applied(), 3);
    }

    #[test]
    fn test_missing_key_field_normalized() {
        let mut schema = schema(false);
        let addr = RtnlMessage::new(RtnlKind::Address, Action::New).with("index", 1u32);
        schema.apply("localhost", &addr).unwrap();
        schema.apply("localhost", &addr).unwrap();
        assert_eq!(count(&schema, Address::SPEC.table), 1);
    }

    #[test]
    fn test_link_delete_cascades() {
        let mut schema = schema(false);
        schema.apply("localhost", &link(Action::New, 2, "eth0")).unwrap();
        let addr = RtnlMessage::new(RtnlKind::Address, Action::New)
            .with("index", 2u32)
            .with("prefixlen", 24u8)
            .with("IFA_ADDRESS", "10.0.0.1");
        schema.apply("localhost", &addr).unwrap();
        let neigh = RtnlMessage::new(RtnlKind::Neighbour, Action::New)
            .with("ifindex", 2u32)
            .with("NDA_DST", "10.0.0.2");
        schema.apply("localhost", &neigh).unwrap();
        let route = RtnlMessage::new(RtnlKind::Route, Action::New)
            .with("RTA_TABLE", 254u32)
            .with("RTA_DST", "10.0.0.0")
            .with("dst_len", 24u8)
            .with("RTA_OIF", 2u32);
        schema.apply("localhost", &route).unwrap();

        schema.apply("localhost", &link(Action::Del, 2, "eth0")).unwrap();
        assert_eq!(count(&schema, "interfaces"), 0);
        assert_eq!(count(&schema, "addresses"), 0);
        assert_eq!(count(&schema, "neighbours"), 0);
        assert_eq!(count(&schema, "routes"), 0);
    }

    #[test]
    fn test_rebind_recreates_tables() {
        let mut schema = schema(false);
        schema.apply("localhost", &link(Action::New, 1, "lo")).unwrap();
        let store = schema.store().clone();
        schema.rebind(store).unwrap();
        assert_eq!(count(&schema, "interfaces"), 0);
    }

    #[test]
    fn test_verbose_protocol_log() {
        let mut schema = schema(true);
        schema.apply("localhost", &link(Action::New, 1, "lo")).unwrap();
        let rows = schema
            .reader()
            .query("SELECT f_target, f_kind, f_action, f_fields FROM rtnl_log", &[])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], Value::from("link"));
        assert_eq!(rows[0][2], Value::from("new"));
        assert!(rows[0][3].as_str().unwrap().contains("\"IFLA_IFNAME\":\"lo\""));
    }
}
