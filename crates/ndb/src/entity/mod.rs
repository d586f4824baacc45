//! Entity contract and the concrete mirrored object types
//!
//! An entity type names its table layout, how a caller's shorthand key is
//! expanded, how a partial key is completed from the store, and which events
//! a live handle reacts to.

pub mod address;
pub mod interface;
pub mod neighbour;
pub mod route;

use crate::error::{NdbError, Result};
use crate::event::EventKind;
use crate::handle::{HandleCore, Method};
use crate::schema::{TARGET, TableSpec};
use crate::store::StoreReader;
use crate::types::{DEFAULT_TARGET, Value};
use std::collections::BTreeMap;

pub use address::Address;
pub use interface::Interface;
pub use neighbour::Neighbour;
pub use route::Route;

/// Resolved key: raw field names (plus `target`) to values
pub type KeyMap = BTreeMap<String, Value>;

/// What a caller passes to `View::get`
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    /// Entity-specific shorthand: an interface name, an address, a prefix
    Name(String),
    Index(i64),
    /// Explicit fields by raw or short name
    Fields(KeyMap),
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Name(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Name(v)
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Index(v)
    }
}

impl From<u32> for Key {
    fn from(v: u32) -> Self {
        Key::Index(v.into())
    }
}

impl From<i32> for Key {
    fn from(v: i32) -> Self {
        Key::Index(v.into())
    }
}

impl From<KeyMap> for Key {
    fn from(v: KeyMap) -> Self {
        Key::Fields(v)
    }
}

impl<const N: usize> From<[(&str, Value); N]> for Key {
    fn from(v: [(&str, Value); N]) -> Self {
        Key::Fields(v.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

/// Precomputed query with its column header
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    pub sql: &'static str,
    pub header: &'static [&'static str],
}

/// Every entity table, in seed order
pub const TABLES: &[&TableSpec] = &[
    Interface::SPEC,
    Address::SPEC,
    Neighbour::SPEC,
    Route::SPEC,
];

pub trait Entity: Sized + Send + Sync + 'static {
    const SPEC: &'static TableSpec;

    /// Curated overview query used by `View::summary`
    const SUMMARY: Option<Projection> = None;

    /// Query used by `View::dump`; the main table must be aliased `rs` and
    /// the statement must accept a trailing `WHERE`
    const DUMP: Option<Projection> = None;

    /// Expand a caller key into fields
    fn shorthand(key: Key) -> Result<KeyMap> {
        match key {
            Key::Fields(fields) => resolve_fields(Self::SPEC, fields),
            other => Err(NdbError::InvalidKey {
                table: Self::SPEC.table,
                reason: format!("no shorthand for {:?}", other),
            }),
        }
    }

    /// Fill missing key fields from the store
    ///
    /// When no row matches, the key is returned as given and the handle
    /// keeps tracking the partial key.
    fn complete_key(mut key: KeyMap, reader: &StoreReader) -> Result<KeyMap> {
        let spec = Self::SPEC;
        key.entry(TARGET.to_string())
            .or_insert_with(|| Value::from(DEFAULT_TARGET));
        if spec.key.iter().all(|k| key.contains_key(*k)) {
            return Ok(key);
        }

        let names: Vec<&str> = key.keys().map(String::as_str).collect();
        let columns: Vec<String> = spec.key.iter().map(|k| spec.column(k)).collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} LIMIT 1",
            columns.join(", "),
            spec.table,
            spec.where_clause(reader.dialect(), &names, 1)
        );
        let params: Vec<Value> = key.values().cloned().collect();

        match reader.query(&sql, &params)?.into_iter().next() {
            Some(row) => {
                let target = key.remove(TARGET);
                let mut complete: KeyMap = spec
                    .key
                    .iter()
                    .map(|k| k.to_string())
                    .zip(row)
                    .collect();
                complete.insert(
                    TARGET.to_string(),
                    target.unwrap_or_else(|| DEFAULT_TARGET.into()),
                );
                Ok(complete)
            }
            None => Ok(key),
        }
    }

    /// Events a live handle subscribes to
    fn event_map() -> Vec<(EventKind, Method<Self>)> {
        let on_message: Method<Self> = HandleCore::<Self>::on_message;
        vec![(Self::SPEC.kind.into(), on_message)]
    }
}

/// Resolve caller field names (raw or short) and coerce the values
pub fn resolve_fields(spec: &TableSpec, fields: KeyMap) -> Result<KeyMap> {
    fields
        .into_iter()
        .map(|(name, value)| {
            let name = spec.resolve(&name)?;
            Ok((name.to_string(), spec.coerce(name, value)))
        })
        .collect()
}

/// Split `addr/len` into its parts; a bare address has no length
pub(crate) fn split_prefix(
    table: &'static str,
    text: &str,
) -> Result<(String, Option<i64>)> {
    match text.split_once('/') {
        None => Ok((text.to_string(), None)),
        Some((addr, len)) => {
            let len = len.parse::<i64>().map_err(|_| NdbError::InvalidKey {
                table,
                reason: format!("bad prefix length in {}", text),
            })?;
            Ok((addr.to_string(), Some(len)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use crate::store::{SqliteStore, Store};
    use crate::types::{Action, RtnlKind, RtnlMessage};
    use std::sync::Arc;

    fn schema_with_lo() -> Schema {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::memory().unwrap());
        let mut schema = Schema::new(store, TABLES, false).unwrap();
        let lo = RtnlMessage::new(RtnlKind::Link, Action::New)
            .with("index", 1u32)
            .with("IFLA_IFNAME", "lo");
        schema.apply("localhost", &lo).unwrap();
        schema
    }

    #[test]
    fn test_complete_key_from_store() {
        let schema = schema_with_lo();
        let key = Interface::shorthand(Key::from("lo")).unwrap();
        let key = Interface::complete_key(key, &schema.reader()).unwrap();
        assert_eq!(key.get("index"), Some(&Value::Integer(1)));
        assert_eq!(key.get(TARGET), Some(&Value::from("localhost")));
        assert!(!key.contains_key("IFLA_IFNAME"));
    }

    #[test]
    fn test_complete_key_stays_partial_when_missing() {
        let schema = schema_with_lo();
        let key = Interface::shorthand(Key::from("eth9")).unwrap();
        let key = Interface::complete_key(key, &schema.reader()).unwrap();
        assert_eq!(key.get("IFLA_IFNAME"), Some(&Value::from("eth9")));
        assert!(!key.contains_key("index"));
    }

    #[test]
    fn test_resolve_fields_rejects_unknown() {
        let fields = KeyMap::from([("bogus".to_string(), Value::Integer(1))]);
        assert!(matches!(
            resolve_fields(Interface::SPEC, fields),
            Err(NdbError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_fields_key_by_short_name() {
        let key = Interface::shorthand(Key::from([("ifname", Value::from("lo"))])).unwrap();
        assert_eq!(key.get("IFLA_IFNAME"), Some(&Value::from("lo")));
    }

    #[test]
    fn test_split_prefix() {
        assert_eq!(
            split_prefix("routes", "10.0.0.0/24").unwrap(),
            ("10.0.0.0".to_string(), Some(24))
        );
        assert_eq!(
            split_prefix("routes", "10.0.0.1").unwrap(),
            ("10.0.0.1".to_string(), None)
        );
        assert!(split_prefix("routes", "10.0.0.0/x").is_err());
    }
}
