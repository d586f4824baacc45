//! Routing table entries

use super::{Entity, Key, KeyMap, Projection, resolve_fields, split_prefix};
use crate::error::{NdbError, Result};
use crate::event::EventKind;
use crate::handle::{HandleCore, Method};
use crate::schema::{Field, TableSpec};
use crate::types::{RtnlKind, Value};

const ROUTES: TableSpec = TableSpec {
    table: "routes",
    kind: RtnlKind::Route,
    fields: &[
        Field::int("family"),
        Field::int("dst_len"),
        Field::int("src_len"),
        Field::int("tos"),
        Field::int("proto"),
        Field::int("scope"),
        Field::int("type"),
        Field::int("RTA_TABLE"),
        Field::text("RTA_DST"),
        Field::text("RTA_GATEWAY"),
        Field::text("RTA_PREFSRC"),
        Field::int("RTA_OIF"),
        Field::int("RTA_PRIORITY"),
    ],
    key: &[
        "family",
        "RTA_TABLE",
        "RTA_DST",
        "dst_len",
        "tos",
        "RTA_PRIORITY",
    ],
    link_column: Some("RTA_OIF"),
};

/// A route; `"10.0.0.0/24"` or `"default"` as shorthand
pub struct Route;

impl Entity for Route {
    const SPEC: &'static TableSpec = &ROUTES;

    const SUMMARY: Option<Projection> = Some(Projection {
        sql: "SELECT f_target, f_RTA_TABLE, f_RTA_DST, f_dst_len, f_RTA_GATEWAY, f_RTA_OIF \
              FROM routes ORDER BY f_target, f_RTA_TABLE, f_RTA_DST",
        header: &["target", "table", "dst", "dst_len", "gateway", "oif"],
    });

    fn shorthand(key: Key) -> Result<KeyMap> {
        match key {
            Key::Name(text) if text == "default" => Ok(KeyMap::from([
                ("RTA_DST".to_string(), Value::Text(String::new())),
                ("dst_len".to_string(), Value::Integer(0)),
            ])),
            Key::Name(text) => {
                let (dst, len) = split_prefix(Self::SPEC.table, &text)?;
                let mut key = KeyMap::from([("RTA_DST".to_string(), Value::Text(dst))]);
                if let Some(len) = len {
                    key.insert("dst_len".to_string(), Value::Integer(len));
                }
                Ok(key)
            }
            Key::Index(_) => Err(NdbError::InvalidKey {
                table: Self::SPEC.table,
                reason: "routes are not addressed by index".to_string(),
            }),
            Key::Fields(fields) => resolve_fields(Self::SPEC, fields),
        }
    }

    fn event_map() -> Vec<(EventKind, Method<Self>)> {
        let on_message: Method<Self> = HandleCore::<Self>::on_message;
        let on_link_removed: Method<Self> = HandleCore::<Self>::on_link_removed;
        vec![(EventKind::Route, on_message), (EventKind::Link, on_link_removed)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_route_shorthand() {
        let key = Route::shorthand(Key::from("default")).unwrap();
        assert_eq!(key.get("RTA_DST"), Some(&Value::from("")));
        assert_eq!(key.get("dst_len"), Some(&Value::Integer(0)));
    }

    #[test]
    fn test_prefix_shorthand() {
        let key = Route::shorthand(Key::from("192.168.1.0/24")).unwrap();
        assert_eq!(key.get("RTA_DST"), Some(&Value::from("192.168.1.0")));
        assert_eq!(key.get("dst_len"), Some(&Value::Integer(24)));
    }

    #[test]
    fn test_table_short_name_resolves() {
        assert_eq!(Route::SPEC.resolve("table").unwrap(), "RTA_TABLE");
        assert_eq!(Route::SPEC.resolve("dst").unwrap(), "RTA_DST");
    }
}
