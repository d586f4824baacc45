//! Network interfaces (rtnetlink links)

use super::{Entity, Key, KeyMap, Projection, resolve_fields};
use crate::error::Result;
use crate::schema::{Field, TableSpec};
use crate::types::{RtnlKind, Value};

const INTERFACES: TableSpec = TableSpec {
    table: "interfaces",
    kind: RtnlKind::Link,
    fields: &[
        Field::int("index"),
        Field::int("flags"),
        Field::text("IFLA_IFNAME"),
        Field::text("IFLA_ADDRESS"),
        Field::text("IFLA_BROADCAST"),
        Field::int("IFLA_MTU"),
        Field::int("IFLA_TXQLEN"),
        Field::text("IFLA_QDISC"),
        Field::text("IFLA_OPERSTATE"),
    ],
    key: &["index"],
    link_column: None,
};

/// A network interface, keyed by index; `"eth0"` or `2` as shorthand
pub struct Interface;

impl Entity for Interface {
    const SPEC: &'static TableSpec = &INTERFACES;

    const SUMMARY: Option<Projection> = Some(Projection {
        sql: "SELECT f_target, f_index, f_IFLA_IFNAME, f_IFLA_ADDRESS, f_flags \
              FROM interfaces ORDER BY f_target, f_index",
        header: &["target", "index", "ifname", "lladdr", "flags"],
    });

    fn shorthand(key: Key) -> Result<KeyMap> {
        match key {
            Key::Name(name) => Ok(KeyMap::from([("IFLA_IFNAME".to_string(), Value::Text(name))])),
            Key::Index(index) => Ok(KeyMap::from([("index".to_string(), Value::Integer(index))])),
            Key::Fields(fields) => resolve_fields(Self::SPEC, fields),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shorthand() {
        let key = Interface::shorthand(Key::from("eth0")).unwrap();
        assert_eq!(key.get("IFLA_IFNAME"), Some(&Value::from("eth0")));
        let key = Interface::shorthand(Key::from(2)).unwrap();
        assert_eq!(key.get("index"), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_layout() {
        assert_eq!(Interface::SPEC.key, &["index"]);
        assert_eq!(Interface::SPEC.header()[..3], ["target", "index", "flags"]);
    }
}
