//! Interface addresses

use super::{Entity, Key, KeyMap, Projection, resolve_fields, split_prefix};
use crate::error::{NdbError, Result};
use crate::event::EventKind;
use crate::handle::{HandleCore, Method};
use crate::schema::{Field, TableSpec};
use crate::types::{RtnlKind, Value};

const ADDRESSES: TableSpec = TableSpec {
    table: "addresses",
    kind: RtnlKind::Address,
    fields: &[
        Field::int("family"),
        Field::int("prefixlen"),
        Field::int("scope"),
        Field::int("index"),
        Field::text("IFA_ADDRESS"),
        Field::text("IFA_LOCAL"),
        Field::text("IFA_LABEL"),
        Field::text("IFA_BROADCAST"),
    ],
    key: &["index", "IFA_ADDRESS", "prefixlen"],
    link_column: Some("index"),
};

/// An address bound to an interface; `"10.0.0.1/24"` as shorthand
pub struct Address;

impl Entity for Address {
    const SPEC: &'static TableSpec = &ADDRESSES;

    const SUMMARY: Option<Projection> = Some(Projection {
        sql: "SELECT rs.f_target, i.f_IFLA_IFNAME, rs.f_IFA_ADDRESS, rs.f_prefixlen \
              FROM addresses AS rs \
              LEFT JOIN interfaces AS i \
              ON i.f_index = rs.f_index AND i.f_target = rs.f_target \
              ORDER BY rs.f_target, rs.f_index",
        header: &["target", "ifname", "address", "prefixlen"],
    });

    const DUMP: Option<Projection> = Some(Projection {
        sql: "SELECT rs.f_target, i.f_IFLA_IFNAME, rs.f_family, rs.f_prefixlen, \
              rs.f_scope, rs.f_index, rs.f_IFA_ADDRESS, rs.f_IFA_LOCAL, \
              rs.f_IFA_LABEL, rs.f_IFA_BROADCAST \
              FROM addresses AS rs \
              LEFT JOIN interfaces AS i \
              ON i.f_index = rs.f_index AND i.f_target = rs.f_target",
        header: &[
            "target",
            "ifname",
            "family",
            "prefixlen",
            "scope",
            "index",
            "address",
            "local",
            "label",
            "broadcast",
        ],
    });

    fn shorthand(key: Key) -> Result<KeyMap> {
        match key {
            Key::Name(text) => {
                let (addr, len) = split_prefix(Self::SPEC.table, &text)?;
                let mut key = KeyMap::from([("IFA_ADDRESS".to_string(), Value::Text(addr))]);
                if let Some(len) = len {
                    key.insert("prefixlen".to_string(), Value::Integer(len));
                }
                Ok(key)
            }
            Key::Index(_) => Err(NdbError::InvalidKey {
                table: Self::SPEC.table,
                reason: "addresses are not addressed by index".to_string(),
            }),
            Key::Fields(fields) => resolve_fields(Self::SPEC, fields),
        }
    }

    fn event_map() -> Vec<(EventKind, Method<Self>)> {
        let on_message: Method<Self> = HandleCore::<Self>::on_message;
        let on_link_removed: Method<Self> = HandleCore::<Self>::on_link_removed;
        vec![(EventKind::Address, on_message), (EventKind::Link, on_link_removed)]
    }
}
