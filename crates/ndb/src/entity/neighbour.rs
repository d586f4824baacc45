//! Neighbour (ARP / NDP) entries

use super::{Entity, Key, KeyMap, Projection, resolve_fields};
use crate::error::{NdbError, Result};
use crate::event::EventKind;
use crate::handle::{HandleCore, Method};
use crate::schema::{Field, TableSpec};
use crate::types::{RtnlKind, Value};

const NEIGHBOURS: TableSpec = TableSpec {
    table: "neighbours",
    kind: RtnlKind::Neighbour,
    fields: &[
        Field::int("ifindex"),
        Field::int("family"),
        Field::int("state"),
        Field::int("ndm_type"),
        Field::text("NDA_DST"),
        Field::text("NDA_LLADDR"),
    ],
    key: &["ifindex", "NDA_DST"],
    link_column: Some("ifindex"),
};

/// A neighbour cache entry; the neighbour address as shorthand
pub struct Neighbour;

impl Entity for Neighbour {
    const SPEC: &'static TableSpec = &NEIGHBOURS;

    const SUMMARY: Option<Projection> = Some(Projection {
        sql: "SELECT rs.f_target, i.f_IFLA_IFNAME, rs.f_NDA_LLADDR, rs.f_NDA_DST \
              FROM neighbours AS rs \
              INNER JOIN interfaces AS i \
              ON rs.f_ifindex = i.f_index AND rs.f_target = i.f_target \
              ORDER BY rs.f_target, rs.f_ifindex",
        header: &["target", "ifname", "lladdr", "neighbour"],
    });

    fn shorthand(key: Key) -> Result<KeyMap> {
        match key {
            Key::Name(dst) => Ok(KeyMap::from([("NDA_DST".to_string(), Value::Text(dst))])),
            Key::Index(_) => Err(NdbError::InvalidKey {
                table: Self::SPEC.table,
                reason: "neighbours are not addressed by index".to_string(),
            }),
            Key::Fields(fields) => resolve_fields(Self::SPEC, fields),
        }
    }

    fn event_map() -> Vec<(EventKind, Method<Self>)> {
        let on_message: Method<Self> = HandleCore::<Self>::on_message;
        let on_link_removed: Method<Self> = HandleCore::<Self>::on_link_removed;
        vec![
            (EventKind::Neighbour, on_message),
            (EventKind::Link, on_link_removed),
        ]
    }
}
