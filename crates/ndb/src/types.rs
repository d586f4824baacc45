//! Core types shared by channels, the dispatch loop and the store
//!
//! NIST 800-53 Rev5 [CM-8]: System Component Inventory - Mirrored network objects

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the target used when no targets are configured
pub const DEFAULT_TARGET: &str = "localhost";

/// Kernel errno reported when a target's network stack went away
pub const ECONNRESET: i32 = 104;

/// A single column value, as stored and as carried in protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Real(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One result row; header rows carry `Value::Text` column names
pub type Row = Vec<Value>;

/// Kind of mirrored rtnetlink object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RtnlKind {
    Link,
    Address,
    Neighbour,
    Route,
}

impl RtnlKind {
    /// Order in which initial dumps are requested from every target
    pub const SEED_ORDER: [RtnlKind; 4] = [
        RtnlKind::Link,
        RtnlKind::Address,
        RtnlKind::Neighbour,
        RtnlKind::Route,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RtnlKind::Link => "link",
            RtnlKind::Address => "address",
            RtnlKind::Neighbour => "neighbour",
            RtnlKind::Route => "route",
        }
    }
}

/// Whether a message announces or withdraws an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// RTM_NEW* (also dump responses)
    New,
    /// RTM_DEL*
    Del,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::New => "new",
            Action::Del => "del",
        }
    }
}

/// A decoded rtnetlink message
///
/// Field names are raw protocol names: header fields in lower case
/// (`index`, `prefixlen`) and attributes by their NLA name (`IFLA_IFNAME`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtnlMessage {
    pub kind: RtnlKind,
    pub action: Action,
    pub fields: BTreeMap<String, Value>,
}

impl RtnlMessage {
    pub fn new(kind: RtnlKind, action: Action) -> Self {
        Self {
            kind,
            action,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter; `Value::Null` values are skipped
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        if !value.is_null() {
            self.fields.insert(name.to_string(), value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// An error reported by a channel, in-band or out-of-band
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelError {
    /// Positive errno, 0 when not applicable
    pub code: i32,
    pub message: String,
}

impl ChannelError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The target's network stack disappeared (namespace removed)
    pub fn target_gone() -> Self {
        Self::new(ECONNRESET, "target gone")
    }

    pub fn is_target_gone(&self) -> bool {
        self.code == ECONNRESET
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno {})", self.message, self.code)
    }
}

/// Convert a raw protocol field name into its short display name
///
/// `IFLA_IFNAME` -> `ifname`, `RTA_DST` -> `dst`, header names pass through.
pub fn nla2name(name: &str) -> String {
    match name.split_once('_') {
        Some((prefix, rest))
            if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_uppercase()) =>
        {
            rest.to_ascii_lowercase()
        }
        _ => name.to_string(),
    }
}
