//! sonic-ndb - Network State Database
//!
//! Mirrors kernel network state (interfaces, addresses, neighbours and
//! routes) from one or more rtnetlink targets into a relational store and
//! keeps it current from the live event stream. Readers query the store
//! directly or hold live handles that refresh whenever their row changes.
//!
//! # NIST 800-53 Rev5 Control Mappings
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | CM-8 | System Component Inventory | Interface and address tables |
//! | SI-4 | System Monitoring | Live rtnetlink event ingestion |
//! | SC-7 | Boundary Protection | Route and neighbour tables per target |
//! | AU-3 | Content of Audit Records | Optional protocol log table |
//! | AU-12 | Audit Record Generation | Structured tracing on every transition |
//! | SI-11 | Error Handling | Handler faults isolated per invocation |
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │ target: host │   │ target: ns1  │   rtnetlink channels
//! └──────┬───────┘   └──────┬───────┘
//!        │ ingestion        │ ingestion
//!        ▼                  ▼
//! ┌─────────────────────────────────┐
//! │           event queue           │   (target, events) batches
//! └────────────────┬────────────────┘
//!                  ▼
//! ┌─────────────────────────────────┐
//! │  dispatch thread (sole writer)  │──▶ handlers, live handles
//! └────────────────┬────────────────┘
//!                  ▼
//! ┌─────────────────────────────────┐
//! │ SQLite / PostgreSQL store       │◀── views, dumps, CSV
//! └─────────────────────────────────┘
//! ```

pub mod channel;
pub mod config;
pub mod entity;
pub mod error;
pub mod event;
pub mod handle;
pub mod schema;
pub mod store;
pub mod types;
pub mod view;

mod dispatch;
mod engine;
mod lifecycle;
mod registry;
mod source;

pub use channel::{
    Channel, ChannelOptions, ChannelSource, Interrupt, MemorySource, RtnlSource, Targets,
};
pub use config::{NdbConfig, StoreBackend, StoreConfig, TargetSpec};
pub use engine::Engine;
pub use entity::{Address, Entity, Interface, Key, KeyMap, Neighbour, Route};
pub use error::{NdbError, Result};
pub use event::{DispatchStats, Event, EventKind, HandlerError, HandlerResult, ReadinessBarrier};
pub use handle::{Handle, Record};
pub use store::{Store, StoreReader};
pub use types::{Action, ChannelError, Row, RtnlKind, RtnlMessage, Value};
pub use view::{Csv, Dump, View, csv_line};
