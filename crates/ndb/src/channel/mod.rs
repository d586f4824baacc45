//! Protocol channels: where targets' events come from
//!
//! A [`ChannelSource`] is the configured, reusable description of a target;
//! every (re)initialization opens a fresh [`Channel`] from it. The channel is
//! then moved into that target's ingestion thread.

pub mod memory;
pub mod rtnl;

use crate::config::TargetSpec;
use crate::error::Result;
use crate::event::Event;
use crate::types::{DEFAULT_TARGET, RtnlKind};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use memory::MemorySource;
pub use rtnl::RtnlSource;

/// Options applied to every channel opened by the lifecycle manager
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    /// Upper bound on a single blocking read
    pub recv_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_millis(300),
        }
    }
}

/// Wakes a channel's blocked [`Channel::recv`] from another thread
pub type Interrupt = Box<dyn Fn() + Send + Sync>;

/// An open protocol channel to one target
pub trait Channel: Send {
    /// Full current-state dump of one object kind
    fn dump(&mut self, kind: RtnlKind) -> Result<Vec<Event>>;

    /// One blocking read bounded by the receive timeout
    ///
    /// Returns an empty batch when the wait expired without traffic or the
    /// read was interrupted.
    fn recv(&mut self) -> Result<Vec<Event>>;

    /// Hook that cuts a pending or future `recv` short
    ///
    /// Taken before the channel moves into its ingestion thread. The
    /// default does nothing and leaves shutdown to the receive timeout.
    fn interrupter(&self) -> Interrupt {
        Box::new(|| {})
    }
}

/// Factory for a target's channels
pub trait ChannelSource: Send + Sync {
    fn open(&self, options: &ChannelOptions) -> Result<Box<dyn Channel>>;

    /// Human readable description for logs
    fn describe(&self) -> String;
}

/// The `targets` configuration option
#[derive(Clone, Default)]
pub enum Targets {
    /// One rtnetlink channel to the local stack named `localhost`
    #[default]
    Default,
    /// A single pre-built source, named `localhost`
    Single(Arc<dyn ChannelSource>),
    /// Named sources
    Map(BTreeMap<String, Arc<dyn ChannelSource>>),
}

impl Targets {
    pub fn single(source: impl ChannelSource + 'static) -> Self {
        Targets::Single(Arc::new(source))
    }

    /// Start an empty named map; use [`Targets::with`] to add entries
    pub fn map() -> Self {
        Targets::Map(BTreeMap::new())
    }

    pub fn with(self, name: impl Into<String>, source: impl ChannelSource + 'static) -> Self {
        let mut map = match self {
            Targets::Map(map) => map,
            Targets::Default => BTreeMap::new(),
            Targets::Single(source) => BTreeMap::from([(DEFAULT_TARGET.to_string(), source)]),
        };
        map.insert(name.into(), Arc::new(source));
        Targets::Map(map)
    }

    /// Targets described by the configuration file
    pub fn from_specs(specs: &BTreeMap<String, TargetSpec>) -> Self {
        if specs.is_empty() {
            return Targets::Default;
        }
        let map = specs
            .iter()
            .map(|(name, spec)| {
                let source: Arc<dyn ChannelSource> = match spec {
                    TargetSpec::Local => Arc::new(RtnlSource::local()),
                    TargetSpec::Netns { path } => Arc::new(RtnlSource::netns(path)),
                };
                (name.clone(), source)
            })
            .collect();
        Targets::Map(map)
    }

    /// Resolve into the concrete (name, source) list
    pub fn resolve(&self) -> Vec<(String, Arc<dyn ChannelSource>)> {
        match self {
            Targets::Default => vec![(DEFAULT_TARGET.to_string(), Arc::new(RtnlSource::local()))],
            Targets::Single(source) => vec![(DEFAULT_TARGET.to_string(), source.clone())],
            Targets::Map(map) => map
                .iter()
                .map(|(name, source)| (name.clone(), source.clone()))
                .collect(),
        }
    }
}

impl fmt::Debug for Targets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<(String, String)> = self
            .resolve()
            .into_iter()
            .map(|(name, source)| (name, source.describe()))
            .collect();
        f.debug_tuple("Targets").field(&names).finish()
    }
}
