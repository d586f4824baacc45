//! (Re)initialization of targets, store and seed state
//!
//! Runs on the dispatch thread while the caller that asked for it holds the
//! engine's lock. Seed batches are queued strictly before any
//! ingestion thread starts, so every target's dump precedes its incremental
//! events in the queue.

use crate::channel::{Channel, ChannelOptions, Targets};
use crate::config::NdbConfig;
use crate::engine::Shared;
use crate::entity::TABLES;
use crate::error::Result;
use crate::event::{Event, ReadinessBarrier};
use crate::schema::Schema;
use crate::source::SourceThread;
use crate::store::{self, Store};
use crate::types::RtnlKind;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Target name carried by batches the engine queues for itself
pub const CONTROL_TARGET: &str = "ndb";

pub struct Lifecycle {
    config: NdbConfig,
    targets: Targets,
    shared: Arc<Shared>,
}

impl Lifecycle {
    pub fn new(config: NdbConfig, targets: Targets, shared: Arc<Shared>) -> Self {
        Self {
            config,
            targets,
            shared,
        }
    }

    pub fn config(&self) -> &NdbConfig {
        &self.config
    }

    /// Bring targets, store and schema up and queue the readiness sentinel
    #[instrument(skip_all)]
    pub fn initialize(
        &self,
        schema: &mut Option<Schema>,
        barrier: &Arc<ReadinessBarrier>,
    ) -> Result<()> {
        self.shared.stop_sources();
        self.shared.clear_failures();

        let options = ChannelOptions {
            recv_timeout: self.config.recv_timeout(),
        };
        let mut channels: Vec<(String, Box<dyn Channel>)> = Vec::new();
        for (name, source) in self.targets.resolve() {
            info!(target = %name, source = %source.describe(), "Opening channel");
            channels.push((name, source.open(&options)?));
        }

        self.bind_store(schema)?;

        for (name, channel) in channels.iter_mut() {
            for kind in RtnlKind::SEED_ORDER {
                let events = channel.dump(kind)?;
                debug!(target = %name, kind = kind.as_str(), events = events.len(), "Seed dump");
                self.shared.queue.push(name.as_str(), events)?;
            }
        }

        // registered one by one so a failed spawn leaves the rest stoppable
        for (name, channel) in channels {
            let thread = SourceThread::spawn(name, channel, self.shared.queue.clone())?;
            self.shared.add_source(thread);
        }
        info!(targets = self.shared.source_count(), "Ingestion threads started");

        self.shared
            .queue
            .push(CONTROL_TARGET, vec![Event::Ready(barrier.clone())])
    }

    /// Open a fresh store, recreate the tables there, then retire the old one
    fn bind_store(&self, schema: &mut Option<Schema>) -> Result<()> {
        let store = store::open(&self.config.store)?;
        let bound = match schema.take() {
            Some(mut existing) => existing.rebind(store.clone()).map(|_| existing),
            None => Schema::new(store.clone(), TABLES, self.config.verbose_protocol_log),
        };
        match bound {
            Ok(bound) => *schema = Some(bound),
            Err(e) => {
                let _ = store.close();
                return Err(e);
            }
        }

        if let Some(old) = self.shared.replace_store(Some(store)) {
            retire(old.as_ref());
        }
        Ok(())
    }
}

fn retire(store: &dyn Store) {
    if let Err(e) = store.commit().and_then(|_| store.close()) {
        warn!(error = %e, "Failed to close previous store");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemorySource;
    use crate::event::{self, Envelope, EventInbox};
    use crate::types::{Action, RtnlMessage};
    use std::time::{Duration, Instant};

    fn lifecycle(source: &MemorySource) -> (Lifecycle, Arc<Shared>, EventInbox) {
        lifecycle_over(Targets::single(source.clone()))
    }

    fn lifecycle_over(targets: Targets) -> (Lifecycle, Arc<Shared>, EventInbox) {
        let (queue, inbox) = event::channel();
        let shared = Arc::new(Shared::new(queue));
        let config = NdbConfig {
            recv_timeout_ms: 10,
            ..NdbConfig::default()
        };
        let lifecycle = Lifecycle::new(config, targets, shared.clone());
        (lifecycle, shared, inbox)
    }

    fn link(index: u32) -> RtnlMessage {
        RtnlMessage::new(RtnlKind::Link, Action::New).with("index", index)
    }

    /// Drain batches until the readiness sentinel and `extra` more arrived
    fn drain(inbox: &mut EventInbox, extra: usize) -> Vec<(String, Vec<Event>)> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut batches = Vec::new();
        let mut ready_seen = false;
        while Instant::now() < deadline {
            match inbox.try_recv() {
                Some(Envelope::Batch { target, events }) => {
                    ready_seen |= events.iter().any(|e| matches!(e, Event::Ready(_)));
                    batches.push((target, events));
                }
                Some(_) => {}
                None => std::thread::sleep(Duration::from_millis(5)),
            }
            let incremental = batches
                .iter()
                .filter(|(t, e)| {
                    t != CONTROL_TARGET && e.len() == 1 && e[0].as_message().is_some()
                })
                .count();
            if ready_seen && incremental >= extra {
                break;
            }
        }
        batches
    }

    #[test]
    fn test_seeds_precede_incremental_events() {
        let source = MemorySource::new();
        source.seed(RtnlKind::Link, vec![link(1), link(2)]);
        source.push_messages(vec![link(3)]);
        let (lifecycle, shared, mut inbox) = lifecycle(&source);

        let mut schema = None;
        let barrier = ReadinessBarrier::new();
        lifecycle.initialize(&mut schema, &barrier).unwrap();
        assert!(schema.is_some());
        assert!(shared.reader().is_ok());

        let batches = drain(&mut inbox, 1);
        let kinds: Vec<usize> = batches[..4].iter().map(|(_, e)| e.len()).collect();
        assert_eq!(kinds, vec![2, 0, 0, 0]);
        let incremental = batches
            .iter()
            .position(|(_, e)| e.len() == 1 && e[0].as_message().is_some())
            .unwrap();
        assert!(incremental >= 4);

        shared.stop_sources();
    }

    #[test]
    fn test_every_target_seeds_before_any_incremental_event() {
        let a = MemorySource::new();
        let b = MemorySource::new();
        a.seed(RtnlKind::Link, vec![link(1), link(2)]);
        b.seed(RtnlKind::Link, vec![link(1), link(2)]);
        // queued before initialization, so both threads forward them at once
        a.push_messages(vec![link(101)]);
        b.push_messages(vec![link(102)]);
        let (lifecycle, shared, mut inbox) =
            lifecycle_over(Targets::map().with("a", a.clone()).with("b", b.clone()));

        let mut schema = None;
        lifecycle.initialize(&mut schema, &ReadinessBarrier::new()).unwrap();
        assert_eq!(shared.source_count(), 2);

        let batches = drain(&mut inbox, 2);
        let is_seed = |(target, events): &(String, Vec<Event>)| {
            target != CONTROL_TARGET && events.len() != 1
        };
        let is_incremental = |(_, events): &(String, Vec<Event>)| {
            events.len() == 1
                && events[0]
                    .as_message()
                    .and_then(|m| m.get("index"))
                    .and_then(|v| v.as_i64())
                    .is_some_and(|index| index > 100)
        };
        let seeds: Vec<usize> = batches
            .iter()
            .enumerate()
            .filter(|(_, b)| is_seed(*b))
            .map(|(i, _)| i)
            .collect();
        let incremental: Vec<usize> = batches
            .iter()
            .enumerate()
            .filter(|(_, b)| is_incremental(*b))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(seeds.len(), 8);
        assert_eq!(incremental.len(), 2);
        assert!(seeds.iter().max() < incremental.iter().min());

        shared.stop_sources();
    }

    #[test]
    fn test_reinitialize_rebinds_schema() {
        let source = MemorySource::new();
        let (lifecycle, shared, _inbox) = lifecycle(&source);
        let mut schema = None;
        lifecycle.initialize(&mut schema, &ReadinessBarrier::new()).unwrap();
        lifecycle.initialize(&mut schema, &ReadinessBarrier::new()).unwrap();
        assert_eq!(source.opened(), 2);
        assert_eq!(shared.source_count(), 1);
        shared.stop_sources();
    }

    #[test]
    fn test_dump_failure_propagates() {
        let source = MemorySource::new();
        source.fail_dumps("permission denied");
        let (lifecycle, shared, _inbox) = lifecycle(&source);
        let mut schema = None;
        assert!(lifecycle.initialize(&mut schema, &ReadinessBarrier::new()).is_err());
        assert_eq!(shared.source_count(), 0);
    }
}
