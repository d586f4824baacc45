//! The dispatch loop: sole consumer of the event queue and sole store writer
//!
//! States: initializing (run the lifecycle manager, build the base event
//! map), running (dequeue, dispatch, sweep) and terminated. Handler outcomes
//! other than success are control signals (invalidate, shutdown) or faults;
//! faults are logged and isolated to the invocation that raised them.

use crate::engine::Shared;
use crate::error::{NdbError, Result};
use crate::event::{
    DispatchStats, Envelope, Event, EventInbox, EventKind, HandleId, HandlerError, HandlerFn,
    HandlerResult, ReadinessBarrier, Registration,
};
use crate::lifecycle::Lifecycle;
use crate::registry::Registry;
use crate::schema::Schema;
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What a handler slot invokes
pub enum Binding {
    /// Apply the message to the store
    Schema,
    /// Release the readiness barrier carried by the event
    Ready,
    /// Leave the loop
    Shutdown,
    /// Record a failed target
    SourceFailure,
    Callback(HandlerFn),
}

struct Slot {
    owner: Option<HandleId>,
    binding: Binding,
}

/// Event kind to ordered handler list, indexed by [`EventKind::index`]
#[derive(Default)]
pub struct EventMap {
    slots: [Vec<Slot>; EventKind::COUNT],
}

impl EventMap {
    /// Built-in handlers present from the start of the running state
    pub fn base() -> Self {
        let mut map = Self::default();
        for kind in [
            EventKind::Link,
            EventKind::Address,
            EventKind::Neighbour,
            EventKind::Route,
        ] {
            map.push(kind, None, Binding::Schema);
        }
        map.push(EventKind::Ready, None, Binding::Ready);
        map.push(EventKind::Shutdown, None, Binding::Shutdown);
        map.push(EventKind::SourceFailed, None, Binding::SourceFailure);
        map
    }

    pub fn push(&mut self, kind: EventKind, owner: Option<HandleId>, binding: Binding) {
        self.slots[kind.index()].push(Slot { owner, binding });
    }

    pub fn len(&self, kind: EventKind) -> usize {
        self.slots[kind.index()].len()
    }

    fn take(&mut self, kind: EventKind) -> Vec<Slot> {
        std::mem::take(&mut self.slots[kind.index()])
    }

    fn restore(&mut self, kind: EventKind, slots: Vec<Slot>) {
        self.slots[kind.index()] = slots;
    }

    /// Remove every handler owned by one of `owners`; returns how many
    pub fn remove_owners(&mut self, owners: &HashSet<HandleId>) -> usize {
        let mut removed = 0;
        for list in self.slots.iter_mut() {
            let before = list.len();
            list.retain(|slot| slot.owner.is_none_or(|id| !owners.contains(&id)));
            removed += before - list.len();
        }
        removed
    }

    /// Release memory held by emptied handler lists
    pub fn compact(&mut self) {
        for list in self.slots.iter_mut() {
            list.shrink_to_fit();
        }
    }

    pub fn counts(&self) -> BTreeMap<EventKind, usize> {
        EventKind::ALL
            .iter()
            .map(|kind| (*kind, self.len(*kind)))
            .collect()
    }
}

enum Flow {
    Continue,
    Shutdown,
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    inbox: EventInbox,
    lifecycle: Lifecycle,
    schema: Option<Schema>,
    map: EventMap,
    registry: Registry,
    gc_interval: Duration,
    last_sweep: Instant,
    /// Barrier of the initialization whose sentinel is still queued
    pending_ready: Option<Arc<ReadinessBarrier>>,
    events_dispatched: u64,
    handler_faults: u64,
    handlers_invalidated: u64,
}

impl Dispatcher {
    pub fn new(shared: Arc<Shared>, inbox: EventInbox, lifecycle: Lifecycle) -> Self {
        let gc_interval = lifecycle.config().gc_interval();
        Self {
            shared,
            inbox,
            lifecycle,
            schema: None,
            map: EventMap::default(),
            registry: Registry::new(),
            gc_interval,
            last_sweep: Instant::now(),
            pending_ready: None,
            events_dispatched: 0,
            handler_faults: 0,
            handlers_invalidated: 0,
        }
    }

    /// Body of the dispatch thread
    pub fn run(mut self, barrier: Arc<ReadinessBarrier>) -> Result<()> {
        let outcome = self.serve(barrier);
        if let Err(e) = &outcome {
            error!(error = %e, "Dispatch loop terminated");
            self.shared.set_fatal(e.to_string());
        }
        self.terminate(&outcome);
        outcome
    }

    fn serve(&mut self, barrier: Arc<ReadinessBarrier>) -> Result<()> {
        self.initialize(barrier)?;
        self.map = EventMap::base();
        info!("Dispatch loop running");

        while let Some(envelope) = self.inbox.recv() {
            if let Flow::Shutdown = self.handle(envelope)? {
                info!("Dispatch loop shut down");
                return Ok(());
            }
        }
        Ok(())
    }

    fn initialize(&mut self, barrier: Arc<ReadinessBarrier>) -> Result<()> {
        self.pending_ready = Some(barrier.clone());
        self.lifecycle.initialize(&mut self.schema, &barrier)
    }

    /// Release everybody still waiting on this loop
    fn terminate(&mut self, outcome: &Result<()>) {
        let reason = match outcome {
            Ok(()) => NdbError::Closed.to_string(),
            Err(e) => e.to_string(),
        };
        if let Some(barrier) = self.pending_ready.take() {
            barrier.fail(reason.clone());
        }
        self.inbox.close();
        while let Some(envelope) = self.inbox.try_recv() {
            // dropping reply senders wakes their waiters with an error
            if let Envelope::Resync(barrier) = envelope {
                barrier.fail(reason.clone());
            }
        }
        self.shared.stop_sources();
    }

    fn handle(&mut self, envelope: Envelope) -> Result<Flow> {
        match envelope {
            Envelope::Batch { target, events } => {
                for event in &events {
                    if let Flow::Shutdown = self.dispatch(&target, event)? {
                        return Ok(Flow::Shutdown);
                    }
                    if self.last_sweep.elapsed() >= self.gc_interval {
                        self.sweep();
                    }
                }
            }
            Envelope::Register(registration) => self.register(registration),
            Envelope::Dispose(id) => self.dispose(id),
            Envelope::Collect(reply) => {
                self.sweep();
                let _ = reply.send(self.stats());
            }
            Envelope::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Envelope::Resync(barrier) => {
                info!("Resynchronizing");
                self.initialize(barrier)?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Run every handler registered for the event's kind, in order
    fn dispatch(&mut self, target: &str, event: &Event) -> Result<Flow> {
        self.events_dispatched += 1;
        let kind = event.kind();
        if self.map.len(kind) == 0 {
            return self.default_handler(target, event);
        }

        let slots = self.map.take(kind);
        let mut kept = Vec::with_capacity(slots.len());
        let mut rest = slots.into_iter();
        let mut flow = Ok(Flow::Continue);

        while let Some(mut slot) = rest.next() {
            match self.invoke(&mut slot.binding, target, event) {
                Ok(()) => kept.push(slot),
                Err(HandlerError::Invalidated) => {
                    self.handlers_invalidated += 1;
                    debug!(kind = ?kind, owner = ?slot.owner, "Handler invalidated");
                }
                Err(HandlerError::Shutdown) => {
                    kept.push(slot);
                    flow = Ok(Flow::Shutdown);
                    break;
                }
                Err(HandlerError::Fault(reason)) => {
                    self.handler_faults += 1;
                    error!(kind = ?kind, target = %target, error = %reason, "Handler failed");
                    kept.push(slot);
                }
                Err(HandlerError::Fatal(e)) => {
                    kept.push(slot);
                    flow = Err(e);
                    break;
                }
            }
        }

        kept.extend(rest);
        self.map.restore(kind, kept);
        flow
    }

    fn invoke(&mut self, binding: &mut Binding, target: &str, event: &Event) -> HandlerResult {
        match binding {
            Binding::Schema => self.apply(target, event),
            Binding::Ready => {
                if let Event::Ready(barrier) = event {
                    info!("Engine ready");
                    barrier.set();
                    self.pending_ready = None;
                }
                Ok(())
            }
            Binding::Shutdown => Err(HandlerError::Shutdown),
            Binding::SourceFailure => {
                if let Event::SourceFailed(err) = event {
                    warn!(target = %target, error = %err, "Target failed");
                    self.shared.record_failure(target, err.clone());
                }
                Ok(())
            }
            Binding::Callback(handler) => {
                match panic::catch_unwind(AssertUnwindSafe(|| handler(target, event))) {
                    Ok(outcome) => outcome,
                    Err(payload) => Err(HandlerError::Fault(panic_message(payload.as_ref()))),
                }
            }
        }
    }

    fn apply(&mut self, target: &str, event: &Event) -> HandlerResult {
        let Some(msg) = event.as_message() else {
            return Ok(());
        };
        let schema = self
            .schema
            .as_mut()
            .ok_or_else(|| HandlerError::Fatal(NdbError::Fatal("schema not bound".to_string())))?;
        schema.apply(target, msg)?;
        Ok(())
    }

    fn default_handler(&mut self, target: &str, event: &Event) -> Result<Flow> {
        match event {
            Event::Error(err) => Err(NdbError::Fatal(format!(
                "unhandled error event from {}: {}",
                target, err
            ))),
            other => {
                warn!(target = %target, kind = ?other.kind(), "Unsupported event dropped");
                Ok(Flow::Continue)
            }
        }
    }

    fn register(&mut self, registration: Registration) {
        let Registration {
            owner,
            handlers,
            on_installed,
        } = registration;

        let owner_id = match owner {
            Some((id, token)) => {
                if token.strong_count() == 0 {
                    // the handle was dropped before its registration arrived
                    return;
                }
                self.registry.insert(id, token);
                Some(id)
            }
            None => None,
        };
        for (kind, handler) in handlers {
            self.map.push(kind, owner_id, Binding::Callback(handler));
        }
        if let Some(on_installed) = on_installed {
            on_installed();
        }
    }

    fn dispose(&mut self, id: HandleId) {
        if self.registry.remove(id) {
            let removed = self.map.remove_owners(&HashSet::from([id]));
            debug!(handle = id, removed, "Handle disposed");
        }
    }

    /// Drop registry entries of vanished handles and compact the event map
    fn sweep(&mut self) {
        let dead: HashSet<HandleId> = self.registry.sweep().into_iter().collect();
        let removed = self.map.remove_owners(&dead);
        self.map.compact();
        self.last_sweep = Instant::now();
        if !dead.is_empty() {
            debug!(handles = dead.len(), handlers = removed, "Swept stale handles");
        }
    }

    fn stats(&self) -> DispatchStats {
        DispatchStats {
            handlers: self.map.counts(),
            tracked_handles: self.registry.len(),
            events_dispatched: self.events_dispatched,
            handler_faults: self.handler_faults,
            handlers_invalidated: self.handlers_invalidated,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemorySource, Targets};
    use crate::config::NdbConfig;
    use crate::event;
    use crate::types::ChannelError;
    use parking_lot::Mutex;

    fn dispatcher() -> Dispatcher {
        let (queue, inbox) = event::channel();
        let shared = Arc::new(Shared::new(queue));
        let lifecycle = Lifecycle::new(
            NdbConfig::default(),
            Targets::single(MemorySource::new()),
            shared.clone(),
        );
        let mut dispatcher = Dispatcher::new(shared, inbox, lifecycle);
        dispatcher.map = EventMap::base();
        dispatcher
    }

    fn callback(f: impl FnMut(&str, &Event) -> HandlerResult + Send + 'static) -> Binding {
        Binding::Callback(Box::new(f))
    }

    fn unsupported() -> Event {
        Event::Unsupported {
            name: "GetLink".to_string(),
        }
    }

    #[test]
    fn test_base_map() {
        let map = EventMap::base();
        assert_eq!(map.len(EventKind::Link), 1);
        assert_eq!(map.len(EventKind::Shutdown), 1);
        assert_eq!(map.len(EventKind::Error), 0);
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let mut d = dispatcher();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            d.map.push(
                EventKind::Unsupported,
                None,
                callback(move |_, _| {
                    seen.lock().push(tag);
                    Ok(())
                }),
            );
        }
        d.dispatch("localhost", &unsupported()).unwrap();
        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_fault_is_isolated() {
        let mut d = dispatcher();
        let calls = Arc::new(Mutex::new(0));
        d.map.push(
            EventKind::Unsupported,
            None,
            callback(|_, _| Err(HandlerError::fault("boom"))),
        );
        d.map
            .push(EventKind::Unsupported, None, callback(|_, _| panic!("kaboom")));
        {
            let calls = calls.clone();
            d.map.push(
                EventKind::Unsupported,
                None,
                callback(move |_, _| {
                    *calls.lock() += 1;
                    Ok(())
                }),
            );
        }
        let event = unsupported();
        assert!(matches!(d.dispatch("localhost", &event), Ok(Flow::Continue)));
        assert!(matches!(d.dispatch("localhost", &event), Ok(Flow::Continue)));
        assert_eq!(*calls.lock(), 2);
        assert_eq!(d.handler_faults, 4);
        assert_eq!(d.map.len(EventKind::Unsupported), 3);
    }

    #[test]
    fn test_invalidated_handler_removed() {
        let mut d = dispatcher();
        let calls = Arc::new(Mutex::new(0));
        {
            let calls = calls.clone();
            d.map.push(
                EventKind::Unsupported,
                None,
                callback(move |_, _| {
                    *calls.lock() += 1;
                    Err(HandlerError::Invalidated)
                }),
            );
        }
        d.map
            .push(EventKind::Unsupported, None, callback(|_, _| Ok(())));
        d.dispatch("localhost", &unsupported()).unwrap();
        d.dispatch("localhost", &unsupported()).unwrap();
        assert_eq!(*calls.lock(), 1);
        assert_eq!(d.map.len(EventKind::Unsupported), 1);
        assert_eq!(d.handlers_invalidated, 1);
    }

    #[test]
    fn test_binding_of_dropped_handle_removed_on_first_event() {
        use crate::entity::{Interface, KeyMap};
        use crate::handle::Handle;
        use crate::types::{Action, RtnlKind, RtnlMessage, Value};

        let mut d = dispatcher();
        d.initialize(ReadinessBarrier::new()).unwrap();
        d.shared.stop_sources();

        let key = KeyMap::from([("index".to_string(), Value::Integer(7))]);
        let handle = Handle::<Interface>::register(d.shared.clone(), key).unwrap();
        let registration = loop {
            match d.inbox.try_recv() {
                Some(Envelope::Register(registration)) => break registration,
                Some(_) => continue,
                None => panic!("registration not queued"),
            }
        };
        let id = handle.id();
        drop(handle);

        // installed directly, as if the dispose message had not arrived yet
        let before = d.map.len(EventKind::Link);
        for (kind, handler) in registration.handlers {
            d.map.push(kind, Some(id), Binding::Callback(handler));
        }
        assert_eq!(d.map.len(EventKind::Link), before + 1);

        let msg = RtnlMessage::new(RtnlKind::Link, Action::New).with("index", 7u32);
        d.dispatch("localhost", &Event::from(msg)).unwrap();
        assert_eq!(d.map.len(EventKind::Link), before);
        assert_eq!(d.handlers_invalidated, 1);
        assert_eq!(d.handler_faults, 0);
    }

    #[test]
    fn test_unhandled_error_is_fatal() {
        let mut d = dispatcher();
        let event = Event::Error(ChannelError::new(1, "EPERM"));
        assert!(matches!(
            d.dispatch("localhost", &event),
            Err(NdbError::Fatal(_))
        ));
    }

    #[test]
    fn test_unsupported_event_dropped() {
        let mut d = dispatcher();
        assert!(matches!(
            d.dispatch("localhost", &unsupported()),
            Ok(Flow::Continue)
        ));
    }

    #[test]
    fn test_shutdown_flow() {
        let mut d = dispatcher();
        assert!(matches!(
            d.dispatch("ndb", &Event::Shutdown),
            Ok(Flow::Shutdown)
        ));
        assert_eq!(d.map.len(EventKind::Shutdown), 1);
    }

    #[test]
    fn test_source_failure_recorded() {
        let mut d = dispatcher();
        let event = Event::SourceFailed(ChannelError::new(0, "socket closed"));
        d.dispatch("ns0", &event).unwrap();
        assert!(d.shared.failed_targets().contains_key("ns0"));
    }

    #[test]
    fn test_remove_owners() {
        let mut map = EventMap::base();
        map.push(EventKind::Link, Some(7), callback(|_, _| Ok(())));
        map.push(EventKind::Route, Some(7), callback(|_, _| Ok(())));
        map.push(EventKind::Route, Some(8), callback(|_, _| Ok(())));
        assert_eq!(map.remove_owners(&HashSet::from([7])), 2);
        assert_eq!(map.len(EventKind::Link), 1);
        assert_eq!(map.len(EventKind::Route), 2);
    }
}
