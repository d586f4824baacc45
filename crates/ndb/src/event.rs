//! Event model and the ordered multi-producer / single-consumer event queue
//!
//! Every target's ingestion thread, the lifecycle manager and caller threads
//! push into one unbounded queue; only the dispatch loop drains it.

use crate::error::{NdbError, Result};
use crate::types::{ChannelError, RtnlKind, RtnlMessage};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Closed set of event kinds; indexes the dispatch table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Link,
    Address,
    Neighbour,
    Route,
    /// In-band protocol error
    Error,
    /// A channel failed outside of the target-gone case
    SourceFailed,
    /// A protocol message the mirror has no table for
    Unsupported,
    /// Readiness sentinel
    Ready,
    /// Shutdown sentinel
    Shutdown,
}

impl EventKind {
    pub const COUNT: usize = 9;

    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::Link,
        EventKind::Address,
        EventKind::Neighbour,
        EventKind::Route,
        EventKind::Error,
        EventKind::SourceFailed,
        EventKind::Unsupported,
        EventKind::Ready,
        EventKind::Shutdown,
    ];

    /// Arena index into the dispatch table
    pub fn index(self) -> usize {
        self as usize
    }
}

impl From<RtnlKind> for EventKind {
    fn from(kind: RtnlKind) -> Self {
        match kind {
            RtnlKind::Link => EventKind::Link,
            RtnlKind::Address => EventKind::Address,
            RtnlKind::Neighbour => EventKind::Neighbour,
            RtnlKind::Route => EventKind::Route,
        }
    }
}

/// One decoded event as delivered to handlers
#[derive(Debug, Clone)]
pub enum Event {
    Message(RtnlMessage),
    Error(ChannelError),
    SourceFailed(ChannelError),
    Unsupported { name: String },
    Ready(Arc<ReadinessBarrier>),
    Shutdown,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Message(msg) => msg.kind.into(),
            Event::Error(_) => EventKind::Error,
            Event::SourceFailed(_) => EventKind::SourceFailed,
            Event::Unsupported { .. } => EventKind::Unsupported,
            Event::Ready(_) => EventKind::Ready,
            Event::Shutdown => EventKind::Shutdown,
        }
    }

    pub fn as_message(&self) -> Option<&RtnlMessage> {
        match self {
            Event::Message(msg) => Some(msg),
            _ => None,
        }
    }

    /// True when the event value is itself an error
    pub fn is_error(&self) -> bool {
        matches!(self, Event::Error(_))
    }

    pub fn is_target_gone(&self) -> bool {
        matches!(self, Event::Error(e) if e.is_target_gone())
    }
}

impl From<RtnlMessage> for Event {
    fn from(msg: RtnlMessage) -> Self {
        Event::Message(msg)
    }
}

/// Single-use readiness flag
///
/// Unset at construction; either set once the engine is ready or failed
/// with the initialization error, which `wait` hands to the blocked caller.
#[derive(Default)]
pub struct ReadinessBarrier {
    state: Mutex<Option<std::result::Result<(), String>>>,
    cv: Condvar,
}

impl ReadinessBarrier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self) {
        self.resolve(Ok(()));
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.resolve(Err(reason.into()));
    }

    fn resolve(&self, outcome: std::result::Result<(), String>) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(outcome);
            self.cv.notify_all();
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(*self.state.lock(), Some(Ok(())))
    }

    /// Block until the barrier is resolved
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.is_none() {
            self.cv.wait(&mut state);
        }
        match state.as_ref() {
            Some(Err(reason)) => Err(NdbError::Fatal(reason.clone())),
            _ => Ok(()),
        }
    }

    /// Like `wait`, giving up after `timeout`; returns `Ok(false)` on timeout
    pub fn wait_for(&self, timeout: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        if state.is_none() {
            self.cv.wait_for(&mut state, timeout);
        }
        match state.as_ref() {
            None => Ok(false),
            Some(Ok(())) => Ok(true),
            Some(Err(reason)) => Err(NdbError::Fatal(reason.clone())),
        }
    }
}

impl fmt::Debug for ReadinessBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessBarrier")
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Outcome of one handler invocation other than success
#[derive(Debug)]
pub enum HandlerError {
    /// Control signal: the handler's referent is gone, drop the handler
    Invalidated,
    /// Control signal: leave the dispatch loop
    Shutdown,
    /// Recoverable fault, logged and isolated to this invocation
    Fault(String),
    /// Unrecoverable fault, terminates the dispatch loop
    Fatal(NdbError),
}

impl HandlerError {
    pub fn fault(reason: impl fmt::Display) -> Self {
        HandlerError::Fault(reason.to_string())
    }
}

impl From<NdbError> for HandlerError {
    fn from(err: NdbError) -> Self {
        HandlerError::Fault(err.to_string())
    }
}

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Type-erased handler callable: `(target, event)`
pub type HandlerFn = Box<dyn FnMut(&str, &Event) -> HandlerResult + Send>;

/// Identifier of a live handle; never reused within a process
pub type HandleId = u64;

/// Request to add handlers to the event map, applied on the dispatch thread
pub struct Registration {
    /// Owning handle and its liveness token; `None` for free-standing handlers
    pub owner: Option<(HandleId, Weak<dyn Any + Send + Sync>)>,
    pub handlers: Vec<(EventKind, HandlerFn)>,
    /// Run once after the handlers are installed
    pub on_installed: Option<Box<dyn FnOnce() + Send>>,
}

/// Handler-map and registry counters reported by the dispatch loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub handlers: BTreeMap<EventKind, usize>,
    pub tracked_handles: usize,
    pub events_dispatched: u64,
    pub handler_faults: u64,
    pub handlers_invalidated: u64,
}

impl DispatchStats {
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).copied().unwrap_or(0)
    }
}

/// Everything the dispatch loop can receive
pub enum Envelope {
    Batch { target: String, events: Vec<Event> },
    Register(Registration),
    Dispose(HandleId),
    Collect(SyncSender<DispatchStats>),
    Stats(SyncSender<DispatchStats>),
    Resync(Arc<ReadinessBarrier>),
}

/// Producer side of the event queue
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Consumer side of the event queue, owned by the dispatch loop
pub struct EventInbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

/// Create a connected queue/inbox pair
pub fn channel() -> (EventQueue, EventInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventQueue { tx }, EventInbox { rx })
}

impl EventQueue {
    /// Push one batch tagged with its target
    pub fn push(&self, target: impl Into<String>, events: Vec<Event>) -> Result<()> {
        self.send(Envelope::Batch {
            target: target.into(),
            events,
        })
    }

    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx.send(envelope).map_err(|_| NdbError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl EventInbox {
    /// Block until the next envelope; `None` once every producer is gone
    pub fn recv(&mut self) -> Option<Envelope> {
        self.rx.blocking_recv()
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Refuse further sends; already queued envelopes stay readable
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Action;

    #[test]
    fn test_event_kind_index_is_dense() {
        for (i, kind) in EventKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn test_event_kind_of_message() {
        let ev = Event::from(RtnlMessage::new(RtnlKind::Route, Action::Del));
        assert_eq!(ev.kind(), EventKind::Route);
        assert!(!ev.is_error());
    }

    #[test]
    fn test_target_gone_event() {
        assert!(Event::Error(ChannelError::target_gone()).is_target_gone());
        assert!(!Event::SourceFailed(ChannelError::target_gone()).is_target_gone());
    }

    #[test]
    fn test_barrier_set_once() {
        let barrier = ReadinessBarrier::new();
        barrier.set();
        barrier.fail("late");
        assert!(barrier.is_set());
        assert!(barrier.wait().is_ok());
    }

    #[test]
    fn test_barrier_failure_reaches_waiter() {
        let barrier = ReadinessBarrier::new();
        let waiter = {
            let barrier = barrier.clone();
            std::thread::spawn(move || barrier.wait())
        };
        barrier.fail("store open failed");
        let outcome = waiter.join().unwrap();
        assert!(matches!(outcome, Err(NdbError::Fatal(ref r)) if r == "store open failed"));
    }

    #[test]
    fn test_barrier_wait_for_timeout() {
        let barrier = ReadinessBarrier::new();
        assert!(!barrier.wait_for(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_queue_preserves_order() {
        let (queue, mut inbox) = channel();
        for i in 0..3u32 {
            let msg = RtnlMessage::new(RtnlKind::Link, Action::New).with("index", i);
            queue.push("a", vec![msg.into()]).unwrap();
        }
        let mut seen = Vec::new();
        while let Some(Envelope::Batch { events, .. }) = inbox.try_recv() {
            let idx = events[0].as_message().unwrap().get("index").cloned();
            seen.push(idx.and_then(|v| v.as_i64()).unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_queue_closed_after_inbox_drop() {
        let (queue, inbox) = channel();
        drop(inbox);
        assert!(queue.is_closed());
        assert!(matches!(queue.push("a", vec![]), Err(NdbError::Closed)));
    }
}
