//! In-process channel for tests, demos and replaying captured state
//!
//! A [`MemorySource`] holds a scripted dump state plus a queue of pending
//! batches. Every channel opened from the same source shares both.

use super::{Channel, ChannelOptions, ChannelSource, Interrupt};
use crate::error::{NdbError, Result};
use crate::event::Event;
use crate::types::{ChannelError, RtnlKind, RtnlMessage};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

enum Pending {
    Batch(Vec<Event>),
    Failure(String),
}

#[derive(Default)]
struct HubState {
    snapshot: HashMap<RtnlKind, Vec<Event>>,
    pending: VecDeque<Pending>,
    opened: usize,
    dump_failure: Option<String>,
}

#[derive(Default)]
struct Hub {
    state: Mutex<HubState>,
    cv: Condvar,
}

/// Scripted target
#[derive(Clone, Default)]
pub struct MemorySource {
    hub: Arc<Hub>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the dump answer for one object kind
    pub fn seed(&self, kind: RtnlKind, messages: Vec<RtnlMessage>) {
        let events = messages.into_iter().map(Event::Message).collect();
        self.hub.state.lock().snapshot.insert(kind, events);
    }

    /// Queue one incremental batch
    pub fn push(&self, events: Vec<Event>) {
        self.enqueue(Pending::Batch(events));
    }

    /// Queue one incremental batch of messages
    pub fn push_messages(&self, messages: Vec<RtnlMessage>) {
        self.push(messages.into_iter().map(Event::Message).collect());
    }

    /// Simulate the target's network stack going away
    pub fn disconnect(&self) {
        self.push(vec![Event::Error(ChannelError::target_gone())]);
    }

    /// Make the next read fail with a channel error
    pub fn fail(&self, reason: impl Into<String>) {
        self.enqueue(Pending::Failure(reason.into()));
    }

    /// Make every following dump fail
    pub fn fail_dumps(&self, reason: impl Into<String>) {
        self.hub.state.lock().dump_failure = Some(reason.into());
    }

    /// Number of channels opened so far
    pub fn opened(&self) -> usize {
        self.hub.state.lock().opened
    }

    /// Batches not yet read by any channel
    pub fn pending(&self) -> usize {
        self.hub.state.lock().pending.len()
    }

    fn enqueue(&self, item: Pending) {
        self.hub.state.lock().pending.push_back(item);
        self.hub.cv.notify_all();
    }
}

impl ChannelSource for MemorySource {
    fn open(&self, options: &ChannelOptions) -> Result<Box<dyn Channel>> {
        self.hub.state.lock().opened += 1;
        Ok(Box::new(MemoryChannel {
            hub: self.hub.clone(),
            timeout: options.recv_timeout,
            interrupted: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryChannel {
    hub: Arc<Hub>,
    timeout: Duration,
    interrupted: Arc<AtomicBool>,
}

impl Channel for MemoryChannel {
    fn dump(&mut self, kind: RtnlKind) -> Result<Vec<Event>> {
        let state = self.hub.state.lock();
        if let Some(reason) = &state.dump_failure {
            return Err(NdbError::Netlink(reason.clone()));
        }
        Ok(state.snapshot.get(&kind).cloned().unwrap_or_default())
    }

    fn recv(&mut self) -> Result<Vec<Event>> {
        let mut state = self.hub.state.lock();
        if state.pending.is_empty() && !self.interrupted.load(Ordering::Acquire) {
            self.hub.cv.wait_for(&mut state, self.timeout);
        }
        // an interrupted channel leaves pending batches to the next one opened
        if self.interrupted.load(Ordering::Acquire) {
            return Ok(Vec::new());
        }
        match state.pending.pop_front() {
            None => Ok(Vec::new()),
            Some(Pending::Batch(events)) => Ok(events),
            Some(Pending::Failure(reason)) => Err(NdbError::Netlink(reason)),
        }
    }

    fn interrupter(&self) -> Interrupt {
        let hub = self.hub.clone();
        let interrupted = self.interrupted.clone();
        Box::new(move || {
            // under the hub lock so a reader about to wait cannot miss it
            let _state = hub.state.lock();
            interrupted.store(true, Ordering::Release);
            hub.cv.notify_all();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Action;

    fn link(index: u32) -> RtnlMessage {
        RtnlMessage::new(RtnlKind::Link, Action::New).with("index", index)
    }

    fn options() -> ChannelOptions {
        ChannelOptions {
            recv_timeout: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_dump_returns_seeded_state() {
        let source = MemorySource::new();
        source.seed(RtnlKind::Link, vec![link(1), link(2)]);
        let mut channel = source.open(&options()).unwrap();
        assert_eq!(channel.dump(RtnlKind::Link).unwrap().len(), 2);
        assert!(channel.dump(RtnlKind::Route).unwrap().is_empty());
        assert_eq!(source.opened(), 1);
    }

    #[test]
    fn test_recv_times_out_with_empty_batch() {
        let source = MemorySource::new();
        let mut channel = source.open(&options()).unwrap();
        assert!(channel.recv().unwrap().is_empty());
    }

    #[test]
    fn test_recv_in_push_order() {
        let source = MemorySource::new();
        let mut channel = source.open(&options()).unwrap();
        source.push_messages(vec![link(1)]);
        source.disconnect();
        assert!(channel.recv().unwrap()[0].as_message().is_some());
        assert!(channel.recv().unwrap()[0].is_target_gone());
        assert_eq!(source.pending(), 0);
    }

    #[test]
    fn test_failures() {
        let source = MemorySource::new();
        let mut channel = source.open(&options()).unwrap();
        source.fail("socket closed");
        assert!(matches!(channel.recv(), Err(NdbError::Netlink(_))));
        source.fail_dumps("no permission");
        assert!(channel.dump(RtnlKind::Link).is_err());
    }

    #[test]
    fn test_interrupt_wakes_blocked_recv() {
        let source = MemorySource::new();
        let mut channel = source
            .open(&ChannelOptions {
                recv_timeout: Duration::from_secs(30),
            })
            .unwrap();
        let interrupt = channel.interrupter();
        let reader = std::thread::spawn(move || {
            let started = std::time::Instant::now();
            let batch = channel.recv().unwrap();
            (batch.len(), started.elapsed())
        });
        std::thread::sleep(Duration::from_millis(50));
        interrupt();

        let (len, waited) = reader.join().unwrap();
        assert_eq!(len, 0);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn test_interrupted_channel_leaves_pending_batches() {
        let source = MemorySource::new();
        let mut channel = source.open(&options()).unwrap();
        channel.interrupter()();
        source.push_messages(vec![link(1)]);
        assert!(channel.recv().unwrap().is_empty());
        assert_eq!(source.pending(), 1);

        let mut fresh = source.open(&options()).unwrap();
        assert_eq!(fresh.recv().unwrap().len(), 1);
    }
}
