//! Per-target ingestion threads
//!
//! Each thread owns one channel and forwards every non-empty batch, tagged
//! with its target name, into the event queue. Stopping raises a flag and
//! fires the channel's interrupt; the receive timeout bounds the wait for
//! channels whose interrupt does nothing.

use crate::channel::{Channel, Interrupt};
use crate::error::Result;
use crate::event::{Event, EventQueue};
use crate::types::ChannelError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// A running ingestion thread
///
/// Dropping it without [`SourceThread::join`] still stops the thread.
pub struct SourceThread {
    target: String,
    stop: Arc<AtomicBool>,
    interrupt: Interrupt,
    thread: Option<JoinHandle<()>>,
}

impl SourceThread {
    pub fn spawn(target: String, channel: Box<dyn Channel>, queue: EventQueue) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let interrupt = channel.interrupter();
        let thread = {
            let target = target.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("ndb-src-{}", target))
                .spawn(move || ingest(&target, channel, &queue, &stop))?
        };
        Ok(Self {
            target,
            stop,
            interrupt,
            thread: Some(thread),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Ask the thread to leave, cutting its current read short
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        (self.interrupt)();
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop and wait for the thread
    pub fn join(mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(target = %self.target, "Ingestion thread panicked");
            }
        }
    }
}

impl Drop for SourceThread {
    fn drop(&mut self) {
        if self.thread.is_some() {
            debug!(target = %self.target, "Ingestion thread dropped unjoined");
            self.stop();
        }
    }
}

fn ingest(target: &str, mut channel: Box<dyn Channel>, queue: &EventQueue, stop: &AtomicBool) {
    info!(target = %target, "Ingestion started");
    while !stop.load(Ordering::Acquire) {
        match channel.recv() {
            Ok(batch) if batch.is_empty() => continue,
            Ok(batch) if batch[0].is_target_gone() => {
                info!(target = %target, "Target gone, ingestion finished");
                return;
            }
            Ok(batch) => {
                debug!(target = %target, events = batch.len(), "Forwarding batch");
                if queue.push(target, batch).is_err() {
                    debug!(target = %target, "Event queue closed");
                    return;
                }
            }
            Err(e) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                error!(target = %target, error = %e, "Channel failed");
                let failure = Event::SourceFailed(ChannelError::new(0, e.to_string()));
                let _ = queue.push(target, vec![failure]);
                return;
            }
        }
    }
    debug!(target = %target, "Ingestion stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelOptions, ChannelSource, MemorySource};
    use crate::event::{self, Envelope};
    use crate::types::{Action, RtnlKind, RtnlMessage};
    use std::time::{Duration, Instant};

    fn open(source: &MemorySource) -> Box<dyn Channel> {
        open_with(source, Duration::from_millis(10))
    }

    fn open_with(source: &MemorySource, recv_timeout: Duration) -> Box<dyn Channel> {
        source.open(&ChannelOptions { recv_timeout }).unwrap()
    }

    fn next_batch(inbox: &mut event::EventInbox) -> (String, Vec<Event>) {
        match inbox.recv() {
            Some(Envelope::Batch { target, events }) => (target, events),
            _ => panic!("expected a batch"),
        }
    }

    #[test]
    fn test_forwards_batches_in_order() {
        let source = MemorySource::new();
        let (queue, mut inbox) = event::channel();
        for index in 1..=3u32 {
            source.push_messages(vec![
                RtnlMessage::new(RtnlKind::Link, Action::New).with("index", index),
            ]);
        }
        let thread = SourceThread::spawn("ns0".to_string(), open(&source), queue).unwrap();

        for index in 1..=3i64 {
            let (target, events) = next_batch(&mut inbox);
            assert_eq!(target, "ns0");
            let msg = events[0].as_message().unwrap();
            assert_eq!(msg.get("index").and_then(|v| v.as_i64()), Some(index));
        }
        thread.join();
    }

    #[test]
    fn test_target_gone_ends_silently() {
        let source = MemorySource::new();
        let (queue, mut inbox) = event::channel();
        source.disconnect();
        let thread = SourceThread::spawn("ns0".to_string(), open(&source), queue).unwrap();
        thread.join();
        // the only producer is gone and nothing was forwarded
        assert!(inbox.recv().is_none());
    }

    #[test]
    fn test_channel_error_reported() {
        let source = MemorySource::new();
        let (queue, mut inbox) = event::channel();
        source.fail("socket closed");
        let thread = SourceThread::spawn("ns0".to_string(), open(&source), queue).unwrap();
        let (target, events) = next_batch(&mut inbox);
        assert_eq!(target, "ns0");
        assert!(matches!(events[0], Event::SourceFailed(_)));
        thread.join();
    }

    #[test]
    fn test_stop_flag() {
        let source = MemorySource::new();
        let (queue, _inbox) = event::channel();
        let thread = SourceThread::spawn("ns0".to_string(), open(&source), queue).unwrap();
        assert!(!thread.is_finished());
        thread.join();
    }

    #[test]
    fn test_stop_does_not_wait_out_receive_timeout() {
        let source = MemorySource::new();
        let (queue, _inbox) = event::channel();
        let channel = open_with(&source, Duration::from_secs(30));
        let thread = SourceThread::spawn("ns0".to_string(), channel, queue).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        thread.join();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_drop_stops_thread() {
        let source = MemorySource::new();
        let (queue, _inbox) = event::channel();
        let channel = open_with(&source, Duration::from_secs(30));
        let thread = SourceThread::spawn("ns0".to_string(), channel, queue).unwrap();
        drop(thread);

        source.push_messages(vec![
            RtnlMessage::new(RtnlKind::Link, Action::New).with("index", 1u32),
        ]);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(source.pending(), 1);
    }
}
