//! Engine facade: construction, views, resync and the shutdown protocol
//!
//! NIST 800-53 Rev5 [SI-4]: System Monitoring - Live mirror of kernel network state

use crate::channel::Targets;
use crate::config::NdbConfig;
use crate::dispatch::Dispatcher;
use crate::entity::{Address, Entity, Interface, Neighbour, Route};
use crate::error::{NdbError, Result};
use crate::event::{
    self, DispatchStats, Envelope, Event, EventKind, EventQueue, HandleId, HandlerFn,
    HandlerResult, ReadinessBarrier, Registration,
};
use crate::lifecycle::{CONTROL_TARGET, Lifecycle};
use crate::source::SourceThread;
use crate::store::{Store, StoreReader};
use crate::types::ChannelError;
use crate::view::View;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, instrument};

/// State shared by the facade, the dispatch thread, views and handles
pub(crate) struct Shared {
    pub(crate) queue: EventQueue,
    store: RwLock<Option<Arc<dyn Store>>>,
    sources: Mutex<Vec<SourceThread>>,
    failed: Mutex<BTreeMap<String, ChannelError>>,
    fatal: Mutex<Option<String>>,
    next_handle: AtomicU64,
}

impl Shared {
    pub(crate) fn new(queue: EventQueue) -> Self {
        Self {
            queue,
            store: RwLock::new(None),
            sources: Mutex::new(Vec::new()),
            failed: Mutex::new(BTreeMap::new()),
            fatal: Mutex::new(None),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Reader over the current store
    pub(crate) fn reader(&self) -> Result<StoreReader> {
        self.store
            .read()
            .clone()
            .map(StoreReader::new)
            .ok_or(NdbError::Closed)
    }

    /// Publish a new store, returning the previous one
    pub(crate) fn replace_store(&self, store: Option<Arc<dyn Store>>) -> Option<Arc<dyn Store>> {
        std::mem::replace(&mut *self.store.write(), store)
    }

    pub(crate) fn add_source(&self, thread: SourceThread) {
        self.sources.lock().push(thread);
    }

    pub(crate) fn source_count(&self) -> usize {
        self.sources.lock().len()
    }

    /// Signal every ingestion thread, then join them
    pub(crate) fn stop_sources(&self) {
        let threads = std::mem::take(&mut *self.sources.lock());
        for thread in &threads {
            debug!(target = thread.target(), "Stopping ingestion");
            thread.stop();
        }
        for thread in threads {
            thread.join();
        }
    }

    pub(crate) fn next_handle_id(&self) -> HandleId {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn record_failure(&self, target: &str, err: ChannelError) {
        self.failed.lock().insert(target.to_string(), err);
    }

    pub(crate) fn clear_failures(&self) {
        self.failed.lock().clear();
    }

    pub(crate) fn failed_targets(&self) -> BTreeMap<String, ChannelError> {
        self.failed.lock().clone()
    }

    pub(crate) fn set_fatal(&self, reason: String) {
        self.fatal.lock().get_or_insert(reason);
    }

    pub(crate) fn fatal(&self) -> Option<String> {
        self.fatal.lock().clone()
    }
}

/// A running network state database
///
/// Construction blocks until every target's initial dump has been applied.
/// Dropping the engine closes it; call [`Engine::close`] to observe errors.
pub struct Engine {
    shared: Arc<Shared>,
    dispatch: Mutex<Option<JoinHandle<Result<()>>>>,
    /// Serializes resync and close on this engine
    lock: Mutex<()>,
}

impl Engine {
    /// Engine over the targets named in `config`
    pub fn new(config: NdbConfig) -> Result<Self> {
        let targets = Targets::from_specs(&config.targets);
        Self::with_targets(config, targets)
    }

    /// Engine over explicitly built targets
    #[instrument(skip_all, fields(targets = ?targets))]
    pub fn with_targets(config: NdbConfig, targets: Targets) -> Result<Self> {
        config.validate()?;

        let (queue, inbox) = event::channel();
        let shared = Arc::new(Shared::new(queue));
        let lifecycle = Lifecycle::new(config, targets, shared.clone());
        let dispatcher = Dispatcher::new(shared.clone(), inbox, lifecycle);

        let barrier = ReadinessBarrier::new();
        let thread = {
            let barrier = barrier.clone();
            thread::Builder::new()
                .name("ndb-dispatch".to_string())
                .spawn(move || dispatcher.run(barrier))?
        };

        if let Err(e) = barrier.wait() {
            // the dispatch thread fails the barrier on its way out
            let outcome = match thread.join() {
                Ok(Err(inner)) => inner,
                _ => e,
            };
            shared.stop_sources();
            if let Some(store) = shared.replace_store(None) {
                let _ = store.close();
            }
            return Err(outcome);
        }

        info!("Engine started");
        Ok(Self {
            shared,
            dispatch: Mutex::new(Some(thread)),
            lock: Mutex::new(()),
        })
    }

    pub fn interfaces(&self) -> View<Interface> {
        self.view()
    }

    pub fn addresses(&self) -> View<Address> {
        self.view()
    }

    pub fn routes(&self) -> View<Route> {
        self.view()
    }

    pub fn neighbours(&self) -> View<Neighbour> {
        self.view()
    }

    pub fn view<E: Entity>(&self) -> View<E> {
        View::new(self.shared.clone())
    }

    /// Direct read-only access to the store
    pub fn reader(&self) -> Result<StoreReader> {
        self.shared.reader()
    }

    pub fn is_running(&self) -> bool {
        self.dispatch
            .lock()
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Append a free-standing handler for `kind`
    ///
    /// The handler runs on the dispatch thread after the built-in ones;
    /// returning `HandlerError::Invalidated` removes it.
    pub fn register_handler<F>(&self, kind: EventKind, handler: F) -> Result<()>
    where
        F: FnMut(&str, &Event) -> HandlerResult + Send + 'static,
    {
        let handler: HandlerFn = Box::new(handler);
        self.shared.queue.send(Envelope::Register(Registration {
            owner: None,
            handlers: vec![(kind, handler)],
            on_installed: None,
        }))
    }

    /// Force a sweep of stale handles and report the resulting counters
    ///
    /// Blocks the calling thread; safe to call from inside an async runtime.
    pub fn collect(&self) -> Result<DispatchStats> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.shared.queue.send(Envelope::Collect(tx))?;
        rx.recv().map_err(|_| NdbError::Closed)
    }

    pub fn stats(&self) -> Result<DispatchStats> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.shared.queue.send(Envelope::Stats(tx))?;
        rx.recv().map_err(|_| NdbError::Closed)
    }

    /// Reconnect every target and rebuild the mirror from fresh dumps
    #[instrument(skip_all)]
    pub fn resync(&self) -> Result<()> {
        let _guard = self.lock.lock();
        if self.dispatch.lock().is_none() {
            return Err(NdbError::Closed);
        }
        let barrier = ReadinessBarrier::new();
        self.shared.queue.send(Envelope::Resync(barrier.clone()))?;
        barrier.wait()
    }

    /// Targets whose channel failed, with the reported error
    pub fn failed_targets(&self) -> BTreeMap<String, ChannelError> {
        self.shared.failed_targets()
    }

    /// The error that terminated the dispatch loop, if any
    pub fn fatal_error(&self) -> Option<String> {
        self.shared.fatal()
    }

    /// Stop ingestion and dispatch, then commit and close the store
    ///
    /// Safe to call more than once; later calls return `Ok(())`.
    pub fn close(&self) -> Result<()> {
        let _guard = self.lock.lock();
        let Some(thread) = self.dispatch.lock().take() else {
            return Ok(());
        };
        info!("Closing engine");

        // the loop may already have terminated on a fatal error
        let _ = self.shared.queue.push(CONTROL_TARGET, vec![Event::Shutdown]);
        self.shared.stop_sources();

        let outcome = match thread.join() {
            Ok(outcome) => outcome,
            Err(_) => Err(NdbError::Fatal("dispatch thread panicked".to_string())),
        };
        let closed = match self.shared.replace_store(None) {
            Some(store) => store.commit().and_then(|_| store.close()),
            None => Ok(()),
        };

        info!("Engine closed");
        outcome.and(closed)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Engine closed with error");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("running", &self.is_running())
            .field("failed_targets", &self.failed_targets())
            .finish()
    }
}
