//! Live object handles
//!
//! A [`Handle`] is bound to one entity key and refreshes its snapshot on the
//! dispatch thread whenever a matching event was applied. The registry only
//! keeps a weak reference, so a handle lives exactly as long as the caller
//! keeps it; dropping the last clone queues a dispose request.

use crate::engine::Shared;
use crate::entity::{Entity, KeyMap};
use crate::error::Result;
use crate::event::{
    Envelope, Event, EventKind, HandleId, HandlerError, HandlerFn, HandlerResult, Registration,
};
use crate::schema::TARGET;
use crate::types::{Action, DEFAULT_TARGET, RtnlKind, RtnlMessage, Value};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Handler method of an entity handle, bound weakly at registration
pub type Method<E> = fn(&HandleCore<E>, &str, &Event) -> HandlerResult;

/// One stored row: raw field names (plus `target`) to values
pub type Record = BTreeMap<String, Value>;

#[derive(Default)]
struct HandleState {
    record: Option<Record>,
    version: u64,
}

/// Shared state behind a [`Handle`]
pub struct HandleCore<E: Entity> {
    id: HandleId,
    key: KeyMap,
    shared: Arc<Shared>,
    state: Mutex<HandleState>,
    updated: Condvar,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> HandleCore<E> {
    fn target(&self) -> &str {
        self.key
            .get(TARGET)
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_TARGET)
    }

    /// True when `msg` from `target` is about this handle's object
    pub fn matches(&self, target: &str, msg: &RtnlMessage) -> bool {
        let spec = E::SPEC;
        target == self.target()
            && msg.kind == spec.kind
            && self
                .key
                .iter()
                .filter(|(name, _)| name.as_str() != TARGET)
                .all(|(name, value)| spec.message_value(msg, name) == *value)
    }

    /// Re-read the row from the store
    pub fn reload(&self) -> Result<()> {
        let spec = E::SPEC;
        let reader = self.shared.reader()?;
        let names: Vec<&str> = self.key.keys().map(String::as_str).collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            spec.columns().join(", "),
            spec.table,
            spec.where_clause(reader.dialect(), &names, 1)
        );
        let params: Vec<Value> = self.key.values().cloned().collect();
        let record = reader.query(&sql, &params)?.into_iter().next().map(|row| {
            std::iter::once(TARGET)
                .chain(spec.fields.iter().map(|f| f.name))
                .map(str::to_string)
                .zip(row)
                .collect::<Record>()
        });

        let mut state = self.state.lock();
        state.record = record;
        state.version += 1;
        self.updated.notify_all();
        Ok(())
    }

    /// Reload when the event is about this object
    pub fn on_message(&self, target: &str, event: &Event) -> HandlerResult {
        if let Some(msg) = event.as_message() {
            if self.matches(target, msg) {
                debug!(table = E::SPEC.table, handle = self.id, "Reloading handle");
                self.reload()?;
            }
        }
        Ok(())
    }

    /// Reload when a link of this handle's target went away
    ///
    /// Link removal deletes dependent rows without per-row events.
    pub fn on_link_removed(&self, target: &str, event: &Event) -> HandlerResult {
        match event.as_message() {
            Some(msg)
                if msg.kind == RtnlKind::Link
                    && msg.action == Action::Del
                    && target == self.target() =>
            {
                self.reload().map_err(HandlerError::from)
            }
            _ => Ok(()),
        }
    }
}

impl<E: Entity> Drop for HandleCore<E> {
    fn drop(&mut self) {
        // the dispatch loop may already be gone
        let _ = self.shared.queue.send(Envelope::Dispose(self.id));
    }
}

/// A live, self-updating object bound to one entity key
pub struct Handle<E: Entity> {
    core: Arc<HandleCore<E>>,
}

impl<E: Entity> Clone for Handle<E> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<E: Entity> Handle<E> {
    /// Create a handle, load its row and subscribe it to the dispatch loop
    pub(crate) fn register(shared: Arc<Shared>, key: KeyMap) -> Result<Self> {
        let id = shared.next_handle_id();
        let core = Arc::new(HandleCore::<E> {
            id,
            key,
            shared: shared.clone(),
            state: Mutex::new(HandleState::default()),
            updated: Condvar::new(),
            _entity: PhantomData,
        });
        core.reload()?;

        let weak = Arc::downgrade(&core);
        let handlers: Vec<(EventKind, HandlerFn)> = E::event_map()
            .into_iter()
            .map(|(kind, method)| {
                let weak = weak.clone();
                let handler: HandlerFn = Box::new(move |target, event| match weak.upgrade() {
                    Some(core) => method(&core, target, event),
                    None => Err(HandlerError::Invalidated),
                });
                (kind, handler)
            })
            .collect();
        let token: Weak<dyn Any + Send + Sync> = weak.clone();
        let on_installed = Box::new(move || {
            // catch events applied between the first load and installation
            if let Some(core) = weak.upgrade() {
                if let Err(e) = core.reload() {
                    warn!(handle = core.id, error = %e, "Failed to refresh handle");
                }
            }
        });

        shared.queue.send(Envelope::Register(Registration {
            owner: Some((id, token)),
            handlers,
            on_installed: Some(on_installed),
        }))?;

        Ok(Self { core })
    }

    pub fn id(&self) -> HandleId {
        self.core.id
    }

    /// The completed key this handle is bound to
    pub fn key(&self) -> &KeyMap {
        &self.core.key
    }

    /// Current row, `None` while the object does not exist
    pub fn snapshot(&self) -> Option<Record> {
        self.core.state.lock().record.clone()
    }

    /// One field by raw or short name
    pub fn get(&self, name: &str) -> Option<Value> {
        let field = if name == TARGET {
            TARGET
        } else {
            E::SPEC.lookup(name)?.name
        };
        self.core.state.lock().record.as_ref()?.get(field).cloned()
    }

    pub fn exists(&self) -> bool {
        self.core.state.lock().record.is_some()
    }

    /// Number of reloads so far
    pub fn version(&self) -> u64 {
        self.core.state.lock().version
    }

    /// Block until the version moves past `since` or `timeout` elapses
    ///
    /// Returns the version observed last.
    pub fn wait_for_update(&self, since: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut state = self.core.state.lock();
        while state.version <= since {
            if self.core.updated.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.version
    }
}

impl<E: Entity> fmt::Debug for Handle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("table", &E::SPEC.table)
            .field("id", &self.core.id)
            .field("key", &self.core.key)
            .field("version", &self.version())
            .finish()
    }
}
