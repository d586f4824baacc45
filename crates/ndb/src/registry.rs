//! Weak registry of live handles
//!
//! Owned by the dispatch loop. Entries never keep a handle alive; the sweep
//! reports the ids whose referent is gone so their handlers can be dropped.

use crate::event::HandleId;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Weak;

#[derive(Default)]
pub struct Registry {
    entries: HashMap<HandleId, Weak<dyn Any + Send + Sync>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: HandleId, token: Weak<dyn Any + Send + Sync>) {
        self.entries.insert(id, token);
    }

    pub fn remove(&mut self, id: HandleId) -> bool {
        self.entries.remove(&id).is_some()
    }

    #[cfg(test)]
    pub fn contains(&self, id: HandleId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop entries whose handle is gone and return their ids
    pub fn sweep(&mut self) -> Vec<HandleId> {
        let dead: Vec<HandleId> = self
            .entries
            .iter()
            .filter(|(_, token)| token.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            self.entries.remove(id);
        }
        self.entries.shrink_to_fit();
        dead
    }
}
