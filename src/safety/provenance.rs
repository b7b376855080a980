use std::collections::HashMap;

use parking_lot::Mutex;

use crate::context::TransactionId;
use crate::entity::InstanceId;
use crate::util::Nonce;

/// Which logical lock was held when an entity was read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStamp {
    NotHeld,
    Held(Nonce),
}

impl LockStamp {
    pub fn from_nonce(nonce: Option<Nonce>) -> Self {
        nonce.map_or(LockStamp::NotHeld, LockStamp::Held)
    }

    pub fn nonce(self) -> Option<Nonce> {
        match self {
            LockStamp::NotHeld => None,
            LockStamp::Held(nonce) => Some(nonce),
        }
    }
}

/// What we know about one in-memory entity copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityProvenance {
    /// Set when the copy came from a get
    pub get_nonce: Option<Nonce>,
    pub transaction_at_get: Option<TransactionId>,
    /// `None` until stamped: at get for user-specific kinds, or at the first
    /// put made under the lock for a newly created entity
    pub lock_at_get: Option<LockStamp>,
    pub has_been_put: bool,
    pub hooks_run: bool,
}

/// Provenance of every entity copy a request has touched
#[derive(Debug, Default)]
pub struct ProvenanceTable {
    entries: Mutex<HashMap<InstanceId, EntityProvenance>>,
}

impl ProvenanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provenance of `instance`; all-empty for copies never seen
    pub fn get(&self, instance: InstanceId) -> EntityProvenance {
        self.entries
            .lock()
            .get(&instance)
            .copied()
            .unwrap_or_default()
    }

    pub fn update<R>(&self, instance: InstanceId, f: impl FnOnce(&mut EntityProvenance) -> R) -> R {
        let mut entries = self.entries.lock();
        f(entries.entry(instance).or_default())
    }

    /// The recorded provenance of `instance`, if any
    pub fn snapshot(&self, instance: InstanceId) -> Option<EntityProvenance> {
        self.entries.lock().get(&instance).copied()
    }

    /// Put back what `snapshot` returned
    pub fn restore(&self, instance: InstanceId, saved: Option<EntityProvenance>) {
        let mut entries = self.entries.lock();
        match saved {
            Some(provenance) => {
                entries.insert(instance, provenance);
            }
            None => {
                entries.remove(&instance);
            }
        }
    }

    /// Note that get hooks ran for `instance` under `transaction`. Returns
    /// false if they had already run.
    pub fn mark_hooks_run(&self, instance: InstanceId, transaction: Option<TransactionId>) -> bool {
        self.update(instance, |provenance| {
            if provenance.hooks_run {
                return false;
            }
            provenance.hooks_run = true;
            provenance.transaction_at_get = transaction;
            true
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
