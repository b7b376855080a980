// Logical lock tracking: reentrant per-request locks on top of leases

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{Caller, LeaseKey, LeaseManager};
use crate::error::Result;
use crate::util::Nonce;

/// One held logical lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockEntry {
    /// Distinguishes this acquisition from any earlier or later one of the
    /// same lock id
    pub nonce: Nonce,
    /// Nesting depth, always at least 1
    pub count: usize,
}

/// Logical locks held by one request, by lock id.
///
/// Every lock id in the table has exactly one outstanding lease behind it.
#[derive(Debug, Default)]
pub struct LockTable {
    entries: HashMap<String, LockEntry>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, lock_id: &str) -> bool {
        self.entries.contains_key(lock_id)
    }

    pub fn nonce_of(&self, lock_id: &str) -> Option<Nonce> {
        self.entries.get(lock_id).map(|entry| entry.nonce)
    }

    /// The nonce of *some* held lock, or None if nothing is held.
    ///
    /// Only meant for entities we cannot map to a lock id. The answer does not
    /// change as long as the set of held locks does not.
    pub fn nonce_of_any(&self) -> Option<Nonce> {
        self.entries.values().map(|entry| entry.nonce).min()
    }

    pub fn count_of(&self, lock_id: &str) -> usize {
        self.entries.get(lock_id).map_or(0, |entry| entry.count)
    }

    /// Nest one level deeper into an already-held lock
    pub fn reenter(&mut self, lock_id: &str) -> Option<Nonce> {
        self.entries.get_mut(lock_id).map(|entry| {
            entry.count += 1;
            entry.nonce
        })
    }

    /// Record a freshly acquired lock. If a concurrent task of the same
    /// request got there first, nest into its entry instead.
    pub fn insert(&mut self, lock_id: &str) -> Nonce {
        let entry = self
            .entries
            .entry(lock_id.to_string())
            .and_modify(|entry| entry.count += 1)
            .or_insert_with(|| LockEntry {
                nonce: Nonce::generate(),
                count: 1,
            });
        entry.nonce
    }

    /// Step out one level. Returns true when the lock is no longer held and
    /// its lease must be released.
    ///
    /// Panics if the lock is not held: that is a bug in the caller.
    pub fn release(&mut self, lock_id: &str) -> bool {
        let entry = self
            .entries
            .get_mut(lock_id)
            .unwrap_or_else(|| panic!("Attempted to release unheld write lock for {lock_id}"));
        assert!(entry.count > 0, "Non-positive lock count for {lock_id}");
        entry.count -= 1;
        if entry.count == 0 {
            self.entries.remove(lock_id);
            true
        } else {
            false
        }
    }

    /// Held lock ids, sorted
    pub fn held_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Reentrant logical locks for one request, backed by the lease manager.
///
/// Nested acquires of the same lock id only bump a counter; the lease is
/// taken on the first acquire and released when the count drops to zero.
#[derive(Debug)]
pub struct UserLocks {
    manager: Arc<LeaseManager>,
    table: Mutex<LockTable>,
}

impl UserLocks {
    pub fn new(manager: Arc<LeaseManager>) -> Self {
        Self {
            manager,
            table: Mutex::new(LockTable::new()),
        }
    }

    /// Acquire the lock for `lock_id`, returning the nonce of the (possibly
    /// already held) acquisition.
    pub async fn acquire(
        &self,
        caller: &Caller<'_>,
        lock_id: &str,
        hold_timeout: Option<Duration>,
        wait_timeout: Option<Duration>,
    ) -> Result<Nonce> {
        if let Some(nonce) = self.table.lock().reenter(lock_id) {
            return Ok(nonce);
        }

        self.manager
            .acquire(caller, &LeaseKey::user(lock_id), hold_timeout, wait_timeout)
            .await?;
        debug!(lock_id, "Acquired user lock");

        let mut table = self.table.lock();
        // Holding several user locks at once is where lock-ordering deadlocks
        // come from, so make it visible.
        if !table.is_empty() && !table.is_held(lock_id) {
            info!(held = ?table.held_ids(), adding = lock_id, "Already held user locks and just added another");
        }
        Ok(table.insert(lock_id))
    }

    /// Release one level of `lock_id`. Panics if it is not held.
    pub async fn release(&self, lock_id: &str) {
        let fully_released = self.table.lock().release(lock_id);
        if fully_released {
            self.manager.release(&LeaseKey::user(lock_id)).await;
            debug!(lock_id, "Released user lock");
        }
    }

    /// Release every lock held, however deeply nested
    pub async fn release_all(&self) {
        let held: Vec<String> = {
            let mut table = self.table.lock();
            let ids = table.held_ids();
            table.clear();
            ids
        };
        for lock_id in held {
            self.manager.release(&LeaseKey::user(&lock_id)).await;
            debug!(lock_id = %lock_id, "Released user lock at request end");
        }
    }

    pub fn is_held(&self, lock_id: &str) -> bool {
        self.table.lock().is_held(lock_id)
    }

    pub fn nonce_of(&self, lock_id: &str) -> Option<Nonce> {
        self.table.lock().nonce_of(lock_id)
    }

    pub fn nonce_of_any(&self) -> Option<Nonce> {
        self.table.lock().nonce_of_any()
    }

    pub fn depth_of(&self, lock_id: &str) -> usize {
        self.table.lock().count_of(lock_id)
    }

    pub fn held_ids(&self) -> Vec<String> {
        self.table.lock().held_ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_counts() {
        let mut table = LockTable::new();
        let nonce = table.insert("42");
        assert_eq!(table.reenter("42"), Some(nonce));
        assert_eq!(table.count_of("42"), 2);

        assert!(!table.release("42"));
        assert!(table.is_held("42"));
        assert!(table.release("42"));
        assert!(!table.is_held("42"));
        assert_eq!(table.nonce_of("42"), None);
    }

    #[test]
    fn test_reacquire_gets_a_new_nonce() {
        let mut table = LockTable::new();
        let first = table.insert("42");
        table.release("42");
        let second = table.insert("42");
        assert_ne!(first, second);
    }

    #[test]
    fn test_nonce_of_any_is_stable() {
        let mut table = LockTable::new();
        assert_eq!(table.nonce_of_any(), None);
        let a = table.insert("a");
        let b = table.insert("b");
        let any = table.nonce_of_any().unwrap();
        assert_eq!(any, a.min(b));
        assert_eq!(table.nonce_of_any(), Some(any));
        assert_eq!(table.held_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    #[should_panic(expected = "Attempted to release unheld write lock for 42")]
    fn test_release_of_unheld_lock_panics() {
        let mut table = LockTable::new();
        table.release("42");
    }
}
