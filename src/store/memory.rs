use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{DeleteStatus, LeaseStore, StoreFault, StoreStatus};

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: (!ttl.is_zero()).then(|| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Counts of operations served, for tests and the CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub gets: usize,
    pub adds: usize,
    pub sets: usize,
    pub deletes: usize,
}

/// Process-local lease store. Shares leases between requests of one process,
/// which is what tests and the demo CLI need.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    data: DashMap<String, Slot>,
    gets: AtomicUsize,
    adds: AtomicUsize,
    sets: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            gets: self.gets.load(Ordering::SeqCst),
            adds: self.adds.load(Ordering::SeqCst),
            sets: self.sets.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
        }
    }

    /// Current live value of a key, without counting as a get()
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.data
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get(&self, key: &str, _deadline: Duration) -> Result<Option<String>, StoreFault> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.peek(key))
    }

    async fn add(&self, key: &str, value: &str, ttl: Duration, _deadline: Duration) -> StoreStatus {
        self.adds.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    StoreStatus::NotStored
                } else {
                    occupied.insert(Slot::new(value, ttl));
                    StoreStatus::Stored
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(value, ttl));
                StoreStatus::Stored
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration, _deadline: Duration) -> StoreStatus {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.data.insert(key.to_string(), Slot::new(value, ttl));
        StoreStatus::Stored
    }

    async fn delete(&self, key: &str, _deadline: Duration) -> DeleteStatus {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        match self.data.remove(key) {
            Some((_, slot)) if slot.is_live(now) => DeleteStatus::Deleted,
            _ => DeleteStatus::ItemMissing,
        }
    }
}
