// Lease store contract: the shared low-latency cache that leases live in.
//
// The store is the only state shared across processes. Everything the lease
// manager knows about other holders comes through these four operations.

pub mod memory;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

pub use memory::InMemoryLeaseStore;

/// Result of an add() or set()
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Stored,
    /// add() found the key already present
    NotStored,
    /// The store answered with an error
    Error,
    /// Transport failure or missed deadline; the outcome is unknown
    NetworkFailure,
}

impl StoreStatus {
    /// The store gave a definite answer
    pub fn is_definite(self) -> bool {
        matches!(self, StoreStatus::Stored | StoreStatus::NotStored)
    }
}

/// Result of a delete()
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    Deleted,
    ItemMissing,
    NetworkFailure,
}

/// Why a get() produced no answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreFault {
    #[error("lease store error")]
    Error,
    #[error("lease store network failure or deadline exceeded")]
    NetworkFailure,
}

impl From<StoreFault> for StoreStatus {
    fn from(fault: StoreFault) -> Self {
        match fault {
            StoreFault::Error => StoreStatus::Error,
            StoreFault::NetworkFailure => StoreStatus::NetworkFailure,
        }
    }
}

/// Atomic key-value operations with per-call deadlines.
///
/// A `ttl` of zero means the entry never expires.
#[async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str, deadline: Duration) -> Result<Option<String>, StoreFault>;

    /// Store `value` only if `key` is absent (or expired)
    async fn add(&self, key: &str, value: &str, ttl: Duration, deadline: Duration) -> StoreStatus;

    async fn set(&self, key: &str, value: &str, ttl: Duration, deadline: Duration) -> StoreStatus;

    async fn delete(&self, key: &str, deadline: Duration) -> DeleteStatus;
}

/// Run a store call, enforcing its deadline on our side too. A store that
/// does not answer in time is reported as `timed_out`.
pub(crate) async fn within_deadline<T, F>(deadline: Duration, timed_out: T, call: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => timed_out,
    }
}
