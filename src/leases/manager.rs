// Lease manager - handles acquisition and release of leases in the shared store

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::lease::UNKNOWN_HOLDER;
use super::{HolderToken, Lease, LeaseGrant, LeaseKey};
use crate::config::LeaseConfig;
use crate::context::RequestKind;
use crate::error::{Error, Result};
use crate::store::{within_deadline, DeleteStatus, LeaseStore, StoreFault, StoreStatus};

/// Store writes we fire and forget, resolved when the request ends
#[derive(Debug, Default)]
pub struct DeferredWrites {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DeferredWrites {
    pub fn push(&self, handle: JoinHandle<()>) {
        self.handles.lock().push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for every outstanding write
    pub async fn resolve_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Deferred store write did not complete");
            }
        }
    }
}

/// Who is asking for a lease
#[derive(Debug, Clone, Copy)]
pub struct Caller<'a> {
    pub holder: &'a HolderToken,
    pub kind: &'a RequestKind,
    pub deferred: &'a DeferredWrites,
}

/// Acquires and releases leases in the shared lease store.
///
/// Shared by all requests of a process; holds no per-request state.
#[derive(Debug)]
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, config: LeaseConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Acquire the lease on `key`, waiting up to `wait_timeout` for another
    /// holder to let go.
    ///
    /// Store failures never fail the acquire: we would rather run with weakened
    /// exclusion during an outage than refuse all work. Only running out of
    /// wait time while someone else holds the lease is an error.
    pub async fn acquire(
        &self,
        caller: &Caller<'_>,
        key: &LeaseKey,
        hold_timeout: Option<Duration>,
        wait_timeout: Option<Duration>,
    ) -> Result<Lease> {
        // There is no way to hold a lease forever; a zero TTL would mean exactly that.
        let hold = hold_timeout
            .unwrap_or_else(|| self.config.hold_timeout(caller.kind))
            .max(Duration::from_secs(1));
        let wait = wait_timeout.unwrap_or_else(|| self.config.wait_timeout(caller.kind));
        let lease = |grant| Lease::new(key.clone(), caller.holder.clone(), grant, hold);

        self.give_way_to_interactive(caller, key).await;

        // add() is atomic. For errors and timeouts we retry a little.
        let mut status = StoreStatus::NetworkFailure;
        for _ in 0..self.config.add_attempts.max(1) {
            status = self.add(key, caller.holder, hold).await;
            if status.is_definite() {
                break;
            }
        }

        match status {
            StoreStatus::Stored => {
                return Ok(lease(LeaseGrant::Acquired {
                    waited: Duration::ZERO,
                }))
            }
            StoreStatus::Error => {
                error!(key = %key, "Lease store error acquiring lease; proceeding as if acquired");
                return Ok(lease(LeaseGrant::FailedOpen));
            }
            StoreStatus::NetworkFailure => {
                error!(key = %key, "Timeout or network failure acquiring lease; proceeding as if acquired");
                return Ok(lease(LeaseGrant::FailedOpen));
            }
            StoreStatus::NotStored => {}
        }

        // Check if it's just us re-acquiring a lease we already have
        let holder = self.current_holder(key).await;
        if holder == caller.holder.as_str() {
            warn!(key = %key, holder = %holder, "Lease re-acquired by its holder; a single release frees it");
            return Ok(lease(LeaseGrant::Reentered));
        }

        // Someone else has the lease. Poll until they let go or we give up.
        let started = Instant::now();
        loop {
            let attempt_at = Instant::now();
            match self.add(key, caller.holder, hold).await {
                StoreStatus::Stored => {
                    let waited = started.elapsed();
                    debug!(
                        key = %key,
                        waited_ms = waited.as_millis() as u64,
                        previous_holder = %holder,
                        "Acquired lease after waiting"
                    );
                    return Ok(lease(LeaseGrant::Acquired { waited }));
                }
                StoreStatus::NotStored => {}
                failure => {
                    error!(
                        key = %key,
                        status = ?failure,
                        waited_ms = started.elapsed().as_millis() as u64,
                        holder = %holder,
                        "Lease store failure while waiting for lease; proceeding as if acquired"
                    );
                    return Ok(lease(LeaseGrant::FailedOpen));
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= wait {
                break;
            }
            let until_next_poll = self
                .config
                .poll_interval()
                .saturating_sub(attempt_at.elapsed());
            sleep(until_next_poll.min(wait - elapsed)).await;
        }

        Err(Error::LockAcquireFailure {
            key: key.clone(),
            requester: caller.holder.clone(),
            holder,
            waited: started.elapsed(),
        })
    }

    /// Release the lease on `key`. Never fails; gives up (loudly) after a few
    /// network failures and lets the lease expire on its own.
    ///
    /// There is no compare-and-delete, so if our lease expired and someone else
    /// took it, this deletes *their* lease. Leases should rarely expire while
    /// held, so we take our chances.
    pub async fn release(&self, key: &LeaseKey) {
        let attempts = self.config.release_attempts.max(1);
        let deadline = self.config.set_deadline();
        for attempt in 1..=attempts {
            let status = within_deadline(
                deadline,
                DeleteStatus::NetworkFailure,
                self.store.delete(key.as_str(), deadline),
            )
            .await;
            match status {
                DeleteStatus::Deleted => {
                    debug!(key = %key, "Released lease");
                    return;
                }
                DeleteStatus::ItemMissing => {
                    debug!(key = %key, "Lease already gone at release");
                    return;
                }
                DeleteStatus::NetworkFailure => {
                    if attempt < attempts {
                        sleep(self.config.release_backoff()).await;
                    }
                }
            }
        }
        error!(key = %key, attempts, "Failed to release lease: network failure");
    }

    /// The holder currently recorded for `key`, or a placeholder if unreadable
    pub async fn current_holder(&self, key: &LeaseKey) -> String {
        let deadline = self.config.get_deadline();
        let result = within_deadline(
            deadline,
            Err(StoreFault::NetworkFailure),
            self.store.get(key.as_str(), deadline),
        )
        .await;
        match result {
            Ok(Some(holder)) => holder,
            _ => UNKNOWN_HOLDER.to_string(),
        }
    }

    // Interactive callers record that they were here; batch callers that see
    // such a record step back for a moment. The yield is longer than the poll
    // interval, so an interactive caller already waiting gets its turn first.
    async fn give_way_to_interactive(&self, caller: &Caller<'_>, key: &LeaseKey) {
        let marker = key.interactive_marker();
        if caller.kind.is_interactive() {
            let store = Arc::clone(&self.store);
            let ttl = self.config.interactive_grace();
            let deadline = self.config.set_deadline();
            caller.deferred.push(tokio::spawn(async move {
                let status = within_deadline(
                    deadline,
                    StoreStatus::NetworkFailure,
                    store.set(&marker, "1", ttl, deadline),
                )
                .await;
                if status != StoreStatus::Stored {
                    debug!(marker = %marker, status = ?status, "Could not record interactive lease use");
                }
            }));
        } else {
            // A generous deadline: a slow store should not let batch jobs hog the lease
            let deadline = self.config.fairness_check_deadline();
            let seen = within_deadline(
                deadline,
                Err(StoreFault::NetworkFailure),
                self.store.get(&marker, deadline),
            )
            .await;
            if let Ok(Some(_)) = seen {
                info!(
                    key = %key,
                    kind = %caller.kind,
                    "Batch caller yielding to concurrent interactive callers that also want the lease"
                );
                sleep(self.config.batch_yield()).await;
            }
        }
    }

    async fn add(&self, key: &LeaseKey, holder: &HolderToken, hold: Duration) -> StoreStatus {
        let deadline = self.config.set_deadline();
        within_deadline(
            deadline,
            StoreStatus::NetworkFailure,
            self.store.add(key.as_str(), holder.as_str(), hold, deadline),
        )
        .await
    }
}
