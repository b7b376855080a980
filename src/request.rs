// Per-request state: locks held, enforcement mode, audit tables, ambient
// transaction and deferred store writes. Built fresh for every request by the
// Coordinator and torn down by finish().

use std::collections::HashSet;
use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::context::{Environment, RequestInfo, TransactionId};
use crate::coordinator::Shared;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::hooks::HookedStore;
use crate::leases::{Caller, DeferredWrites, HolderToken, Lease, LeaseKey, UserLocks};
use crate::safety::{
    Enforcement, EnforcementGuard, EnforcementMode, GetPutLedger, LockStamp, ProvenanceTable,
};
use crate::util::Nonce;

pub struct RequestContext {
    info: RequestInfo,
    holder: HolderToken,
    shared: Arc<Shared>,
    user_locks: UserLocks,
    enforcement: Enforcement,
    ledger: GetPutLedger,
    provenance: ProvenanceTable,
    transaction: Mutex<Option<TransactionId>>,
    deferred: DeferredWrites,
    /// Low-level locks taken with acquire_lock and not yet released
    held_locks: Mutex<HashSet<LeaseKey>>,
}

impl RequestContext {
    pub(crate) fn new(info: RequestInfo, shared: Arc<Shared>) -> Self {
        let safety = &shared.config.safety;
        let enforcement = Enforcement::new(
            safety.default_enforcement,
            safety.raises_in(shared.config.environment),
        );
        Self {
            holder: info.holder_token(),
            user_locks: UserLocks::new(Arc::clone(&shared.leases)),
            info,
            enforcement,
            shared,
            ledger: GetPutLedger::new(),
            provenance: ProvenanceTable::new(),
            transaction: Mutex::new(None),
            deferred: DeferredWrites::default(),
            held_locks: Mutex::new(HashSet::new()),
        }
    }

    pub fn info(&self) -> &RequestInfo {
        &self.info
    }

    pub fn holder(&self) -> &HolderToken {
        &self.holder
    }

    pub fn environment(&self) -> Environment {
        self.shared.config.environment
    }

    /// The entity store, with access hooks
    pub fn store(&self) -> &HookedStore {
        &self.shared.store
    }

    pub fn user_locks(&self) -> &UserLocks {
        &self.user_locks
    }

    pub fn enforcement(&self) -> &Enforcement {
        &self.enforcement
    }

    pub fn ledger(&self) -> &GetPutLedger {
        &self.ledger
    }

    pub fn provenance(&self) -> &ProvenanceTable {
        &self.provenance
    }

    pub(crate) fn deferred(&self) -> &DeferredWrites {
        &self.deferred
    }

    pub(crate) fn captures_backtraces(&self) -> bool {
        self.shared.config.safety.capture_backtraces
    }

    pub fn caller(&self) -> Caller<'_> {
        Caller {
            holder: &self.holder,
            kind: &self.info.kind,
            deferred: &self.deferred,
        }
    }

    // Low-level locks

    /// Take the low-level lock on `key`.
    ///
    /// Re-acquiring a lock this request already holds succeeds immediately,
    /// but one release_lock frees it: prefer user locks, which nest properly.
    pub async fn acquire_lock(
        &self,
        key: &str,
        hold_timeout: Option<Duration>,
        wait_timeout: Option<Duration>,
    ) -> Result<Lease> {
        let lease = self
            .shared
            .leases
            .acquire(&self.caller(), &LeaseKey::global(key), hold_timeout, wait_timeout)
            .await?;
        self.held_locks.lock().insert(lease.key.clone());
        Ok(lease)
    }

    pub async fn release_lock(&self, key: &str) {
        let key = LeaseKey::global(key);
        self.held_locks.lock().remove(&key);
        self.shared.leases.release(&key).await;
    }

    /// Run `f` holding the low-level lock on `key`, releasing it however `f`
    /// exits
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        hold_timeout: Option<Duration>,
        wait_timeout: Option<Duration>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire_lock(key, hold_timeout, wait_timeout).await?;
        let outcome = AssertUnwindSafe(async move { f().await }).catch_unwind().await;
        self.release_lock(key).await;
        outcome.unwrap_or_else(|panic| resume_unwind(panic))
    }

    // User locks

    pub async fn acquire_user_lock(
        &self,
        lock_id: &str,
        hold_timeout: Option<Duration>,
        wait_timeout: Option<Duration>,
    ) -> Result<Nonce> {
        self.user_locks
            .acquire(&self.caller(), lock_id, hold_timeout, wait_timeout)
            .await
    }

    /// Panics if this request does not hold the lock
    pub async fn release_user_lock(&self, lock_id: &str) {
        self.user_locks.release(lock_id).await;
    }

    pub async fn with_user_lock<F, Fut, T>(
        &self,
        lock_id: &str,
        hold_timeout: Option<Duration>,
        wait_timeout: Option<Duration>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire_user_lock(lock_id, hold_timeout, wait_timeout).await?;
        let outcome = AssertUnwindSafe(async move { f().await }).catch_unwind().await;
        self.release_user_lock(lock_id).await;
        outcome.unwrap_or_else(|panic| resume_unwind(panic))
    }

    pub fn user_lock_is_held(&self, lock_id: &str) -> bool {
        self.user_locks.is_held(lock_id)
    }

    pub fn user_lock_nonce(&self, lock_id: &str) -> Option<Nonce> {
        self.user_locks.nonce_of(lock_id)
    }

    pub fn any_user_lock_nonce(&self) -> Option<Nonce> {
        self.user_locks.nonce_of_any()
    }

    /// Run `f` on a copy of `entity` read under its user lock.
    ///
    /// If `entity` was already read under the lock acquisition active now, or
    /// was never read or written, `f` gets it as is. Otherwise the lock is
    /// taken, the entity re-read, and `f` runs on the fresh copy before the
    /// lock is released.
    pub async fn fetch_under_user_lock<F, Fut, T>(&self, entity: Entity, f: F) -> Result<T>
    where
        F: FnOnce(Entity) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock_id = self
            .shared
            .policies
            .policy_for(entity.kind())
            .and_then(|policy| policy.lock_id_for(&entity))
            .ok_or_else(|| Error::MissingLockId {
                kind: entity.kind().to_string(),
            })?;

        let provenance = self.provenance.get(entity.instance());
        let active = self.user_lock_nonce(&lock_id);
        let under_same_lock = matches!(
            provenance.lock_at_get,
            Some(LockStamp::Held(nonce)) if Some(nonce) == active
        );
        let never_persisted = provenance.get_nonce.is_none() && !provenance.has_been_put;
        if under_same_lock || never_persisted {
            return f(entity).await;
        }

        let key = entity.key().clone();
        self.with_user_lock(&lock_id, None, None, || async move {
            let fresh = self
                .store()
                .get(self, &key)
                .await?
                .ok_or_else(|| Error::EntityNotFound(key.clone()))?;
            f(fresh).await
        })
        .await
    }

    // Transactions

    /// Make a new transaction ambient until the guard drops
    pub fn begin_transaction(&self) -> TransactionGuard<'_> {
        let id = TransactionId::new();
        let previous = self.transaction.lock().replace(id);
        TransactionGuard {
            slot: &self.transaction,
            id,
            previous,
        }
    }

    pub fn current_transaction(&self) -> Option<TransactionId> {
        *self.transaction.lock()
    }

    // Enforcement overrides

    /// Turn off consistency checks until the guard drops. The checks are
    /// there for a reason; only use this when something else makes the
    /// writes safe.
    pub fn dangerously_suppress_checks(&self) -> EnforcementGuard<'_> {
        self.enforcement.override_mode(EnforcementMode::EnforceNone)
    }

    /// Turn off consistency checks for a test doing things production code
    /// never does. Panics outside the test environment.
    pub fn suppress_checks_in_test(&self) -> EnforcementGuard<'_> {
        assert_eq!(self.environment(), Environment::Test, "Only use this in tests!");
        self.enforcement.override_mode(EnforcementMode::EnforceNone)
    }

    pub fn disable_user_lock_checking_in_test(&self) -> EnforcementGuard<'_> {
        assert_eq!(self.environment(), Environment::Test, "Only use this in tests!");
        self.enforcement
            .override_mode(EnforcementMode::EnforceAllExceptUserLock)
    }

    /// End of request: release every lock still held, wait for deferred
    /// store writes, and forget all per-request state.
    pub async fn finish(&self) {
        self.user_locks.release_all().await;

        let mut leftover: Vec<LeaseKey> = self.held_locks.lock().drain().collect();
        leftover.sort();
        for key in leftover {
            warn!(key = %key, request = %self.holder, "Lock still held at end of request; releasing");
            self.shared.leases.release(&key).await;
        }

        self.deferred.resolve_all().await;

        self.ledger.clear();
        self.provenance.clear();
        *self.transaction.lock() = None;
        self.enforcement.reset();
        debug!(request = %self.holder, "Request finished");
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("info", &self.info)
            .field("user_locks", &self.user_locks.held_ids())
            .field("enforcement", &self.enforcement.mode())
            .field("transaction", &self.current_transaction())
            .finish_non_exhaustive()
    }
}

/// Ends the transaction begun with `begin_transaction` on drop
#[must_use = "the transaction ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct TransactionGuard<'a> {
    slot: &'a Mutex<Option<TransactionId>>,
    id: TransactionId,
    previous: Option<TransactionId>,
}

impl TransactionGuard<'_> {
    pub fn id(&self) -> TransactionId {
        self.id
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = self.previous;
    }
}
