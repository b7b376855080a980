use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::sleep;

use crate::store::{DeleteStatus, InMemoryLeaseStore, LeaseStore, StoreFault, StoreStatus};

/// Lease store that can be told to misbehave: scripted results for the next
/// few add()/delete() calls, failing get()s, and added latency.
#[derive(Debug, Default)]
pub struct FlakyLeaseStore {
    inner: InMemoryLeaseStore,
    adds: Mutex<VecDeque<StoreStatus>>,
    deletes: Mutex<VecDeque<DeleteStatus>>,
    get_fault: Mutex<Option<StoreFault>>,
    latency: Mutex<Duration>,
}

impl FlakyLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The well-behaved store underneath
    pub fn inner(&self) -> &InMemoryLeaseStore {
        &self.inner
    }

    /// Answer the next add() calls with these statuses instead of touching the store
    pub fn script_adds(&self, statuses: impl IntoIterator<Item = StoreStatus>) {
        self.adds.lock().extend(statuses);
    }

    pub fn script_deletes(&self, statuses: impl IntoIterator<Item = DeleteStatus>) {
        self.deletes.lock().extend(statuses);
    }

    pub fn scripted_adds_remaining(&self) -> usize {
        self.adds.lock().len()
    }

    pub fn scripted_deletes_remaining(&self) -> usize {
        self.deletes.lock().len()
    }

    /// Make every get() fail until cleared with `None`
    pub fn fail_gets(&self, fault: Option<StoreFault>) {
        *self.get_fault.lock() = fault;
    }

    /// Delay every call by this much before answering
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    async fn lag(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            sleep(latency).await;
        }
    }
}

#[async_trait]
impl LeaseStore for FlakyLeaseStore {
    async fn get(&self, key: &str, deadline: Duration) -> Result<Option<String>, StoreFault> {
        self.lag().await;
        let fault = *self.get_fault.lock();
        match fault {
            Some(fault) => Err(fault),
            None => self.inner.get(key, deadline).await,
        }
    }

    async fn add(&self, key: &str, value: &str, ttl: Duration, deadline: Duration) -> StoreStatus {
        self.lag().await;
        let scripted = self.adds.lock().pop_front();
        match scripted {
            Some(status) => status,
            None => self.inner.add(key, value, ttl, deadline).await,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration, deadline: Duration) -> StoreStatus {
        self.lag().await;
        self.inner.set(key, value, ttl, deadline).await
    }

    async fn delete(&self, key: &str, deadline: Duration) -> DeleteStatus {
        self.lag().await;
        let scripted = self.deletes.lock().pop_front();
        match scripted {
            Some(status) => status,
            None => self.inner.delete(key, deadline).await,
        }
    }
}

/// Route `tracing` output to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
