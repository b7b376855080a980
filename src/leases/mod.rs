// Lease-based locking over the shared lease store
//
// Provides mutual exclusion across processes with:
// - Time-bounded leases taken with an atomic add-if-absent
// - Priority for interactive callers over batch callers
// - Bounded waiting with ~1s polling
// - Fail-permissive behaviour when the store is degraded
// - Reentrant per-request logical locks with nonces

pub mod lease;
pub mod manager;
pub mod table;

pub use lease::{HolderToken, Lease, LeaseGrant, LeaseKey};
pub use manager::{Caller, DeferredWrites, LeaseManager};
pub use table::{LockEntry, LockTable, UserLocks};
