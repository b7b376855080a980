// Consistency auditing of entity reads and writes
//
// Every entity kind can declare how it may be written. Gets and puts flowing
// through the hooked store are checked against that declaration:
// - policy.rs: the per-kind declarations
// - provenance.rs: what we learned about each in-memory copy at get time
// - ledger.rs: per-request order of gets and puts, for lost-update detection
// - checkpoint.rs: undoing the records of a write rejected part way through
// - enforcement.rs: whether a finding raises, logs, or is suppressed
// - engine.rs: the checks themselves, installed as access hooks

pub mod checkpoint;
pub mod enforcement;
pub mod engine;
pub mod ledger;
pub mod policy;
pub mod provenance;

pub use checkpoint::AuditCheckpoint;
pub use enforcement::{Enforcement, EnforcementGuard, EnforcementMode, ViolationKind};
pub use engine::ConsistencyEngine;
pub use ledger::{AccessOp, GetPutLedger, LedgerEntry, WriteSite};
pub use policy::{EntityAccessPolicy, LockIdFn, PolicyKind, PolicyRegistry};
pub use provenance::{EntityProvenance, LockStamp, ProvenanceTable};
