pub use std::{sync::Arc, time::Duration};

pub use serde_json::{json, Map, Value};

pub use crate::config::{Config, LeaseConfig, SafetyConfig};
pub use crate::context::{Environment, RequestInfo, RequestKind, TransactionId};
pub use crate::coordinator::Coordinator;
pub use crate::entity::{Entity, EntityKey, EntityStore, MemoryEntityStore, Query};
pub use crate::error::{Error, Result};
pub use crate::leases::{Lease, LeaseGrant, LeaseKey};
pub use crate::request::RequestContext;
pub use crate::safety::{EnforcementMode, PolicyKind, ViolationKind, WriteSite};
pub use crate::store::{InMemoryLeaseStore, LeaseStore};
pub use crate::util::Nonce;
