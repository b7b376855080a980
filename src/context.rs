// Execution context: what kind of request is running, in which environment,
// and under which (if any) datastore transaction.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::leases::HolderToken;
use crate::util::instance_id;

/// Deployment environment. Violations raise in `Test`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
    Test,
}

/// How the current request was started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// A user-facing request with a short deadline
    Interactive,
    /// A task-queue request. `deferred` marks ad-hoc deferred work, which is
    /// not a scheduled job.
    Task { queue: String, deferred: bool },
    /// A scheduled job
    Cron,
}

impl RequestKind {
    pub fn task(queue: impl Into<String>) -> Self {
        RequestKind::Task {
            queue: queue.into(),
            deferred: false,
        }
    }

    pub fn deferred_task(queue: impl Into<String>) -> Self {
        RequestKind::Task {
            queue: queue.into(),
            deferred: true,
        }
    }

    /// Interactive callers get priority over batch callers for contended locks
    pub fn is_interactive(&self) -> bool {
        matches!(self, RequestKind::Interactive)
    }

    /// Whether this is a scheduled background context (cron or a
    /// non-deferred task queue)
    pub fn is_scheduled(&self) -> bool {
        match self {
            RequestKind::Interactive => false,
            RequestKind::Task { deferred, .. } => !deferred,
            RequestKind::Cron => true,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Interactive => write!(f, "interactive"),
            RequestKind::Task { queue, deferred: false } => write!(f, "task({queue})"),
            RequestKind::Task { queue, deferred: true } => write!(f, "deferred-task({queue})"),
            RequestKind::Cron => write!(f, "cron"),
        }
    }
}

/// Identifier of an entity-store transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0.simple())
    }
}

/// Identity of one request: who it is (for lock holder tokens) and what kind
/// of work it does.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub request_id: String,
    pub instance_id: String,
    pub kind: RequestKind,
}

impl RequestInfo {
    /// A request with a fresh random id on the given instance
    pub fn new(kind: RequestKind, instance: Option<&str>) -> Self {
        Self {
            request_id: Uuid::new_v4().simple().to_string(),
            instance_id: instance_id(instance),
            kind,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// The value this request writes into the lease store when it holds a lease
    pub fn holder_token(&self) -> HolderToken {
        HolderToken::new(&self.request_id, &self.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_kind_classification() {
        assert!(RequestKind::Interactive.is_interactive());
        assert!(!RequestKind::Interactive.is_scheduled());
        assert!(RequestKind::Cron.is_scheduled());
        assert!(RequestKind::task("backfill").is_scheduled());
        assert!(!RequestKind::deferred_task("deferred").is_scheduled());
        assert!(!RequestKind::task("backfill").is_interactive());
    }

    #[test]
    fn test_holder_token_names_request_and_instance() {
        let info = RequestInfo::new(RequestKind::Interactive, Some("i-3")).with_request_id("r-9");
        assert_eq!(info.holder_token().as_str(), "r-9 (instance i-3)");
    }
}
