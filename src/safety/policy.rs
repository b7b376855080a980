use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::entity::Entity;

/// How entities of a kind may be written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    /// Never written by this system
    NeverWritten,
    /// Only concrete sub-kinds are written
    AbstractModel,
    /// Only written embedded in another entity
    StructuredProperty,
    /// Created once, never read-modify-written
    WrittenOnce,
    /// Read-modify-write must happen in a single transaction
    WrittenInTransaction,
    /// Read-modify-write must happen under the owning user's lock
    UserSpecific,
    /// Only written by scheduled jobs
    WrittenViaCron,
    /// Not checked
    Unsafe,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PolicyKind::NeverWritten => "never-written",
            PolicyKind::AbstractModel => "abstract-model",
            PolicyKind::StructuredProperty => "structured-property",
            PolicyKind::WrittenOnce => "written-once",
            PolicyKind::WrittenInTransaction => "written-in-transaction",
            PolicyKind::UserSpecific => "user-specific",
            PolicyKind::WrittenViaCron => "written-via-cron",
            PolicyKind::Unsafe => "unsafe",
        };
        f.write_str(name)
    }
}

/// Maps an entity to the id of the logical lock guarding it. `None` when the
/// entity cannot be mapped.
pub type LockIdFn = Arc<dyn Fn(&Entity) -> Option<String> + Send + Sync>;

/// The access policy declared for one entity kind
#[derive(Clone)]
pub struct EntityAccessPolicy {
    pub kind: PolicyKind,
    lock_id_fn: Option<LockIdFn>,
}

impl EntityAccessPolicy {
    pub fn new(kind: PolicyKind) -> Self {
        Self {
            kind,
            lock_id_fn: None,
        }
    }

    pub fn user_specific(lock_id_fn: LockIdFn) -> Self {
        Self {
            kind: PolicyKind::UserSpecific,
            lock_id_fn: Some(lock_id_fn),
        }
    }

    pub fn lock_id_for(&self, entity: &Entity) -> Option<String> {
        self.lock_id_fn.as_ref().and_then(|f| f(entity))
    }
}

impl fmt::Debug for EntityAccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityAccessPolicy")
            .field("kind", &self.kind)
            .field("lock_id_fn", &self.lock_id_fn.is_some())
            .finish()
    }
}

/// Access policies by entity kind. A kind's policy cannot change once
/// declared.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: RwLock<HashMap<String, EntityAccessPolicy>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the policy for `kind`. Panics if one is already declared.
    pub fn register(&self, kind: &str, policy: EntityAccessPolicy) {
        assert!(
            policy.lock_id_fn.is_none() || policy.kind == PolicyKind::UserSpecific,
            "Only user-specific kinds take a lock-id function ({kind} is {})",
            policy.kind
        );
        let mut policies = self.policies.write();
        if let Some(existing) = policies.get(kind) {
            panic!(
                "Access policy for {kind} already declared as {}; cannot redeclare as {}",
                existing.kind, policy.kind
            );
        }
        policies.insert(kind.to_string(), policy);
    }

    pub fn policy_for(&self, kind: &str) -> Option<EntityAccessPolicy> {
        self.policies.read().get(kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.policies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let registry = PolicyRegistry::new();
        registry.register("Video", EntityAccessPolicy::new(PolicyKind::NeverWritten));
        registry.register(
            "UserData",
            EntityAccessPolicy::user_specific(Arc::new(|e: &Entity| Some(e.key().name.clone()))),
        );

        assert_eq!(registry.policy_for("Video").unwrap().kind, PolicyKind::NeverWritten);
        assert!(registry.policy_for("Topic").is_none());

        let policy = registry.policy_for("UserData").unwrap();
        assert_eq!(
            policy.lock_id_for(&Entity::new("UserData", "u7")).as_deref(),
            Some("u7")
        );
        assert_eq!(PolicyKind::WrittenViaCron.to_string(), "written-via-cron");
    }

    #[test]
    #[should_panic(expected = "already declared")]
    fn test_redeclaring_panics() {
        let registry = PolicyRegistry::new();
        registry.register("Video", EntityAccessPolicy::new(PolicyKind::NeverWritten));
        registry.register("Video", EntityAccessPolicy::new(PolicyKind::Unsafe));
    }
}
