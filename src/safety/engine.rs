// Consistency checks run on every hooked get and put

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::{EntityAccessPolicy, LockStamp, PolicyKind, PolicyRegistry, ViolationKind, WriteSite};
use crate::entity::Entity;
use crate::error::Result;
use crate::hooks::AccessHooks;
use crate::request::RequestContext;
use crate::util::Nonce;

const UNKNOWN_LOCK_ID: &str = "<unknown lock-id>";

/// Audits reads and writes against the declared access policies
#[derive(Debug)]
pub struct ConsistencyEngine {
    policies: Arc<PolicyRegistry>,
    installed: AtomicBool,
}

impl ConsistencyEngine {
    pub fn new(policies: Arc<PolicyRegistry>) -> Self {
        Self {
            policies,
            installed: AtomicBool::new(false),
        }
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    /// Register the checks as access hooks. Only the first call registers.
    pub fn install(self: &Arc<Self>, hooks: &AccessHooks) {
        if self.installed.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = Arc::clone(self);
        hooks.add_after_get_hook(move |ctx, entity| engine.record_get(ctx, entity));
        let engine = Arc::clone(self);
        hooks.add_before_put_hook(move |ctx, entity, site| engine.record_put(ctx, entity, site));
        debug!("Consistency checks installed");
    }

    /// Stamp a freshly read copy with what we need to check its put later
    pub fn record_get(&self, ctx: &RequestContext, entity: &Entity) -> Result<()> {
        let nonce = Nonce::generate();
        let lock_at_get = match self.policies.policy_for(entity.kind()) {
            Some(policy) if policy.kind == PolicyKind::UserSpecific => {
                Some(LockStamp::from_nonce(lock_nonce_for(ctx, entity, &policy)))
            }
            _ => None,
        };
        ctx.provenance().update(entity.instance(), |provenance| {
            provenance.get_nonce = Some(nonce);
            provenance.lock_at_get = lock_at_get;
        });
        ctx.ledger().record_get(entity.key(), nonce);
        Ok(())
    }

    /// Check a put against the kind's policy and the request's earlier puts
    pub fn record_put(&self, ctx: &RequestContext, entity: &Entity, site: &WriteSite) -> Result<()> {
        ctx.provenance()
            .update(entity.instance(), |provenance| provenance.has_been_put = true);

        // Kinds nobody declared a policy for are not ours to check
        let Some(policy) = self.policies.policy_for(entity.kind()) else {
            return Ok(());
        };
        check_policy(ctx, entity, &policy)?;
        check_tainted_put(ctx, entity, site)
    }
}

fn check_policy(ctx: &RequestContext, entity: &Entity, policy: &EntityAccessPolicy) -> Result<()> {
    let kind = entity.kind();
    let report = |violation, message| ctx.enforcement().report(violation, message);

    match policy.kind {
        PolicyKind::NeverWritten => report(
            ViolationKind::ForbiddenPut,
            format!("Seeing a put() on a never-written model: {kind}"),
        ),
        PolicyKind::AbstractModel => report(
            ViolationKind::ForbiddenPut,
            format!("Seeing a direct put() on an abstract model: {kind}"),
        ),
        PolicyKind::StructuredProperty => report(
            ViolationKind::ForbiddenPut,
            format!("Seeing a direct put() on a structured-property model: {kind}"),
        ),
        PolicyKind::WrittenOnce => {
            if ctx.provenance().get(entity.instance()).get_nonce.is_some() {
                report(
                    ViolationKind::WrittenOnce,
                    format!("Seeing a get() before put() for a written-once model: {kind}"),
                )
            } else {
                Ok(())
            }
        }
        PolicyKind::UserSpecific => check_user_lock(ctx, entity, policy),
        PolicyKind::WrittenInTransaction => {
            let provenance = ctx.provenance().get(entity.instance());
            // Newly created entities need no transaction
            if provenance.get_nonce.is_none() {
                return Ok(());
            }
            let at_get = provenance.transaction_at_get;
            let at_put = ctx.current_transaction();
            let message = match (at_get, at_put) {
                (None, None) => format!("Did not use a transaction: {kind}"),
                (None, Some(_)) => format!("Did the get() outside a transaction: {kind}"),
                (Some(_), None) => format!("Did the put() outside a transaction: {kind}"),
                (Some(get), Some(put)) if get != put => {
                    format!("Did the get() and put() in different transactions: {kind}")
                }
                _ => return Ok(()),
            };
            report(ViolationKind::Transaction, message)
        }
        PolicyKind::WrittenViaCron => {
            if ctx.info().kind.is_scheduled() {
                Ok(())
            } else {
                report(
                    ViolationKind::Cron,
                    format!("Written outside a task queue: {kind}"),
                )
            }
        }
        PolicyKind::Unsafe => Ok(()),
    }
}

// A fetched entity must be put under the same lock acquisition it was read
// under. A new entity only needs the lock at put time.
fn check_user_lock(ctx: &RequestContext, entity: &Entity, policy: &EntityAccessPolicy) -> Result<()> {
    let kind = entity.kind();
    let instance = entity.instance();
    let stamp = ctx.provenance().get(instance).lock_at_get;
    let put_nonce = lock_nonce_for(ctx, entity, policy);

    let newly_created = stamp.is_none();
    if let (true, Some(nonce)) = (newly_created, put_nonce) {
        ctx.provenance().update(instance, |provenance| {
            provenance.lock_at_get = Some(LockStamp::Held(nonce));
        });
    }

    let lock_id = policy
        .lock_id_for(entity)
        .unwrap_or_else(|| UNKNOWN_LOCK_ID.to_string());
    let message = if newly_created {
        if put_nonce.is_some() {
            return Ok(());
        }
        format!("Did not acquire user-lock for put() of a new entity {lock_id}: {kind}")
    } else {
        match (stamp.and_then(LockStamp::nonce), put_nonce) {
            (None, None) => format!("Did not acquire the user lock for {lock_id}: {kind}"),
            (None, Some(_)) => format!("Did get() before acquiring the user lock for {lock_id}: {kind}"),
            (Some(_), None) => format!("Did put() after releasing the user lock for {lock_id}: {kind}"),
            (Some(at_get), Some(at_put)) if at_get != at_put => {
                format!("Did a put() under a different lock than get() for {lock_id}: {kind}")
            }
            _ => return Ok(()),
        }
    };
    ctx.enforcement().report(ViolationKind::UserLock, message)
}

// Two copies of one entity read in this request: if the other copy was put
// after ours was read, putting ours now silently drops that write.
fn check_tainted_put(ctx: &RequestContext, entity: &Entity, site: &WriteSite) -> Result<()> {
    let Some(nonce) = ctx.provenance().get(entity.instance()).get_nonce else {
        return Ok(());
    };
    let ledger = ctx.ledger();
    ledger.record_put(entity.key(), nonce, site.clone());
    for other in ledger.conflicting_puts(entity.key(), nonce) {
        ctx.enforcement().report(
            ViolationKind::TaintedWrite,
            format!(
                "Did a put() of the same entity from two different copies: {}.  Other put:\n---\n{other}---\nThis put:\n---\n{site}---\n",
                entity.key()
            ),
        )?;
    }
    Ok(())
}

fn lock_nonce_for(ctx: &RequestContext, entity: &Entity, policy: &EntityAccessPolicy) -> Option<Nonce> {
    match policy.lock_id_for(entity) {
        Some(lock_id) => ctx.user_lock_nonce(&lock_id),
        None => {
            info!(kind = entity.kind(), "Entity has no lock id; checking against any held user lock");
            ctx.any_user_lock_nonce()
        }
    }
}
