// Access hooks: callbacks run on every entity read and write.
//
// Hooks are registered on an AccessHooks registry and run by the HookedStore
// wrapped around the entity store at construction time.

pub mod store;

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::TransactionId;
use crate::entity::{Entity, EntityStore};
use crate::error::Result;
use crate::request::RequestContext;
use crate::safety::WriteSite;

pub use store::HookedStore;

/// Runs before an entity is written. An error prevents the write.
pub type PutHook = Arc<dyn Fn(&RequestContext, &Entity, &WriteSite) -> Result<()> + Send + Sync>;

/// Runs after an entity is read
pub type GetHook = Arc<dyn Fn(&RequestContext, &Entity) -> Result<()> + Send + Sync>;

#[derive(Default)]
pub struct AccessHooks {
    put_hooks: RwLock<Vec<PutHook>>,
    get_hooks: RwLock<Vec<GetHook>>,
}

impl AccessHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_before_put_hook(
        &self,
        hook: impl Fn(&RequestContext, &Entity, &WriteSite) -> Result<()> + Send + Sync + 'static,
    ) {
        self.put_hooks.write().push(Arc::new(hook));
    }

    pub fn add_after_get_hook(
        &self,
        hook: impl Fn(&RequestContext, &Entity) -> Result<()> + Send + Sync + 'static,
    ) {
        self.get_hooks.write().push(Arc::new(hook));
    }

    pub fn put_hook_count(&self) -> usize {
        self.put_hooks.read().len()
    }

    pub fn get_hook_count(&self) -> usize {
        self.get_hooks.read().len()
    }

    /// Wrap `store` so that reads and writes through it run these hooks
    pub fn wrap(self: &Arc<Self>, store: Arc<dyn EntityStore>) -> HookedStore {
        HookedStore::new(store, Arc::clone(self))
    }

    pub fn run_put_hooks(&self, ctx: &RequestContext, entity: &Entity, site: &WriteSite) -> Result<()> {
        let hooks = self.put_hooks.read().clone();
        for hook in hooks {
            hook(ctx, entity, site)?;
        }
        Ok(())
    }

    /// Run the get hooks for a freshly read copy, at most once per copy.
    /// `transaction` is the one active when the read was issued.
    pub fn run_get_hooks(
        &self,
        ctx: &RequestContext,
        entity: &Entity,
        transaction: Option<TransactionId>,
    ) -> Result<()> {
        if !ctx.provenance().mark_hooks_run(entity.instance(), transaction) {
            return Ok(());
        }
        let hooks = self.get_hooks.read().clone();
        for hook in hooks {
            hook(ctx, entity)?;
        }
        Ok(())
    }
}

impl fmt::Debug for AccessHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessHooks")
            .field("put_hooks", &self.put_hook_count())
            .field("get_hooks", &self.get_hook_count())
            .finish()
    }
}
