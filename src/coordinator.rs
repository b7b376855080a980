// Process-wide services shared by all requests, and the request lifecycle.

use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::context::{RequestInfo, RequestKind};
use crate::entity::{Entity, EntityStore};
use crate::error::Result;
use crate::hooks::{AccessHooks, HookedStore};
use crate::leases::LeaseManager;
use crate::request::RequestContext;
use crate::safety::{ConsistencyEngine, EntityAccessPolicy, PolicyKind, PolicyRegistry, WriteSite};
use crate::store::LeaseStore;

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) leases: Arc<LeaseManager>,
    pub(crate) policies: Arc<PolicyRegistry>,
    pub(crate) hooks: Arc<AccessHooks>,
    pub(crate) engine: Arc<ConsistencyEngine>,
    pub(crate) store: HookedStore,
}

/// Entry point: owns the lease manager, the access policies and hooks, and
/// the hooked entity store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    /// Build the coordinator over the given stores, with consistency checks
    /// installed.
    pub fn new(
        config: Config,
        lease_store: Arc<dyn LeaseStore>,
        entity_store: Arc<dyn EntityStore>,
    ) -> Result<Self> {
        config.validate()?;

        let leases = Arc::new(LeaseManager::new(lease_store, config.leases.clone()));
        let policies = Arc::new(PolicyRegistry::new());
        let hooks = Arc::new(AccessHooks::new());
        let engine = Arc::new(ConsistencyEngine::new(Arc::clone(&policies)));
        engine.install(&hooks);
        let store = hooks.wrap(entity_store);

        info!(
            environment = ?config.environment,
            enforcement = ?config.safety.default_enforcement,
            "Coordinator started"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                leases,
                policies,
                hooks,
                engine,
                store,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.shared.leases
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.shared.policies
    }

    pub fn hooks(&self) -> &Arc<AccessHooks> {
        &self.shared.hooks
    }

    pub fn engine(&self) -> &Arc<ConsistencyEngine> {
        &self.shared.engine
    }

    pub fn store(&self) -> &HookedStore {
        &self.shared.store
    }

    /// Declare how entities of `kind` may be written. Panics if `kind`
    /// already has a policy.
    pub fn register_policy(&self, kind: &str, policy: PolicyKind) {
        self.shared
            .policies
            .register(kind, EntityAccessPolicy::new(policy));
    }

    /// Declare `kind` user-specific: writes happen under the user lock named
    /// by `lock_id_fn`
    pub fn register_user_specific(
        &self,
        kind: &str,
        lock_id_fn: impl Fn(&Entity) -> Option<String> + Send + Sync + 'static,
    ) {
        self.shared
            .policies
            .register(kind, EntityAccessPolicy::user_specific(Arc::new(lock_id_fn)));
    }

    pub fn add_before_put_hook(
        &self,
        hook: impl Fn(&RequestContext, &Entity, &WriteSite) -> Result<()> + Send + Sync + 'static,
    ) {
        self.shared.hooks.add_before_put_hook(hook);
    }

    pub fn add_after_get_hook(
        &self,
        hook: impl Fn(&RequestContext, &Entity) -> Result<()> + Send + Sync + 'static,
    ) {
        self.shared.hooks.add_after_get_hook(hook);
    }

    /// Start a request of `kind` on this instance. The caller must
    /// `finish()` it; `run_request` does that automatically.
    pub fn begin_request(&self, kind: RequestKind) -> Arc<RequestContext> {
        let info = RequestInfo::new(kind, self.shared.config.instance_id.as_deref());
        self.begin_request_with(info)
    }

    pub fn begin_request_with(&self, info: RequestInfo) -> Arc<RequestContext> {
        debug!(request = %info.request_id, kind = %info.kind, "Request started");
        Arc::new(RequestContext::new(info, Arc::clone(&self.shared)))
    }

    /// Run `handler` as one request. Its locks are released and deferred
    /// writes resolved however it exits, panics included.
    pub async fn run_request<F, Fut, T>(&self, kind: RequestKind, handler: F) -> Result<T>
    where
        F: FnOnce(Arc<RequestContext>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ctx = self.begin_request(kind);
        let handler_ctx = Arc::clone(&ctx);
        let outcome = AssertUnwindSafe(async move { handler(handler_ctx).await })
            .catch_unwind()
            .await;
        ctx.finish().await;

        match outcome {
            Ok(result) => {
                if let Err(e) = &result {
                    debug!(request = %ctx.info().request_id, error = %e, "Request failed");
                }
                result
            }
            Err(panic) => {
                error!(request = %ctx.info().request_id, "Request handler panicked");
                resume_unwind(panic)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::MemoryEntityStore;
    use crate::store::InMemoryLeaseStore;

    #[test]
    fn test_checks_install_once() {
        let coordinator = Coordinator::new(
            Config::for_tests(),
            Arc::new(InMemoryLeaseStore::new()),
            Arc::new(MemoryEntityStore::new()),
        )
        .unwrap();
        assert_eq!(coordinator.hooks().put_hook_count(), 1);
        assert_eq!(coordinator.hooks().get_hook_count(), 1);

        coordinator.engine().install(coordinator.hooks());
        assert_eq!(coordinator.hooks().put_hook_count(), 1);
        assert_eq!(coordinator.hooks().get_hook_count(), 1);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = Config::for_tests();
        config.leases.release_attempts = 0;
        let result = Coordinator::new(
            config,
            Arc::new(InMemoryLeaseStore::new()),
            Arc::new(MemoryEntityStore::new()),
        );
        assert!(result.is_err());
    }
}
