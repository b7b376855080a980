// Integration tests for the request lifecycle: cleanup on every exit path

use std::sync::Arc;

use leasewarden::entity::{Entity, EntityKey, MemoryEntityStore};
use leasewarden::safety::PolicyKind;
use leasewarden::store::InMemoryLeaseStore;
use leasewarden::test_utils::init_tracing;
use leasewarden::{Config, Coordinator, Error, RequestKind};

fn setup() -> (Coordinator, Arc<InMemoryLeaseStore>) {
    init_tracing();
    let leases = Arc::new(InMemoryLeaseStore::new());
    let mut config = Config::for_tests();
    config.instance_id = Some("test-instance".into());
    let coordinator =
        Coordinator::new(config, leases.clone(), Arc::new(MemoryEntityStore::new())).unwrap();
    coordinator.register_policy("Video", PolicyKind::NeverWritten);
    (coordinator, leases)
}

#[tokio::test(start_paused = true)]
async fn test_run_request_returns_handler_result() {
    let (coordinator, leases) = setup();
    let value = coordinator
        .run_request(RequestKind::Interactive, |ctx| async move {
            ctx.acquire_user_lock("u1", None, None).await?;
            Ok(ctx.holder().to_string())
        })
        .await
        .unwrap();
    assert!(value.ends_with("(instance test-instance)"));
    assert_eq!(leases.peek("global_lock_write_lock_u1"), None);
}

#[tokio::test(start_paused = true)]
async fn test_locks_released_when_handler_fails() {
    let (coordinator, leases) = setup();
    let result: leasewarden::Result<()> = coordinator
        .run_request(RequestKind::Cron, |ctx| async move {
            ctx.acquire_user_lock("u1", None, None).await?;
            ctx.acquire_user_lock("u1", None, None).await?;
            ctx.acquire_lock("user:42", None, None).await?;
            ctx.store().put(&ctx, &Entity::new("Video", "v1")).await?;
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(Error::ConsistencyViolation { .. })));
    assert_eq!(leases.peek("global_lock_write_lock_u1"), None);
    assert_eq!(leases.peek("global_lock_user:42"), None);
}

#[tokio::test(start_paused = true)]
async fn test_locks_released_when_handler_panics() {
    let (coordinator, leases) = setup();
    let outcome = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            coordinator
                .run_request(RequestKind::Interactive, |ctx| async move {
                    ctx.acquire_user_lock("u1", None, None).await?;
                    ctx.acquire_lock("user:42", None, None).await?;
                    if ctx.user_lock_is_held("u1") {
                        panic!("handler bug");
                    }
                    Ok(())
                })
                .await
        }
    })
    .await;

    let err = outcome.unwrap_err();
    assert!(err.is_panic());
    assert_eq!(leases.peek("global_lock_write_lock_u1"), None);
    assert_eq!(leases.peek("global_lock_user:42"), None);

    // Another request can take the locks straight away
    let other = coordinator.begin_request(RequestKind::Interactive);
    other.acquire_user_lock("u1", None, None).await.unwrap();
    other.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_finish_flushes_fairness_marker() {
    let (coordinator, leases) = setup();
    let ctx = coordinator.begin_request(RequestKind::Interactive);
    ctx.acquire_lock("user:42", None, None).await.unwrap();
    ctx.release_lock("user:42").await;
    ctx.finish().await;
    assert_eq!(leases.peek("global_lock_user:42.interactive").as_deref(), Some("1"));
}

#[tokio::test]
async fn test_finish_clears_request_state() {
    let (coordinator, _leases) = setup();
    let ctx = coordinator.begin_request(RequestKind::Interactive);
    ctx.store()
        .put(&ctx, &Entity::new("Scratch", "s1"))
        .await
        .unwrap();
    let key = EntityKey::new("Scratch", "s1");
    let entity = ctx.store().get(&ctx, &key).await.unwrap().unwrap();
    assert_eq!(ctx.ledger().entries_for(&key).len(), 1);
    assert!(ctx.provenance().get(entity.instance()).get_nonce.is_some());

    let txn = ctx.begin_transaction();
    std::mem::forget(txn);
    ctx.finish().await;

    assert!(ctx.ledger().entries_for(&key).is_empty());
    assert!(ctx.provenance().is_empty());
    assert_eq!(ctx.current_transaction(), None);
}

#[tokio::test]
async fn test_requests_are_isolated() {
    let (coordinator, _leases) = setup();
    let first = coordinator.begin_request(RequestKind::Interactive);
    let second = coordinator.begin_request(RequestKind::Interactive);
    assert_ne!(first.holder(), second.holder());

    let _quiet = first.dangerously_suppress_checks();
    first
        .store()
        .put(&first, &Entity::new("Video", "v1"))
        .await
        .unwrap();
    assert!(second
        .store()
        .put(&second, &Entity::new("Video", "v2"))
        .await
        .is_err());

    let _txn = first.begin_transaction();
    assert!(first.current_transaction().is_some());
    assert_eq!(second.current_transaction(), None);
}
