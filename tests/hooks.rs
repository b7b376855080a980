// Integration tests for access hooks on the entity store

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{json, Map};

use leasewarden::entity::{Cursor, Entity, EntityKey, EntityStore, MemoryEntityStore, Query};
use leasewarden::safety::PolicyKind;
use leasewarden::store::InMemoryLeaseStore;
use leasewarden::{Config, Coordinator, Error, RequestKind};

struct Fixture {
    coordinator: Coordinator,
    entities: Arc<MemoryEntityStore>,
    gets: Arc<AtomicUsize>,
    puts: Arc<AtomicUsize>,
}

async fn fixture() -> Fixture {
    let entities = Arc::new(MemoryEntityStore::new());
    let mut config = Config::for_tests();
    config.instance_id = Some("test-instance".into());
    let coordinator =
        Coordinator::new(config, Arc::new(InMemoryLeaseStore::new()), entities.clone()).unwrap();
    coordinator.register_policy("Counter", PolicyKind::WrittenInTransaction);

    let gets = Arc::new(AtomicUsize::new(0));
    let puts = Arc::new(AtomicUsize::new(0));
    {
        let gets = gets.clone();
        coordinator.add_after_get_hook(move |_, _| {
            gets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let puts = puts.clone();
        coordinator.add_before_put_hook(move |_, _, _| {
            puts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    for name in ["a", "b", "c", "d", "e"] {
        entities
            .put(Entity::new("Video", name).with("lang", "en").to_record())
            .await
            .unwrap();
    }
    Fixture {
        coordinator,
        entities,
        gets,
        puts,
    }
}

#[tokio::test]
async fn test_get_hooks_fire_once_per_returned_entity() {
    let f = fixture().await;
    let ctx = f.coordinator.begin_request(RequestKind::Interactive);
    let store = ctx.store();

    store.get(&ctx, &EntityKey::new("Video", "a")).await.unwrap().unwrap();
    assert_eq!(f.gets.load(Ordering::SeqCst), 1);

    // Absent results are ignored
    assert!(store.get(&ctx, &EntityKey::new("Video", "zz")).await.unwrap().is_none());
    let found = store
        .get_multi(
            &ctx,
            &[
                EntityKey::new("Video", "a"),
                EntityKey::new("Video", "zz"),
                EntityKey::new("Video", "b"),
            ],
        )
        .await
        .unwrap();
    assert_eq!(found.iter().flatten().count(), 2);
    assert_eq!(f.gets.load(Ordering::SeqCst), 3);

    let videos = store.fetch(&ctx, &Query::kind("Video").filter("lang", "en")).await.unwrap();
    assert_eq!(videos.len(), 5);
    assert_eq!(f.gets.load(Ordering::SeqCst), 8);

    // Keys only: nothing to hook
    let keys = store.fetch_keys(&Query::kind("Video")).await.unwrap();
    assert_eq!(keys.len(), 5);
    assert_eq!(f.gets.load(Ordering::SeqCst), 8);
    ctx.finish().await;
}

#[tokio::test]
async fn test_get_hooks_run_once_per_copy() {
    let f = fixture().await;
    let ctx = f.coordinator.begin_request(RequestKind::Interactive);
    let entity = ctx
        .store()
        .get(&ctx, &EntityKey::new("Video", "a"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(f.gets.load(Ordering::SeqCst), 1);

    // A nested hooked read of the same copy does not re-run the hooks
    ctx.store().hooks().run_get_hooks(&ctx, &entity, None).unwrap();
    assert_eq!(f.gets.load(Ordering::SeqCst), 1);
    ctx.finish().await;
}

#[tokio::test]
async fn test_iter_hooks_lazily() {
    let f = fixture().await;
    let ctx = f.coordinator.begin_request(RequestKind::Interactive);

    let mut stream = ctx.store().iter(&ctx, Query::kind("Video"), 2);
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.key().name, "a");
    assert_eq!(f.gets.load(Ordering::SeqCst), 1);

    let rest: Vec<Entity> = stream.map(Result::unwrap).collect().await;
    let names: Vec<&str> = rest.iter().map(|e| e.key().name.as_str()).collect();
    assert_eq!(names, vec!["b", "c", "d", "e"]);
    assert_eq!(f.gets.load(Ordering::SeqCst), 5);

    let limited: Vec<Entity> = ctx
        .store()
        .iter(&ctx, Query::kind("Video").offset(1).limit(3), 2)
        .map(Result::unwrap)
        .collect()
        .await;
    let names: Vec<&str> = limited.iter().map(|e| e.key().name.as_str()).collect();
    assert_eq!(names, vec!["b", "c", "d"]);
    ctx.finish().await;
}

#[tokio::test]
async fn test_fetch_page_follows_cursor() {
    let f = fixture().await;
    let ctx = f.coordinator.begin_request(RequestKind::Interactive);
    let query = Query::kind("Video");

    let mut cursor = None;
    let mut sizes = Vec::new();
    loop {
        let page = ctx.store().fetch_page(&ctx, &query, cursor, 2).await.unwrap();
        sizes.push(page.entities.len());
        if !page.more {
            assert!(page.next.is_none());
            break;
        }
        cursor = page.next;
    }
    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(f.gets.load(Ordering::SeqCst), 5);
    ctx.finish().await;
}

#[tokio::test]
async fn test_fetch_page_respects_query_limit() {
    let f = fixture().await;
    let ctx = f.coordinator.begin_request(RequestKind::Interactive);

    let pages = |query: Query, page_size: usize| {
        let ctx = &ctx;
        async move {
            let mut names = Vec::new();
            let mut sizes = Vec::new();
            let mut cursor = None;
            loop {
                let page = ctx.store().fetch_page(ctx, &query, cursor, page_size).await.unwrap();
                sizes.push(page.entities.len());
                names.extend(page.entities.iter().map(|e| e.key().name.clone()));
                if !page.more {
                    break;
                }
                cursor = page.next;
            }
            (sizes, names)
        }
    };

    let limited = Query::kind("Video").limit(3);
    let fetched = ctx.store().fetch(&ctx, &limited).await.unwrap();
    let (sizes, names) = pages(limited, 2).await;
    assert_eq!(fetched.len(), 3);
    assert_eq!(sizes, vec![2, 1]);
    assert_eq!(names, vec!["a", "b", "c"]);

    let (sizes, names) = pages(Query::kind("Video").offset(1).limit(3), 3).await;
    assert_eq!(sizes, vec![3]);
    assert_eq!(names, vec!["b", "c", "d"]);

    // A zero page size still advances
    let (sizes, _) = pages(Query::kind("Video"), 0).await;
    assert_eq!(sizes, vec![1; 5]);

    // A cursor past the limit yields nothing more
    let page = ctx
        .store()
        .fetch_page(&ctx, &Query::kind("Video").limit(2), Some(Cursor(4)), 2)
        .await
        .unwrap();
    assert!(page.entities.is_empty());
    assert!(!page.more);
    ctx.finish().await;
}

#[tokio::test]
async fn test_failing_put_hook_prevents_write() {
    let f = fixture().await;
    f.coordinator.add_before_put_hook(|_, entity, _| {
        if entity.kind() == "Frozen" {
            Err(Error::Other(anyhow::anyhow!("{} is frozen", entity.key())))
        } else {
            Ok(())
        }
    });
    let ctx = f.coordinator.begin_request(RequestKind::Interactive);
    let before = f.entities.put_count();

    let err = ctx
        .store()
        .put(&ctx, &Entity::new("Frozen", "f1"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Frozen:f1 is frozen"));

    let batch = [Entity::new("Video", "x"), Entity::new("Frozen", "f2")];
    assert!(ctx.store().put_multi(&ctx, &batch).await.is_err());
    assert_eq!(f.entities.put_count(), before);
    ctx.finish().await;
}

#[tokio::test]
async fn test_put_hooks_run_at_call_time() {
    let f = fixture().await;
    let ctx = f.coordinator.begin_request(RequestKind::Interactive);

    let batch = [Entity::new("Video", "x"), Entity::new("Video", "y")];
    let write = ctx.store().put_multi(&ctx, &batch);
    assert_eq!(f.puts.load(Ordering::SeqCst), 2);
    let before = f.entities.put_count();

    write.await.unwrap();
    assert_eq!(f.entities.put_count(), before + 2);
    assert_eq!(f.puts.load(Ordering::SeqCst), 2);
    ctx.finish().await;
}

#[tokio::test]
async fn test_deferred_put_completes_by_request_end() {
    let f = fixture().await;
    let ctx = f.coordinator.begin_request(RequestKind::Interactive);

    let write = ctx.store().put_deferred(&ctx, &Entity::new("Video", "late"));
    drop(write);
    ctx.finish().await;
    assert!(f
        .entities
        .get(&EntityKey::new("Video", "late"))
        .await
        .unwrap()
        .is_some());

    let ctx = f.coordinator.begin_request(RequestKind::Interactive);
    let key = ctx
        .store()
        .put_deferred(&ctx, &Entity::new("Video", "awaited"))
        .await
        .unwrap();
    assert_eq!(key, EntityKey::new("Video", "awaited"));
    ctx.finish().await;
}

#[tokio::test]
async fn test_deferred_get_uses_transaction_at_call_time() {
    let f = fixture().await;
    f.entities
        .put(Entity::new("Counter", "c1").with("n", 1).to_record())
        .await
        .unwrap();
    let ctx = f.coordinator.begin_request(RequestKind::Interactive);

    let (pending, txn) = {
        let txn = ctx.begin_transaction();
        let pending = ctx
            .store()
            .get_deferred(&ctx, EntityKey::new("Counter", "c1"));
        (pending, txn.id())
    };
    assert_eq!(ctx.current_transaction(), None);

    let counter = pending.await.unwrap().unwrap();
    assert_eq!(
        ctx.provenance().get(counter.instance()).transaction_at_get,
        Some(txn)
    );
    assert_eq!(f.gets.load(Ordering::SeqCst), 1);

    let err = ctx.store().put(&ctx, &counter).await.unwrap_err();
    assert!(err.to_string().contains("Did the put() outside a transaction: Counter"));
    ctx.finish().await;
}

#[tokio::test]
async fn test_get_or_insert() {
    let f = fixture().await;
    let ctx = f.coordinator.begin_request(RequestKind::Interactive);
    let key = EntityKey::new("Counter", "c9");

    let mut defaults = Map::new();
    defaults.insert("n".into(), json!(0));
    let created = ctx.store().get_or_insert(&ctx, &key, defaults.clone()).await.unwrap();
    assert_eq!(created.property("n"), Some(&json!(0)));
    assert_eq!(f.puts.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.current_transaction(), None);

    let existing = ctx.store().get_or_insert(&ctx, &key, defaults).await.unwrap();
    assert_ne!(existing.instance(), created.instance());
    assert_eq!(f.puts.load(Ordering::SeqCst), 1);
    assert!(ctx
        .provenance()
        .get(existing.instance())
        .transaction_at_get
        .is_some());
    ctx.finish().await;
}
