use std::collections::VecDeque;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use super::AccessHooks;
use crate::context::TransactionId;
use crate::entity::{Cursor, Entity, EntityKey, EntityRecord, EntityStore, Page, Query};
use crate::error::{Error, Result};
use crate::request::RequestContext;
use crate::safety::{AuditCheckpoint, WriteSite};

/// Entity store client that runs access hooks around every read and write.
///
/// Reads run the get hooks on each entity returned. Writes run the put hooks
/// before the write is issued; a failing hook means the write never happens.
#[derive(Clone)]
pub struct HookedStore {
    inner: Arc<dyn EntityStore>,
    hooks: Arc<AccessHooks>,
}

impl HookedStore {
    pub fn new(inner: Arc<dyn EntityStore>, hooks: Arc<AccessHooks>) -> Self {
        Self { inner, hooks }
    }

    pub fn hooks(&self) -> &Arc<AccessHooks> {
        &self.hooks
    }

    pub async fn get(&self, ctx: &RequestContext, key: &EntityKey) -> Result<Option<Entity>> {
        let transaction = ctx.current_transaction();
        let found = self.inner.get(key).await?.map(Entity::from_record);
        if let Some(entity) = &found {
            self.hooks.run_get_hooks(ctx, entity, transaction)?;
        }
        Ok(found)
    }

    pub async fn get_multi(&self, ctx: &RequestContext, keys: &[EntityKey]) -> Result<Vec<Option<Entity>>> {
        let transaction = ctx.current_transaction();
        let found: Vec<Option<Entity>> = self
            .inner
            .get_multi(keys)
            .await?
            .into_iter()
            .map(|record| record.map(Entity::from_record))
            .collect();
        for entity in found.iter().flatten() {
            self.hooks.run_get_hooks(ctx, entity, transaction)?;
        }
        Ok(found)
    }

    /// Start a read now and finish it later. The read is audited against the
    /// transaction active at this call, not the one active when awaited.
    pub fn get_deferred(
        &self,
        ctx: &Arc<RequestContext>,
        key: EntityKey,
    ) -> BoxFuture<'static, Result<Option<Entity>>> {
        let transaction = ctx.current_transaction();
        let inner = Arc::clone(&self.inner);
        let hooks = Arc::clone(&self.hooks);
        let ctx = Arc::clone(ctx);
        let fetch = tokio::spawn(async move { inner.get(&key).await });
        async move {
            let record = fetch
                .await
                .map_err(|e| Error::EntityStore(format!("deferred get did not complete: {e}")))??;
            let found = record.map(Entity::from_record);
            if let Some(entity) = &found {
                hooks.run_get_hooks(&ctx, entity, transaction)?;
            }
            Ok(found)
        }
        .boxed()
    }

    pub async fn fetch(&self, ctx: &RequestContext, query: &Query) -> Result<Vec<Entity>> {
        let transaction = ctx.current_transaction();
        let entities = materialise(self.inner.query(query).await?);
        self.run_get_hooks_all(ctx, &entities, transaction)?;
        Ok(entities)
    }

    /// One page of `query`, starting at `cursor` (or the query's own offset).
    /// Pages never run past the query's own limit.
    pub async fn fetch_page(
        &self,
        ctx: &RequestContext,
        query: &Query,
        cursor: Option<Cursor>,
        page_size: usize,
    ) -> Result<Page> {
        let page_size = page_size.max(1);
        let transaction = ctx.current_transaction();
        let start = cursor.map_or(query.offset, |cursor| cursor.0);

        // Rows the query still allows from `start`, if it is limited
        let remaining = query
            .limit
            .map(|limit| query.offset.saturating_add(limit).saturating_sub(start));
        let wanted = remaining.map_or(page_size, |remaining| remaining.min(page_size));
        let mut records = if wanted == 0 {
            Vec::new()
        } else {
            self.inner
                .query(&query.clone().offset(start).limit(wanted.saturating_add(1)))
                .await?
        };
        let more = records.len() > wanted && remaining.is_none_or(|remaining| remaining > wanted);
        records.truncate(wanted);

        let entities = materialise(records);
        self.run_get_hooks_all(ctx, &entities, transaction)?;
        Ok(Page {
            next: more.then(|| Cursor(start + entities.len())),
            entities,
            more,
        })
    }

    /// Keys only: nothing is materialised, so no hooks run
    pub async fn fetch_keys(&self, query: &Query) -> Result<Vec<EntityKey>> {
        self.inner.query_keys(query).await
    }

    /// Lazily stream the results of `query`, reading `batch_size` at a time.
    /// Each entity is audited as it is produced.
    pub fn iter<'a>(
        &'a self,
        ctx: &'a RequestContext,
        query: Query,
        batch_size: usize,
    ) -> BoxStream<'a, Result<Entity>> {
        let batch_size = batch_size.max(1);
        let transaction = ctx.current_transaction();
        let limit = query.limit;
        let state = IterState {
            offset: query.offset,
            query,
            buffered: VecDeque::new(),
            exhausted: false,
        };

        let entities = stream::unfold(state, move |mut state| async move {
            if state.buffered.is_empty() && !state.exhausted {
                let batch = state.query.clone().offset(state.offset).limit(batch_size);
                match self.inner.query(&batch).await {
                    Ok(records) => {
                        state.exhausted = records.len() < batch_size;
                        state.offset += records.len();
                        state
                            .buffered
                            .extend(records.into_iter().map(Entity::from_record));
                    }
                    Err(e) => {
                        state.exhausted = true;
                        return Some((Err(e), state));
                    }
                }
            }
            let entity = state.buffered.pop_front()?;
            let audited = self
                .hooks
                .run_get_hooks(ctx, &entity, transaction)
                .map(|()| entity);
            Some((audited, state))
        });

        match limit {
            Some(limit) => entities.take(limit).boxed(),
            None => entities.boxed(),
        }
    }

    /// Read `key`, creating it with `defaults` if absent. Runs inside the
    /// ambient transaction, or a new one if there is none.
    pub async fn get_or_insert(
        &self,
        ctx: &RequestContext,
        key: &EntityKey,
        defaults: Map<String, Value>,
    ) -> Result<Entity> {
        let _transaction = ctx.current_transaction().is_none().then(|| ctx.begin_transaction());
        if let Some(existing) = self.get(ctx, key).await? {
            return Ok(existing);
        }
        let created = Entity::with_properties(key.clone(), defaults);
        self.put(ctx, &created).await?;
        Ok(created)
    }

    /// Write `entity`. The put hooks run now, at the call; the write happens
    /// when the returned future is awaited.
    #[track_caller]
    pub fn put(&self, ctx: &RequestContext, entity: &Entity) -> BoxFuture<'static, Result<EntityKey>> {
        let site = WriteSite::new(Location::caller(), ctx.captures_backtraces());
        if let Err(e) = self.admit_puts(ctx, std::slice::from_ref(entity), &site) {
            return future::ready(Err(e)).boxed();
        }
        let inner = Arc::clone(&self.inner);
        let record = entity.to_record();
        async move { inner.put(record).await }.boxed()
    }

    #[track_caller]
    pub fn put_multi(
        &self,
        ctx: &RequestContext,
        entities: &[Entity],
    ) -> BoxFuture<'static, Result<Vec<EntityKey>>> {
        let site = WriteSite::new(Location::caller(), ctx.captures_backtraces());
        if let Err(e) = self.admit_puts(ctx, entities, &site) {
            return future::ready(Err(e)).boxed();
        }
        let inner = Arc::clone(&self.inner);
        let records = entities.iter().map(Entity::to_record).collect();
        async move { inner.put_multi(records).await }.boxed()
    }

    /// Like `put`, but the write starts immediately and completes even if
    /// the returned future is dropped. The request waits for it at finish.
    #[track_caller]
    pub fn put_deferred(&self, ctx: &RequestContext, entity: &Entity) -> BoxFuture<'static, Result<EntityKey>> {
        let site = WriteSite::new(Location::caller(), ctx.captures_backtraces());
        if let Err(e) = self.admit_puts(ctx, std::slice::from_ref(entity), &site) {
            return future::ready(Err(e)).boxed();
        }
        let inner = Arc::clone(&self.inner);
        let record = entity.to_record();
        let (tx, rx) = oneshot::channel();
        ctx.deferred().push(tokio::spawn(async move {
            let _ = tx.send(inner.put(record).await);
        }));
        async move {
            rx.await
                .map_err(|_| Error::EntityStore("deferred put did not complete".into()))?
        }
        .boxed()
    }

    // Run the put hooks for every entity of one write. If any hook fails the
    // write is rejected and the audit records of the whole write are undone.
    fn admit_puts(&self, ctx: &RequestContext, entities: &[Entity], site: &WriteSite) -> Result<()> {
        let checkpoint = AuditCheckpoint::take(ctx.provenance(), ctx.ledger(), entities);
        for entity in entities {
            if let Err(e) = self.hooks.run_put_hooks(ctx, entity, site) {
                checkpoint.restore(ctx.provenance(), ctx.ledger());
                return Err(e);
            }
        }
        Ok(())
    }

    fn run_get_hooks_all(
        &self,
        ctx: &RequestContext,
        entities: &[Entity],
        transaction: Option<TransactionId>,
    ) -> Result<()> {
        for entity in entities {
            self.hooks.run_get_hooks(ctx, entity, transaction)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HookedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookedStore")
            .field("inner", &self.inner)
            .field("hooks", &self.hooks)
            .finish()
    }
}

fn materialise(records: Vec<EntityRecord>) -> Vec<Entity> {
    records.into_iter().map(Entity::from_record).collect()
}

struct IterState {
    query: Query,
    offset: usize,
    buffered: VecDeque<Entity>,
    exhausted: bool,
}
