// Persisted entities and the entity store contract.
//
// The store hands out records; every retrieval turns a record into a fresh
// in-memory Entity with its own InstanceId, so two reads of the same key are
// two distinguishable copies.

pub mod memory;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;

pub use memory::MemoryEntityStore;

/// Key of a persisted entity: its kind plus a name unique within the kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: String,
    pub name: String,
}

impl EntityKey {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Identity of one in-memory copy of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

impl InstanceId {
    fn next() -> Self {
        Self(NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed))
    }
}

/// An in-memory copy of a persisted (or to-be-persisted) entity.
///
/// Cloning yields a new copy with a new `InstanceId`; audit state recorded
/// for the original does not follow the clone.
#[derive(Debug)]
pub struct Entity {
    key: EntityKey,
    properties: Map<String, Value>,
    instance: InstanceId,
}

impl Entity {
    /// A newly created entity, not yet read from or written to the store
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_properties(EntityKey::new(kind, name), Map::new())
    }

    pub fn with_properties(key: EntityKey, properties: Map<String, Value>) -> Self {
        Self {
            key,
            properties,
            instance: InstanceId::next(),
        }
    }

    /// Materialise a stored record as a fresh copy
    pub fn from_record(record: EntityRecord) -> Self {
        Self::with_properties(record.key, record.properties)
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn kind(&self) -> &str {
        &self.key.kind
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    /// Builder form of `set`
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn to_record(&self) -> EntityRecord {
        EntityRecord {
            key: self.key.clone(),
            properties: self.properties.clone(),
        }
    }
}

impl Clone for Entity {
    fn clone(&self) -> Self {
        Self::with_properties(self.key.clone(), self.properties.clone())
    }
}

/// What the entity store persists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub key: EntityKey,
    pub properties: Map<String, Value>,
}

/// Query over one kind with property-equality filters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub kind: String,
    pub filters: Vec<(String, Value)>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Query {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn filter(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((property.into(), value.into()));
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &EntityRecord) -> bool {
        record.key.kind == self.kind
            && self
                .filters
                .iter()
                .all(|(name, value)| record.properties.get(name) == Some(value))
    }
}

/// Position in a query's results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor(pub usize);

/// One page of query results
#[derive(Debug)]
pub struct Page {
    pub entities: Vec<Entity>,
    /// Where the next page starts, if there is one
    pub next: Option<Cursor>,
    pub more: bool,
}

/// The persistent entity store.
///
/// Query results are ordered by key.
#[async_trait]
pub trait EntityStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &EntityKey) -> Result<Option<EntityRecord>>;
    async fn get_multi(&self, keys: &[EntityKey]) -> Result<Vec<Option<EntityRecord>>>;
    async fn query(&self, query: &Query) -> Result<Vec<EntityRecord>>;
    async fn query_keys(&self, query: &Query) -> Result<Vec<EntityKey>>;
    async fn put(&self, record: EntityRecord) -> Result<EntityKey>;
    async fn put_multi(&self, records: Vec<EntityRecord>) -> Result<Vec<EntityKey>>;
}
