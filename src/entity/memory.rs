use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

use super::{EntityKey, EntityRecord, EntityStore, Query};
use crate::Result;

/// Entity store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    data: DashMap<EntityKey, Map<String, Value>>,
    puts: AtomicUsize,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records written so far
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn record(&self, key: &EntityKey) -> Option<EntityRecord> {
        self.data.get(key).map(|properties| EntityRecord {
            key: key.clone(),
            properties: properties.clone(),
        })
    }

    fn matching(&self, query: &Query) -> Vec<EntityRecord> {
        let mut records: Vec<EntityRecord> = self
            .data
            .iter()
            .map(|entry| EntityRecord {
                key: entry.key().clone(),
                properties: entry.value().clone(),
            })
            .filter(|record| query.matches(record))
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn get(&self, key: &EntityKey) -> Result<Option<EntityRecord>> {
        Ok(self.record(key))
    }

    async fn get_multi(&self, keys: &[EntityKey]) -> Result<Vec<Option<EntityRecord>>> {
        Ok(keys.iter().map(|key| self.record(key)).collect())
    }

    async fn query(&self, query: &Query) -> Result<Vec<EntityRecord>> {
        Ok(self.matching(query))
    }

    async fn query_keys(&self, query: &Query) -> Result<Vec<EntityKey>> {
        Ok(self.matching(query).into_iter().map(|record| record.key).collect())
    }

    async fn put(&self, record: EntityRecord) -> Result<EntityKey> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.data.insert(record.key.clone(), record.properties);
        Ok(record.key)
    }

    async fn put_multi(&self, records: Vec<EntityRecord>) -> Result<Vec<EntityKey>> {
        let mut keys = Vec::with_capacity(records.len());
        for record in records {
            keys.push(self.put(record).await?);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    #[tokio::test]
    async fn test_put_get_query() {
        let store = MemoryEntityStore::new();
        for name in ["c", "a", "b"] {
            store
                .put(Entity::new("Video", name).with("lang", "en").to_record())
                .await
                .unwrap();
        }
        store.put(Entity::new("Topic", "t").to_record()).await.unwrap();
        assert_eq!(store.put_count(), 4);

        let found = store.get(&EntityKey::new("Video", "a")).await.unwrap().unwrap();
        assert_eq!(found.properties.get("lang"), Some(&Value::from("en")));
        assert!(store.get(&EntityKey::new("Video", "z")).await.unwrap().is_none());

        let names: Vec<String> = store
            .query_keys(&Query::kind("Video").offset(1).limit(5))
            .await
            .unwrap()
            .into_iter()
            .map(|key| key.name)
            .collect();
        assert_eq!(names, vec!["b", "c"]);
    }
}
