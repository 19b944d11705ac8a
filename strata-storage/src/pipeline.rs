//! Write/invalidate pipeline.
//!
//! Persist first, then evict. The pipeline never repopulates: the next read
//! does that from the authoritative row.

use std::collections::BTreeSet;
use std::sync::Arc;

use strata_core::{ColumnMap, EntityConfig, KeyTuple, StrataError, StrataResult};
use tracing::{debug, error, warn};

use crate::cache::CacheBackend;
use crate::store::RecordStore;

/// Per-record outcome of a write batch.
#[derive(Debug, Clone)]
pub struct WriteReport {
    /// Positionally aligned with the input records.
    pub results: Vec<StrataResult<KeyTuple>>,
    /// Cache keys evicted after the write.
    pub evicted: u64,
}

impl WriteReport {
    pub fn written(&self) -> impl Iterator<Item = &KeyTuple> {
        self.results.iter().filter_map(|r| r.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (usize, &StrataError)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().err().map(|e| (i, e)))
    }

    pub fn is_success(&self) -> bool {
        self.results.iter().all(Result::is_ok)
    }
}

/// Outcome of a delete batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: u64,
    pub evicted: u64,
}

/// Applies writes to the store and evicts the affected cache entries.
pub struct WritePipeline {
    store: Arc<dyn RecordStore>,
    cache: Arc<dyn CacheBackend>,
}

impl WritePipeline {
    pub fn new(store: Arc<dyn RecordStore>, cache: Arc<dyn CacheBackend>) -> Self {
        Self { store, cache }
    }

    /// Upsert records.
    ///
    /// Each record is prepared against the entity's write rules; records that
    /// fail preparation are reported individually and left out of the batch.
    /// The remaining records go to the store in one all-or-nothing call.
    pub async fn upsert(&self, entity: &EntityConfig, records: Vec<ColumnMap>) -> WriteReport {
        let mut results: Vec<StrataResult<KeyTuple>> = Vec::with_capacity(records.len());
        let mut batch = Vec::with_capacity(records.len());
        let mut batch_slots = Vec::with_capacity(records.len());

        for record in records {
            let prepared = entity
                .prepare_write(record)
                .and_then(|row| entity.key_of(&row).map(|key| (key, row)));
            match prepared {
                Ok((key, row)) => {
                    batch_slots.push(results.len());
                    results.push(Ok(key));
                    batch.push(row);
                }
                Err(e) => {
                    debug!(entity = %entity.name, error = %e, "Record rejected before write");
                    results.push(Err(e.into()));
                }
            }
        }

        if batch.is_empty() {
            return WriteReport {
                results,
                evicted: 0,
            };
        }

        if let Err(e) = self.store.upsert(entity, &batch).await {
            error!(
                entity = %entity.name,
                records = batch.len(),
                operation = "upsert",
                error = %e,
                "Store write failed"
            );
            for slot in batch_slots {
                results[slot] = Err(StrataError::from(e.clone()));
            }
            return WriteReport {
                results,
                evicted: 0,
            };
        }

        let written: Vec<KeyTuple> = batch_slots
            .iter()
            .filter_map(|&slot| results[slot].as_ref().ok().cloned())
            .collect();
        let evicted = self.evict(entity, &written).await;
        WriteReport { results, evicted }
    }

    /// Delete records by key, then evict them.
    pub async fn delete(&self, entity: &EntityConfig, keys: &[KeyTuple]) -> StrataResult<DeleteReport> {
        for key in keys {
            entity.check_key(key)?;
        }
        if keys.is_empty() {
            return Ok(DeleteReport::default());
        }
        let deleted = self.store.delete(entity, keys).await.map_err(|e| {
            error!(
                entity = %entity.name,
                keys = keys.len(),
                operation = "delete",
                error = %e,
                "Store delete failed"
            );
            StrataError::from(e)
        })?;
        let evicted = self.evict(entity, keys).await;
        Ok(DeleteReport { deleted, evicted })
    }

    /// Evict cache entries for `keys` without touching the store.
    pub async fn invalidate(&self, entity: &EntityConfig, keys: &[KeyTuple]) -> u64 {
        self.evict(entity, keys).await
    }

    /// Evict snapshots and dependent entries. Failures are logged only.
    async fn evict(&self, entity: &EntityConfig, keys: &[KeyTuple]) -> u64 {
        let cache_keys: BTreeSet<String> = keys
            .iter()
            .flat_map(|key| entity.eviction_keys(key))
            .collect();
        if cache_keys.is_empty() {
            return 0;
        }
        let cache_keys: Vec<String> = cache_keys.into_iter().collect();
        match self.cache.delete_many(&cache_keys).await {
            Ok(evicted) => evicted,
            Err(e) => {
                warn!(
                    entity = %entity.name,
                    keys = ?cache_keys,
                    error = %e,
                    "Cache eviction failed"
                );
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEntry, MemoryCache};
    use crate::memory_store::{MemoryStore, StoreOperation};
    use serde_json::json;
    use strata_core::{columns, WriteSpec};

    fn entity() -> EntityConfig {
        EntityConfig::new("article", "articles", &["article_id"], "article:")
            .with_extra_key_columns(&["lang"])
            .with_dependent("article_list:", 1)
            .with_write(WriteSpec {
                required: vec!["title".to_string()],
                ..Default::default()
            })
    }

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryCache>, WritePipeline) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let pipeline = WritePipeline::new(store.clone(), cache.clone());
        (store, cache, pipeline)
    }

    fn article(id: i64, title: &str) -> ColumnMap {
        columns([
            ("article_id", json!(id)),
            ("lang", json!("en")),
            ("title", json!(title)),
        ])
    }

    #[tokio::test]
    async fn test_upsert_evicts_snapshot_and_dependents() {
        let (store, cache, pipeline) = setup();
        cache
            .set_many(&[
                CacheEntry::new("article:1|en", "{}", None),
                CacheEntry::new("article_list:1", "[]", None),
                CacheEntry::new("article_list:2", "[]", None),
            ])
            .await
            .unwrap();

        let report = pipeline.upsert(&entity(), vec![article(1, "Hi")]).await;
        assert!(report.is_success());
        assert_eq!(report.evicted, 2);
        assert!(!cache.contains("article:1|en"));
        assert!(!cache.contains("article_list:1"));
        assert!(cache.contains("article_list:2"));
        assert_eq!(store.row_count("articles"), 1);
    }

    #[tokio::test]
    async fn test_invalid_record_reported_individually() {
        let (store, _cache, pipeline) = setup();
        let report = pipeline
            .upsert(
                &entity(),
                vec![article(1, "Hi"), columns([("article_id", json!(2)), ("lang", json!("en"))])],
            )
            .await;
        assert!(report.results[0].is_ok());
        assert!(matches!(report.results[1], Err(StrataError::Validation(_))));
        assert_eq!(store.row_count("articles"), 1);
    }

    #[tokio::test]
    async fn test_store_failure_fails_whole_batch_without_eviction() {
        let (store, cache, pipeline) = setup();
        cache
            .set_many(&[CacheEntry::new("article:1|en", "{}", None)])
            .await
            .unwrap();
        store.fail(StoreOperation::Upsert);
        let report = pipeline
            .upsert(&entity(), vec![article(1, "Hi"), article(2, "Yo")])
            .await;
        assert_eq!(report.failures().count(), 2);
        assert!(cache.contains("article:1|en"));
    }

    #[tokio::test]
    async fn test_eviction_failure_is_not_fatal() {
        let (store, cache, pipeline) = setup();
        cache.set_available(false);
        let report = pipeline.upsert(&entity(), vec![article(1, "Hi")]).await;
        assert!(report.is_success());
        assert_eq!(report.evicted, 0);
        assert_eq!(store.row_count("articles"), 1);
    }

    #[tokio::test]
    async fn test_delete_then_evict() {
        let (store, cache, pipeline) = setup();
        pipeline.upsert(&entity(), vec![article(1, "Hi")]).await;
        cache
            .set_many(&[CacheEntry::new("article:1|en", "{}", None)])
            .await
            .unwrap();
        let key = KeyTuple::new(vec![json!(1), json!("en")]);
        let report = pipeline.delete(&entity(), &[key]).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(store.row_count("articles"), 0);
        assert!(!cache.contains("article:1|en"));
    }
}
