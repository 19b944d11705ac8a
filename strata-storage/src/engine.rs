//! Entity-name facade over the resolver and the write pipeline.

use std::sync::Arc;

use strata_core::{
    ColumnMap, EngineConfig, EntityConfig, EntityRegistry, Filter, KeyTuple, StrataResult,
};

use crate::cache::CacheBackend;
use crate::pipeline::{DeleteReport, WritePipeline, WriteReport};
use crate::resolver::{ResolveRequest, Resolved, Resolver};
use crate::store::RecordStore;

/// The object-access engine: registry, resolver and pipeline sharing one
/// store and one cache.
pub struct Engine {
    registry: EntityRegistry,
    resolver: Resolver,
    pipeline: WritePipeline,
    store: Arc<dyn RecordStore>,
    cache: Arc<dyn CacheBackend>,
}

impl Engine {
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn RecordStore>,
        cache: Arc<dyn CacheBackend>,
    ) -> StrataResult<Self> {
        config.validate()?;
        let registry = config.registry()?;
        Ok(Self::with_registry(registry, config, store, cache))
    }

    /// Use an already built registry, e.g. one extended with built-in
    /// entities.
    pub fn with_registry(
        registry: EntityRegistry,
        config: &EngineConfig,
        store: Arc<dyn RecordStore>,
        cache: Arc<dyn CacheBackend>,
    ) -> Self {
        tracing::info!(
            entities = registry.len(),
            cache_enabled = config.cache.enabled,
            "Engine initialized"
        );
        Self {
            resolver: Resolver::new(store.clone(), cache.clone(), config.cache.clone()),
            pipeline: WritePipeline::new(store.clone(), cache.clone()),
            registry,
            store,
            cache,
        }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn entity(&self, name: &str) -> StrataResult<Arc<EntityConfig>> {
        Ok(self.registry.get(name)?)
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn pipeline(&self) -> &WritePipeline {
        &self.pipeline
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.cache
    }

    pub async fn resolve(&self, entity: &str, request: &ResolveRequest) -> StrataResult<Resolved> {
        let entity = self.entity(entity)?;
        self.resolver.resolve(&entity, request).await
    }

    pub async fn scan(&self, entity: &str, filter: &Filter) -> StrataResult<Vec<ColumnMap>> {
        let entity = self.entity(entity)?;
        self.resolver.scan(&entity, filter, None).await
    }

    pub async fn upsert(&self, entity: &str, records: Vec<ColumnMap>) -> StrataResult<WriteReport> {
        let entity = self.entity(entity)?;
        Ok(self.pipeline.upsert(&entity, records).await)
    }

    pub async fn delete(&self, entity: &str, keys: &[KeyTuple]) -> StrataResult<DeleteReport> {
        let entity = self.entity(entity)?;
        self.pipeline.delete(&entity, keys).await
    }

    pub async fn invalidate(&self, entity: &str, keys: &[KeyTuple]) -> StrataResult<u64> {
        let entity = self.entity(entity)?;
        Ok(self.pipeline.invalidate(&entity, keys).await)
    }
}
