//! Cache-or-store resolver.
//!
//! One cache round trip for every requested key, one store query for
//! whatever the cache could not answer, then optional repopulation. A cached
//! snapshot that fails the request filter is dropped outright; one that lacks
//! a required column, fails to decode, or holds a condition the cache tier
//! cannot decide is fetched again from the store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use strata_core::{
    now_epoch, CacheSettings, ColumnMap, EntityConfig, Evaluation, Filter, KeyTuple, StoreError,
    StrataError, StrataResult, Tier,
};
use tracing::{debug, error, warn};

use crate::cache::snapshot;
use crate::cache::{CacheBackend, CacheEntry};
use crate::store::RecordStore;

/// Per-request switches. Defaults come from [`CacheSettings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    pub use_cache: bool,
    pub repopulate: bool,
    pub check_shape: bool,
}

impl From<&CacheSettings> for ResolveOptions {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            use_cache: settings.enabled,
            repopulate: settings.repopulate,
            check_shape: settings.check_shape,
        }
    }
}

/// What to read.
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    /// Full key tuples. Empty means an unbounded scan that bypasses the cache.
    pub keys: Vec<KeyTuple>,
    /// Required columns. Rows are projected to these plus the key columns.
    pub columns: Option<Vec<String>>,
    pub filter: Filter,
    /// Overrides the resolver's configured switches.
    pub options: Option<ResolveOptions>,
}

impl ResolveRequest {
    pub fn keys(keys: impl IntoIterator<Item = KeyTuple>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn scan(filter: Filter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn with_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_options(mut self, options: ResolveOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Per-key outcome. Filtered-out keys have no entry at all.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(ColumnMap),
    Missing,
    /// The store failed; the record may well exist.
    Error(StoreError),
}

/// Counters describing how a resolve was served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    pub requested: usize,
    pub cache_hits: usize,
    /// Snapshots lacking a required column.
    pub shape_repairs: usize,
    /// Snapshots holding a condition the cache tier cannot evaluate.
    pub undecidable: usize,
    /// Snapshots that failed to decode.
    pub corrupt: usize,
    /// Snapshots dropped by the filter.
    pub filtered: usize,
    /// Rows returned by the store.
    pub store_fetched: usize,
    pub repopulated: usize,
}

/// Result of [`Resolver::resolve`].
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    entries: BTreeMap<String, (KeyTuple, Resolution)>,
    filtered: Vec<KeyTuple>,
    pub stats: ResolveStats,
}

impl Resolved {
    fn insert(&mut self, key: KeyTuple, resolution: Resolution) {
        self.entries.insert(key.encode(), (key, resolution));
    }

    pub fn get(&self, key: &KeyTuple) -> Option<&Resolution> {
        self.entries.get(&key.encode()).map(|(_, r)| r)
    }

    /// The record for `key`, if found.
    pub fn record(&self, key: &KeyTuple) -> Option<&ColumnMap> {
        match self.get(key) {
            Some(Resolution::Found(row)) => Some(row),
            _ => None,
        }
    }

    pub fn found(&self) -> impl Iterator<Item = (&KeyTuple, &ColumnMap)> {
        self.entries.values().filter_map(|(key, r)| match r {
            Resolution::Found(row) => Some((key, row)),
            _ => None,
        })
    }

    pub fn missing(&self) -> impl Iterator<Item = &KeyTuple> {
        self.entries
            .values()
            .filter(|(_, r)| matches!(r, Resolution::Missing))
            .map(|(key, _)| key)
    }

    pub fn errors(&self) -> impl Iterator<Item = (&KeyTuple, &StoreError)> {
        self.entries.values().filter_map(|(key, r)| match r {
            Resolution::Error(e) => Some((key, e)),
            _ => None,
        })
    }

    pub fn was_filtered(&self, key: &KeyTuple) -> bool {
        let encoded = key.encode();
        self.filtered.iter().any(|k| k.encode() == encoded)
    }

    pub fn filtered(&self) -> &[KeyTuple] {
        &self.filtered
    }

    /// Found records in key order.
    pub fn into_records(self) -> Vec<ColumnMap> {
        self.entries
            .into_values()
            .filter_map(|(_, r)| match r {
                Resolution::Found(row) => Some(row),
                _ => None,
            })
            .collect()
    }

    /// Number of keys with an entry (filtered keys excluded).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How long a snapshot of a row may live in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotLifetime {
    Forever,
    For(Duration),
    /// The row's own expiry has passed; do not cache it.
    Expired,
}

impl SnapshotLifetime {
    /// Entity TTL capped by the row's expiry column, if the entity has one.
    pub fn of(entity: &EntityConfig, row: &ColumnMap, default_ttl_secs: u64, now: i64) -> Self {
        let configured = entity.snapshot_ttl(default_ttl_secs);
        let expires_at = entity
            .expiry_column
            .as_deref()
            .and_then(|column| row.get(column))
            .and_then(|v| v.as_i64());
        let Some(expires_at) = expires_at else {
            return configured.map_or(SnapshotLifetime::Forever, SnapshotLifetime::For);
        };
        let remaining = expires_at - now;
        if remaining <= 0 {
            return SnapshotLifetime::Expired;
        }
        let remaining = Duration::from_secs(remaining as u64);
        SnapshotLifetime::For(configured.map_or(remaining, |ttl| ttl.min(remaining)))
    }

    pub fn ttl(self) -> Option<Duration> {
        match self {
            SnapshotLifetime::For(ttl) => Some(ttl),
            _ => None,
        }
    }
}

fn project(entity: &EntityConfig, row: ColumnMap, columns: Option<&[String]>) -> ColumnMap {
    match columns {
        None => row,
        Some(columns) => row
            .into_iter()
            .filter(|(name, _)| entity.is_key_column(name) || columns.contains(name))
            .collect(),
    }
}

/// Reads records through the cache.
pub struct Resolver {
    store: Arc<dyn RecordStore>,
    cache: Arc<dyn CacheBackend>,
    settings: CacheSettings,
}

impl Resolver {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cache: Arc<dyn CacheBackend>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            store,
            cache,
            settings,
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Resolve every requested key.
    ///
    /// Only request-level problems (bad key arity, invalid pattern, failed
    /// scan) are returned as `Err`; store failures on a keyed read become
    /// [`Resolution::Error`] entries.
    pub async fn resolve(
        &self,
        entity: &EntityConfig,
        request: &ResolveRequest,
    ) -> StrataResult<Resolved> {
        request.filter.validate()?;
        for key in &request.keys {
            entity.check_key(key)?;
        }

        if request.keys.is_empty() {
            let rows = self
                .scan(entity, &request.filter, request.columns.as_deref())
                .await?;
            let mut resolved = Resolved::default();
            for row in rows {
                match entity.key_of(&row) {
                    Ok(key) => resolved.insert(key, Resolution::Found(row)),
                    Err(e) => warn!(entity = %entity.name, error = %e, "Scanned row has no key"),
                }
            }
            resolved.stats.store_fetched = resolved.len();
            return Ok(resolved);
        }

        let options = request
            .options
            .unwrap_or_else(|| ResolveOptions::from(&self.settings));
        let use_cache = options.use_cache && self.settings.enabled && entity.cache_enabled;

        let mut seen = HashSet::new();
        let keys: Vec<KeyTuple> = request
            .keys
            .iter()
            .filter(|k| seen.insert(k.encode()))
            .cloned()
            .collect();

        let mut resolved = Resolved::default();
        resolved.stats.requested = keys.len();

        let pending = if use_cache {
            self.read_cache(entity, keys, request, options, &mut resolved)
                .await
        } else {
            keys
        };

        if !pending.is_empty() {
            self.read_store(
                entity,
                pending,
                request,
                use_cache && options.repopulate,
                &mut resolved,
            )
            .await;
        }

        debug!(
            entity = %entity.name,
            requested = resolved.stats.requested,
            cache_hits = resolved.stats.cache_hits,
            store_fetched = resolved.stats.store_fetched,
            filtered = resolved.stats.filtered,
            "Resolved keys"
        );
        Ok(resolved)
    }

    /// Unbounded store scan. Never touches the cache.
    pub async fn scan(
        &self,
        entity: &EntityConfig,
        filter: &Filter,
        columns: Option<&[String]>,
    ) -> StrataResult<Vec<ColumnMap>> {
        filter.validate()?;
        self.store
            .select(entity, None, filter, columns)
            .await
            .map_err(|e| {
                error!(entity = %entity.name, operation = "scan", error = %e, "Store scan failed");
                StrataError::from(e)
            })
    }

    /// Serve what the cache can; return the keys that still need the store.
    async fn read_cache(
        &self,
        entity: &EntityConfig,
        keys: Vec<KeyTuple>,
        request: &ResolveRequest,
        options: ResolveOptions,
        resolved: &mut Resolved,
    ) -> Vec<KeyTuple> {
        let cache_keys: Vec<String> = keys.iter().map(|k| entity.cache_key(k)).collect();
        let values = match self.cache.get_many(&cache_keys).await {
            Ok(values) => values,
            Err(e) => {
                warn!(
                    entity = %entity.name,
                    keys = keys.len(),
                    error = %e,
                    "Cache read failed, falling back to store"
                );
                return keys;
            }
        };

        let columns = request.columns.as_deref();
        let mut pending = Vec::new();
        for ((key, cache_key), raw) in keys.into_iter().zip(&cache_keys).zip(values) {
            let Some(raw) = raw else {
                pending.push(key);
                continue;
            };
            let row = match snapshot::decode(entity, &key, cache_key, &raw) {
                Ok(row) => row,
                Err(e) => {
                    debug!(key = %cache_key, error = %e, "Discarding unreadable snapshot");
                    resolved.stats.corrupt += 1;
                    pending.push(key);
                    continue;
                }
            };
            if options.check_shape {
                if let Some(columns) = columns {
                    if !snapshot::has_shape(&row, columns) {
                        debug!(key = %cache_key, "Snapshot missing required columns");
                        resolved.stats.shape_repairs += 1;
                        pending.push(key);
                        continue;
                    }
                }
            }
            match request.filter.evaluate(&row, Tier::Cache) {
                Evaluation::Pass => {
                    resolved.stats.cache_hits += 1;
                    resolved.insert(key, Resolution::Found(project(entity, row, columns)));
                }
                Evaluation::Fail => {
                    resolved.stats.filtered += 1;
                    resolved.filtered.push(key);
                }
                Evaluation::Unsupported => {
                    resolved.stats.undecidable += 1;
                    pending.push(key);
                }
            }
        }
        pending
    }

    async fn read_store(
        &self,
        entity: &EntityConfig,
        pending: Vec<KeyTuple>,
        request: &ResolveRequest,
        repopulate: bool,
        resolved: &mut Resolved,
    ) {
        let columns = request.columns.as_deref();
        // Snapshots must hold full rows, so project after the fetch when
        // repopulating.
        let fetch_columns = if repopulate { None } else { columns };
        let rows = match self
            .store
            .select(entity, Some(&pending), &request.filter, fetch_columns)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(
                    entity = %entity.name,
                    keys = pending.len(),
                    operation = "select",
                    error = %e,
                    "Store read failed"
                );
                for key in pending {
                    resolved.insert(key, Resolution::Error(e.clone()));
                }
                return;
            }
        };

        let mut by_key = HashMap::with_capacity(rows.len());
        for row in rows {
            match entity.key_of(&row) {
                Ok(key) => {
                    by_key.insert(key.encode(), row);
                }
                Err(e) => warn!(entity = %entity.name, error = %e, "Store row has no key"),
            }
        }
        resolved.stats.store_fetched = by_key.len();

        let now = now_epoch();
        let mut snapshots = Vec::new();
        for key in pending {
            match by_key.remove(&key.encode()) {
                Some(row) => {
                    if repopulate {
                        let cache_key = entity.cache_key(&key);
                        let lifetime =
                            SnapshotLifetime::of(entity, &row, self.settings.default_ttl_secs, now);
                        if lifetime != SnapshotLifetime::Expired {
                            match snapshot::encode(entity, &cache_key, &row) {
                                Ok(value) => {
                                    snapshots.push(CacheEntry::new(cache_key, value, lifetime.ttl()))
                                }
                                Err(e) => warn!(error = %e, "Snapshot encoding failed"),
                            }
                        }
                    }
                    resolved.insert(key, Resolution::Found(project(entity, row, columns)));
                }
                None => resolved.insert(key, Resolution::Missing),
            }
        }

        if !snapshots.is_empty() {
            match self.cache.set_many(&snapshots).await {
                Ok(()) => resolved.stats.repopulated = snapshots.len(),
                Err(e) => warn!(
                    entity = %entity.name,
                    keys = snapshots.len(),
                    error = %e,
                    "Cache repopulation failed"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::memory_store::{MemoryStore, StoreOperation};
    use serde_json::json;
    use strata_core::{columns, Predicate};

    fn entity() -> EntityConfig {
        EntityConfig::new("article", "articles", &["article_id"], "article:")
    }

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryCache>, Resolver) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let resolver = Resolver::new(store.clone(), cache.clone(), CacheSettings::default());
        (store, cache, resolver)
    }

    async fn seed(store: &MemoryStore, id: i64, views: i64) {
        store
            .upsert(
                &entity(),
                &[columns([
                    ("article_id", json!(id)),
                    ("title", json!(format!("t{id}"))),
                    ("views", json!(views)),
                ])],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_store_hit_repopulates_cache() {
        let (store, cache, resolver) = setup();
        seed(&store, 1, 10).await;
        let key = KeyTuple::single(1);

        let first = resolver
            .resolve(&entity(), &ResolveRequest::keys([key.clone()]))
            .await
            .unwrap();
        assert_eq!(first.record(&key).unwrap()["views"], json!(10));
        assert_eq!(first.stats.repopulated, 1);
        assert!(cache.contains("article:1"));

        let second = resolver
            .resolve(&entity(), &ResolveRequest::keys([key.clone()]))
            .await
            .unwrap();
        assert_eq!(second.stats.cache_hits, 1);
        assert_eq!(store.select_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_key() {
        let (_store, _cache, resolver) = setup();
        let key = KeyTuple::single(99);
        let resolved = resolver
            .resolve(&entity(), &ResolveRequest::keys([key.clone()]))
            .await
            .unwrap();
        assert_eq!(resolved.get(&key), Some(&Resolution::Missing));
    }

    #[tokio::test]
    async fn test_store_failure_marks_pending_keys_error() {
        let (store, _cache, resolver) = setup();
        store.fail(StoreOperation::Select);
        let keys = [KeyTuple::single(1), KeyTuple::single(2)];
        let resolved = resolver
            .resolve(&entity(), &ResolveRequest::keys(keys.clone()))
            .await
            .unwrap();
        assert_eq!(resolved.errors().count(), 2);
        assert_eq!(resolved.missing().count(), 0);
    }

    #[tokio::test]
    async fn test_cache_outage_falls_back_to_store() {
        let (store, cache, resolver) = setup();
        seed(&store, 1, 10).await;
        cache.set_available(false);
        let key = KeyTuple::single(1);
        let resolved = resolver
            .resolve(&entity(), &ResolveRequest::keys([key.clone()]))
            .await
            .unwrap();
        assert!(resolved.record(&key).is_some());
        assert_eq!(resolved.stats.repopulated, 0);
    }

    #[tokio::test]
    async fn test_filtered_snapshot_not_refetched() {
        let (store, _cache, resolver) = setup();
        seed(&store, 1, 10).await;
        let key = KeyTuple::single(1);
        resolver
            .resolve(&entity(), &ResolveRequest::keys([key.clone()]))
            .await
            .unwrap();
        store.clear_call_log();

        let request = ResolveRequest::keys([key.clone()])
            .with_filter(Filter::all().with(Predicate::gt("views", 100)));
        let resolved = resolver.resolve(&entity(), &request).await.unwrap();
        assert!(resolved.get(&key).is_none());
        assert!(resolved.was_filtered(&key));
        assert_eq!(store.select_calls(), 0);
    }

    #[tokio::test]
    async fn test_undecidable_condition_goes_to_store() {
        let (store, _cache, resolver) = setup();
        seed(&store, 1, 10).await;
        let key = KeyTuple::single(1);
        resolver
            .resolve(&entity(), &ResolveRequest::keys([key.clone()]))
            .await
            .unwrap();
        store.clear_call_log();

        let request = ResolveRequest::keys([key.clone()])
            .with_filter(Filter::all().with(Predicate::is_null("archived_at")));
        let resolved = resolver.resolve(&entity(), &request).await.unwrap();
        assert_eq!(resolved.stats.undecidable, 1);
        assert!(resolved.record(&key).is_some());
        assert_eq!(store.select_calls(), 1);
    }

    #[tokio::test]
    async fn test_projection() {
        let (store, _cache, resolver) = setup();
        seed(&store, 1, 10).await;
        let key = KeyTuple::single(1);
        let resolved = resolver
            .resolve(&entity(), &ResolveRequest::keys([key.clone()]).with_columns(["views"]))
            .await
            .unwrap();
        let row = resolved.record(&key).unwrap();
        assert_eq!(row.len(), 2);
        assert!(row.contains_key("article_id"));
    }

    #[tokio::test]
    async fn test_bad_key_arity_rejected() {
        let (_store, _cache, resolver) = setup();
        let request = ResolveRequest::keys([KeyTuple::from_strs(&["1", "en"])]);
        assert!(matches!(
            resolver.resolve(&entity(), &request).await,
            Err(StrataError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_keys_scan_bypasses_cache() {
        let (store, cache, resolver) = setup();
        seed(&store, 1, 10).await;
        seed(&store, 2, 50).await;
        let request = ResolveRequest::scan(Filter::all().with(Predicate::gte("views", 20)));
        let resolved = resolver.resolve(&entity(), &request).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved.record(&KeyTuple::single(2)).is_some());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cache_disabled_per_request() {
        let (store, cache, resolver) = setup();
        seed(&store, 1, 10).await;
        let request = ResolveRequest::keys([KeyTuple::single(1)]).with_options(ResolveOptions {
            use_cache: false,
            repopulate: true,
            check_shape: true,
        });
        resolver.resolve(&entity(), &request).await.unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_snapshot_lifetime_capped_by_expiry() {
        let entity = entity().with_expiry_column("expires");
        let now = 1_000;
        let row = columns([("expires", json!(1_060))]);
        assert_eq!(
            SnapshotLifetime::of(&entity, &row, 3600, now),
            SnapshotLifetime::For(Duration::from_secs(60))
        );
        let row = columns([("expires", json!(999))]);
        assert_eq!(
            SnapshotLifetime::of(&entity, &row, 3600, now),
            SnapshotLifetime::Expired
        );
        let row = columns([("expires", json!(1_060))]);
        assert_eq!(
            SnapshotLifetime::of(&entity, &row, 0, now),
            SnapshotLifetime::For(Duration::from_secs(60))
        );
        assert_eq!(
            SnapshotLifetime::of(&entity, &ColumnMap::new(), 0, now),
            SnapshotLifetime::Forever
        );
    }
}
