//! In-process cache backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use strata_core::CacheError;

use super::traits::{CacheBackend, CacheEntry, CacheStats};

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// HashMap-backed cache with lazy TTL expiry.
///
/// Expired entries are dropped when touched. An availability switch makes
/// every call fail, which is how tests simulate a cache outage.
#[derive(Debug)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Slot>>,
    stats: Mutex<CacheStats>,
    available: AtomicBool,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Raw value under `key`, ignoring TTL. For inspection in tests.
    pub fn peek(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().ok()?;
        entries.get(key).map(|slot| slot.value.clone())
    }

    /// Remaining lifetime of `key`: `None` if absent, `Some(None)` if it
    /// never expires.
    pub fn ttl_of(&self, key: &str) -> Option<Option<Duration>> {
        let entries = self.entries.read().ok()?;
        let slot = entries.get(key)?;
        Some(
            slot.expires_at
                .map(|at| at.saturating_duration_since(Instant::now())),
        )
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .map(|entries| entries.get(key).is_some_and(|slot| !slot.is_expired(now)))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, operation: &str) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable {
                operation: operation.to_string(),
                reason: "cache is unavailable".to_string(),
            })
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        self.check("get")?;
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| CacheError::LockPoisoned)?;
        let mut stats = self.stats.lock().map_err(|_| CacheError::LockPoisoned)?;

        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            let expired = entries.get(key).is_some_and(|slot| slot.is_expired(now));
            if expired {
                entries.remove(key);
                stats.expirations += 1;
            }
            match entries.get(key) {
                Some(slot) => {
                    stats.hits += 1;
                    values.push(Some(slot.value.clone()));
                }
                None => {
                    stats.misses += 1;
                    values.push(None);
                }
            }
        }
        Ok(values)
    }

    async fn set_many(&self, items: &[CacheEntry]) -> Result<(), CacheError> {
        self.check("set")?;
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| CacheError::LockPoisoned)?;
        for item in items {
            entries.insert(
                item.key.clone(),
                Slot {
                    value: item.value.clone(),
                    expires_at: item.ttl.map(|ttl| now + ttl),
                },
            );
        }
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.check("delete")?;
        let mut entries = self.entries.write().map_err(|_| CacheError::LockPoisoned)?;
        let removed = keys.iter().filter(|k| entries.remove(*k).is_some()).count() as u64;
        let mut stats = self.stats.lock().map_err(|_| CacheError::LockPoisoned)?;
        stats.evictions += removed;
        Ok(removed)
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let entries = self.entries.read().map_err(|_| CacheError::LockPoisoned)?;
        let stats = self.stats.lock().map_err(|_| CacheError::LockPoisoned)?;
        Ok(CacheStats {
            entry_count: entries.len() as u64,
            ..stats.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new();
        cache
            .set_many(&[
                CacheEntry::new("a", "1", None),
                CacheEntry::new("b", "2", Some(Duration::from_secs(60))),
            ])
            .await
            .unwrap();

        let values = cache.get_many(&keys(&["a", "b", "c"])).await.unwrap();
        assert_eq!(values, vec![Some("1".into()), Some("2".into()), None]);

        assert_eq!(cache.delete_many(&keys(&["a", "c"])).await.unwrap(), 1);
        assert!(!cache.contains("a"));

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_expires_immediately() {
        let cache = MemoryCache::new();
        cache
            .set_many(&[CacheEntry::new("a", "1", Some(Duration::ZERO))])
            .await
            .unwrap();
        let values = cache.get_many(&keys(&["a"])).await.unwrap();
        assert_eq!(values, vec![None]);
        assert_eq!(cache.stats().await.unwrap().expirations, 1);
    }

    #[tokio::test]
    async fn test_ttl_of() {
        let cache = MemoryCache::new();
        cache
            .set_many(&[
                CacheEntry::new("forever", "1", None),
                CacheEntry::new("minute", "1", Some(Duration::from_secs(60))),
            ])
            .await
            .unwrap();
        assert_eq!(cache.ttl_of("forever"), Some(None));
        let remaining = cache.ttl_of("minute").unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));
        assert_eq!(cache.ttl_of("absent"), None);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let cache = MemoryCache::new();
        cache.set_available(false);
        assert!(matches!(
            cache.get_many(&keys(&["a"])).await,
            Err(CacheError::Unavailable { .. })
        ));
        assert!(cache.set_many(&[]).await.is_err());
        assert!(cache.delete_many(&[]).await.is_err());
    }
}
