//! Cache backend trait.
//!
//! The cache is a plain string key-value store with per-entry TTL. Value
//! encoding is the engine's concern (see [`super::snapshot`]); backends only
//! move strings around.

use async_trait::async_trait;
use std::time::Duration;

use strata_core::CacheError;

/// One entry for a bulk set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    /// `None` = never expires.
    pub ttl: Option<Duration>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }
}

/// Cache backend trait for pluggable cache implementations.
///
/// Every method is a single round trip. Implementations must be thread-safe;
/// any caller may evict, so a backend never needs cross-key consistency.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch many keys at once. The result is positionally aligned with
    /// `keys`; expired and absent entries are `None`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError>;

    /// Store many entries at once.
    async fn set_many(&self, entries: &[CacheEntry]) -> Result<(), CacheError>;

    /// Remove many keys at once. Returns how many were present.
    async fn delete_many(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// Get cache statistics.
    async fn stats(&self) -> Result<CacheStats, CacheError>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of explicit deletions.
    pub evictions: u64,
    /// Number of entries dropped because their TTL passed.
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_empty() {
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
