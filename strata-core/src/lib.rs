//! STRATA Core - shared types for the cache-coherent object-access engine
//!
//! Records, key tuples and their cache-key codec, the predicate language,
//! entity configuration, engine configuration and the error taxonomy. Every
//! other crate in the workspace depends on this one. Nothing here performs
//! I/O.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

pub mod config;
pub mod entity;
pub mod error;
pub mod key;
pub mod predicate;
pub mod telemetry;

pub use config::{AccessSettings, CacheSettings, EngineConfig, TokenSettings};
pub use entity::{
    DependentCache, EntityConfig, EntityRegistry, NamedFilter, NamedFilterKind, WriteSpec,
};
pub use error::{
    CacheError, ConfigError, ResourceError, StoreError, StrataError, StrataResult,
    ValidationError,
};
pub use key::{cache_key, decode_cache_key, KeyTuple, KEY_DELIMITER};
pub use predicate::{
    CompareOp, Combinator, Condition, Evaluation, Filter, Predicate, SubqueryLookup, Tier,
};
pub use telemetry::{init_tracing, TelemetryConfig};

// ============================================================================
// RECORD TYPES
// ============================================================================

/// Column name to value. Ordered so serialized snapshots are deterministic.
pub type ColumnMap = BTreeMap<String, Value>;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Current time as Unix epoch seconds, the unit of every expiry column.
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Build a column map from `(name, value)` pairs.
pub fn columns<I, K, V>(pairs: I) -> ColumnMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
