//! STRATA Test Utilities
//!
//! Shared test infrastructure for the STRATA workspace:
//! - Proptest generators for keys, rows, tokens and access rules
//! - Fixtures wiring in-memory tiers into engines and services
//! - Assertions over resolutions and cache state

use std::sync::Arc;
use std::time::Duration;

pub use strata_access::{AccessList, Address, AddressFormat, Rule, RuleKind};
pub use strata_core::{
    columns, ColumnMap, EngineConfig, EntityConfig, KeyTuple, ResourceError, StrataError,
    StrataResult,
};
pub use strata_storage::{Engine, MemoryCache, MemoryStore, Resolution, Resolved};
pub use strata_tokens::{TokenService, TokenSpec};

use serde_json::{json, Value};

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies.

    use super::*;
    use proptest::prelude::*;

    /// One key component: a short string or a small integer.
    pub fn arb_key_part() -> impl Strategy<Value = Value> {
        prop_oneof![
            "[a-z0-9_-]{1,12}".prop_map(Value::from),
            (0i64..100_000).prop_map(Value::from),
        ]
    }

    pub fn arb_key_tuple(arity: usize) -> impl Strategy<Value = KeyTuple> {
        prop::collection::vec(arb_key_part(), arity).prop_map(KeyTuple::new)
    }

    /// Non-key columns of an article row.
    pub fn arb_article_body() -> impl Strategy<Value = ColumnMap> {
        ("[A-Za-z ]{0,24}", 0i64..10_000, any::<bool>()).prop_map(|(title, views, published)| {
            columns([
                ("title", json!(title)),
                ("views", json!(views)),
                ("published", json!(published)),
            ])
        })
    }

    pub fn arb_token_id() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9]{8,32}"
    }

    /// Plain action names; no regex metacharacters.
    pub fn arb_action() -> impl Strategy<Value = String> {
        "[a-z]{1,10}(_[a-z]{1,10}){0,2}"
    }

    pub fn arb_token_spec() -> impl Strategy<Value = TokenSpec> {
        (arb_token_id(), arb_action(), 1i64..10, 60u64..86_400).prop_map(
            |(id, action, uses, ttl)| {
                TokenSpec::new(id, action)
                    .with_uses(uses)
                    .with_ttl(Duration::from_secs(ttl))
            },
        )
    }

    pub fn arb_ipv4() -> impl Strategy<Value = Address> {
        any::<[u8; 4]>().prop_map(|octets| {
            let text = octets.map(|o| o.to_string()).join(".");
            match Address::parse(&text, &AddressFormat::ipv4()) {
                Ok(address) => address,
                Err(e) => panic!("generated address {text} rejected: {e}"),
            }
        })
    }

    pub fn arb_rule_kind() -> impl Strategy<Value = RuleKind> {
        prop_oneof![Just(RuleKind::Allow), Just(RuleKind::Deny)]
    }

    /// Range rule over IPv4 with a prefix of 0 to 3 components.
    pub fn arb_ipv4_range(list: &'static str) -> impl Strategy<Value = Rule> {
        (
            prop::collection::vec(0u32..=255, 0..=3),
            0u32..=255,
            0u32..=255,
            arb_rule_kind(),
        )
            .prop_map(move |(prefix, a, b, kind)| Rule::range(list, kind, prefix, a.min(b), a.max(b)))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built entities and in-memory wiring.

    use super::*;

    pub use strata_tokens::token_entity;

    /// `articles` keyed by `article_id`.
    pub fn article_entity() -> EntityConfig {
        EntityConfig::new("article", "articles", &["article_id"], "article:")
    }

    /// `comments` keyed by `(article_id, comment_id)`. Writing a comment
    /// evicts the per-article comment listing.
    pub fn comment_entity() -> EntityConfig {
        EntityConfig::new(
            "comment",
            "comments",
            &["article_id", "comment_id"],
            "comment:",
        )
        .with_dependent("comments_of:", 1)
    }

    pub fn article_row(id: i64, title: &str, views: i64) -> ColumnMap {
        columns([
            ("article_id", json!(id)),
            ("title", json!(title)),
            ("views", json!(views)),
        ])
    }

    pub fn comment_row(article_id: i64, comment_id: i64, body: &str) -> ColumnMap {
        columns([
            ("article_id", json!(article_id)),
            ("comment_id", json!(comment_id)),
            ("body", json!(body)),
        ])
    }

    pub fn article_key(id: i64) -> KeyTuple {
        KeyTuple::single(id)
    }

    /// Default settings with the article and comment entities registered.
    pub fn engine_config() -> EngineConfig {
        EngineConfig {
            entities: vec![article_entity(), comment_entity()],
            ..EngineConfig::default()
        }
    }

    /// Both in-memory tiers, returned alongside whatever is built on them so
    /// tests can inspect and break the tiers directly.
    pub struct Tiers {
        pub store: Arc<MemoryStore>,
        pub cache: Arc<MemoryCache>,
    }

    impl Tiers {
        pub fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                cache: Arc::new(MemoryCache::new()),
            }
        }

        pub fn engine(&self, config: &EngineConfig) -> Engine {
            match Engine::new(config, self.store.clone(), self.cache.clone()) {
                Ok(engine) => engine,
                Err(e) => panic!("fixture config rejected: {e}"),
            }
        }

        pub fn token_service(&self, config: &EngineConfig) -> TokenService {
            TokenService::new(self.store.clone(), self.cache.clone(), config)
        }

        pub fn access_list(&self, config: &EngineConfig) -> AccessList {
            AccessList::new(self.store.clone(), self.cache.clone(), config)
        }
    }

    impl Default for Tiers {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Fresh tiers plus an engine over [`engine_config`].
    pub fn memory_engine() -> (Tiers, Engine) {
        let tiers = Tiers::new();
        let engine = tiers.engine(&engine_config());
        (tiers, engine)
    }

    /// Fresh tiers plus a token service with default settings.
    pub fn memory_token_service() -> (Tiers, TokenService) {
        let tiers = Tiers::new();
        let service = tiers.token_service(&EngineConfig::default());
        (tiers, service)
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over resolutions and cache state.

    use super::*;

    #[track_caller]
    pub fn assert_found<'a>(resolved: &'a Resolved, key: &KeyTuple) -> &'a ColumnMap {
        match resolved.get(key) {
            Some(Resolution::Found(row)) => row,
            other => panic!("Expected {key:?} found, got: {other:?}"),
        }
    }

    #[track_caller]
    pub fn assert_missing(resolved: &Resolved, key: &KeyTuple) {
        match resolved.get(key) {
            Some(Resolution::Missing) => {}
            other => panic!("Expected {key:?} missing, got: {other:?}"),
        }
    }

    #[track_caller]
    pub fn assert_store_error(resolved: &Resolved, key: &KeyTuple) {
        match resolved.get(key) {
            Some(Resolution::Error(_)) => {}
            other => panic!("Expected store error for {key:?}, got: {other:?}"),
        }
    }

    /// Dropped by the filter: no resolution at all, only the filtered mark.
    #[track_caller]
    pub fn assert_filtered(resolved: &Resolved, key: &KeyTuple) {
        if let Some(resolution) = resolved.get(key) {
            panic!("Expected {key:?} filtered out, got: {resolution:?}");
        }
        assert!(
            resolved.was_filtered(key),
            "Expected {key:?} filtered out, but it was not marked filtered"
        );
    }

    #[track_caller]
    pub fn assert_cached(cache: &MemoryCache, entity: &EntityConfig, key: &KeyTuple) {
        let cache_key = entity.cache_key(key);
        assert!(cache.contains(&cache_key), "Expected {cache_key} cached");
    }

    #[track_caller]
    pub fn assert_not_cached(cache: &MemoryCache, entity: &EntityConfig, key: &KeyTuple) {
        let cache_key = entity.cache_key(key);
        assert!(!cache.contains(&cache_key), "Expected {cache_key} not cached");
    }

    /// Assert a per-key resource failure carries `code`.
    #[track_caller]
    pub fn assert_resource_code<T: std::fmt::Debug>(
        result: &Result<T, ResourceError>,
        code: &str,
    ) {
        match result {
            Err(e) => assert_eq!(e.code(), code, "Wrong resource error: {e}"),
            Ok(value) => panic!("Expected {code} error, got Ok({value:?})"),
        }
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &StrataResult<T>) {
        match result {
            Err(StrataError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {other:?}"),
        }
    }
}
