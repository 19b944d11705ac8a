//! Store-backed allow/deny lists.
//!
//! Exact rules live in `access_exact`, keyed by `(list, address)`, and are
//! read through the cache; their snapshots expire with the rule. Range rules
//! live in `access_range`, keyed by `(list, prefix, low, high)`, and are
//! scanned level by level straight from the store.

use std::sync::Arc;

use serde_json::Value;
use strata_core::{
    columns, now_epoch, ColumnMap, EngineConfig, EntityConfig, Filter, KeyTuple, Predicate,
    StrataError, StrataResult, ValidationError,
};
use strata_storage::{
    CacheBackend, RecordStore, ResolveRequest, Resolution, Resolver, WritePipeline,
};
use tracing::{debug, warn};

use crate::address::{Address, AddressFormat};
use crate::precedence;
use crate::rule::{Rule, RuleKind, RuleTarget};

pub const EXACT_ENTITY: &str = "access_exact";
pub const RANGE_ENTITY: &str = "access_range";

mod column {
    pub const LIST: &str = "list";
    pub const ADDRESS: &str = "address";
    pub const PREFIX: &str = "prefix";
    pub const LOW: &str = "low";
    pub const HIGH: &str = "high";
    pub const KIND: &str = "kind";
    pub const EXPIRES: &str = "expires";
}

/// Exact rules. Snapshot lifetime is the rule's remaining lifetime.
pub fn exact_entity() -> EntityConfig {
    EntityConfig::new(
        EXACT_ENTITY,
        "access_exact",
        &[column::LIST, column::ADDRESS],
        "access:exact:",
    )
    .with_cache_ttl(0)
    .with_expiry_column(column::EXPIRES)
}

/// Range rules. Never cached.
pub fn range_entity() -> EntityConfig {
    EntityConfig::new(
        RANGE_ENTITY,
        "access_range",
        &[column::LIST, column::PREFIX, column::LOW, column::HIGH],
        "access:range:",
    )
    .with_cache_enabled(false)
}

/// Which answer the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Allowed,
    Blocked,
}

/// Outcome of a list check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Answer to the query. `false` when no rule applies.
    pub verdict: bool,
    pub rule: Option<Rule>,
    pub level: Option<usize>,
}

impl Decision {
    fn none() -> Self {
        Self {
            verdict: false,
            rule: None,
            level: None,
        }
    }

    fn from_rule(rule: Rule, level: usize, query: Query) -> Self {
        Self {
            verdict: rule.kind.is_allow() ^ (query == Query::Blocked),
            rule: Some(rule),
            level: Some(level),
        }
    }
}

/// Allow/deny lists over one address format.
pub struct AccessList {
    exact: Arc<EntityConfig>,
    range: Arc<EntityConfig>,
    resolver: Resolver,
    pipeline: WritePipeline,
    format: AddressFormat,
}

impl AccessList {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cache: Arc<dyn CacheBackend>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            exact: Arc::new(exact_entity()),
            range: Arc::new(range_entity()),
            resolver: Resolver::new(store.clone(), cache.clone(), config.cache.clone()),
            pipeline: WritePipeline::new(store, cache),
            format: AddressFormat::from(&config.access),
        }
    }

    pub fn format(&self) -> &AddressFormat {
        &self.format
    }

    pub fn exact_entity(&self) -> &EntityConfig {
        &self.exact
    }

    /// Store a rule, replacing one with the same key.
    pub async fn add_rule(&self, rule: &Rule) -> StrataResult<()> {
        rule.validate(&self.format)?;
        let (entity, row) = self.row_of(rule);
        let report = self.pipeline.upsert(entity, vec![row]).await;
        match report.results.into_iter().next() {
            Some(Err(e)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Remove a rule. Returns whether it existed.
    pub async fn remove_rule(&self, rule: &Rule) -> StrataResult<bool> {
        rule.validate(&self.format)?;
        let (entity, key) = self.key_of(rule);
        let report = self.pipeline.delete(entity, &[key]).await?;
        Ok(report.deleted > 0)
    }

    /// Resolve the winning rule for `address` in `list`.
    pub async fn check(&self, list: &str, address: &str, query: Query) -> StrataResult<Decision> {
        let address = Address::parse(address, &self.format)?;
        let now = now_epoch();

        if let Some(rule) = self.exact_rule(list, &address, now).await? {
            debug!(list, address = %address, kind = rule.kind.as_str(), "Exact rule matched");
            return Ok(Decision::from_rule(rule, 0, query));
        }

        let count = self.format.component_count;
        for level in 1..=count {
            let prefix_len = count - level;
            let candidates = self.range_candidates(list, &address, prefix_len, now).await?;
            if let Some(rule) = precedence::best_of_level(&address, &candidates, now) {
                debug!(list, address = %address, level, kind = rule.kind.as_str(), "Range rule matched");
                return Ok(Decision::from_rule(rule.clone(), level, query));
            }
        }
        Ok(Decision::none())
    }

    pub async fn is_blocked(&self, list: &str, address: &str) -> StrataResult<bool> {
        Ok(self.check(list, address, Query::Blocked).await?.verdict)
    }

    pub async fn is_allowed(&self, list: &str, address: &str) -> StrataResult<bool> {
        Ok(self.check(list, address, Query::Allowed).await?.verdict)
    }

    async fn exact_rule(
        &self,
        list: &str,
        address: &Address,
        now: i64,
    ) -> StrataResult<Option<Rule>> {
        let key = KeyTuple::new(vec![Value::from(list), Value::from(address.as_str())]);
        let resolved = self
            .resolver
            .resolve(&self.exact, &ResolveRequest::keys([key.clone()]))
            .await?;
        match resolved.get(&key) {
            Some(Resolution::Found(row)) => {
                let rule = self.exact_from_row(list, address, row)?;
                Ok((!rule.is_expired(now)).then_some(rule))
            }
            Some(Resolution::Error(e)) => Err(StrataError::from(e.clone())),
            Some(Resolution::Missing) | None => Ok(None),
        }
    }

    async fn range_candidates(
        &self,
        list: &str,
        address: &Address,
        prefix_len: usize,
        now: i64,
    ) -> StrataResult<Vec<Rule>> {
        let Some(component) = address.component(prefix_len) else {
            return Ok(Vec::new());
        };
        let prefix = self.format.join(address.prefix(prefix_len));
        let filter = Filter::all()
            .with(Predicate::eq(column::LIST, list))
            .with(Predicate::eq(column::PREFIX, prefix))
            .with(Predicate::lte(column::LOW, component))
            .with(Predicate::gte(column::HIGH, component))
            .group(
                Filter::any()
                    .with(Predicate::is_null(column::EXPIRES))
                    .with(Predicate::gt(column::EXPIRES, now)),
            );
        let rows = self.resolver.scan(&self.range, &filter, None).await?;
        let mut rules = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.range_from_row(row) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(list, error = %e, "Skipping malformed range rule"),
            }
        }
        Ok(rules)
    }

    fn row_of(&self, rule: &Rule) -> (&EntityConfig, ColumnMap) {
        let expires = rule.expires_at.map_or(Value::Null, Value::from);
        match &rule.target {
            RuleTarget::Exact { components } => (
                &self.exact,
                columns([
                    (column::LIST, Value::from(rule.list.clone())),
                    (column::ADDRESS, Value::from(self.format.join(components))),
                    (column::KIND, Value::from(rule.kind.as_str())),
                    (column::EXPIRES, expires),
                ]),
            ),
            RuleTarget::Range { prefix, low, high } => (
                &self.range,
                columns([
                    (column::LIST, Value::from(rule.list.clone())),
                    (column::PREFIX, Value::from(self.format.join(prefix))),
                    (column::LOW, Value::from(*low)),
                    (column::HIGH, Value::from(*high)),
                    (column::KIND, Value::from(rule.kind.as_str())),
                    (column::EXPIRES, expires),
                ]),
            ),
        }
    }

    fn key_of(&self, rule: &Rule) -> (&EntityConfig, KeyTuple) {
        let list = Value::from(rule.list.clone());
        match &rule.target {
            RuleTarget::Exact { components } => (
                &self.exact,
                KeyTuple::new(vec![list, Value::from(self.format.join(components))]),
            ),
            RuleTarget::Range { prefix, low, high } => (
                &self.range,
                KeyTuple::new(vec![
                    list,
                    Value::from(self.format.join(prefix)),
                    Value::from(*low),
                    Value::from(*high),
                ]),
            ),
        }
    }

    fn exact_from_row(
        &self,
        list: &str,
        address: &Address,
        row: &ColumnMap,
    ) -> Result<Rule, ValidationError> {
        let mut rule = Rule::exact(list, kind_of(row)?, address);
        rule.expires_at = row.get(column::EXPIRES).and_then(Value::as_i64);
        Ok(rule)
    }

    fn range_from_row(&self, row: &ColumnMap) -> Result<Rule, ValidationError> {
        let text = |name: &str| {
            row.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| missing(name))
        };
        let bound = |name: &str| {
            row.get(name)
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| missing(name))
        };
        let prefix = self.format.parse_prefix(&text(column::PREFIX)?)?;
        let mut rule = Rule::range(
            text(column::LIST)?,
            kind_of(row)?,
            prefix,
            bound(column::LOW)?,
            bound(column::HIGH)?,
        );
        rule.expires_at = row.get(column::EXPIRES).and_then(Value::as_i64);
        Ok(rule)
    }
}

fn missing(name: &str) -> ValidationError {
    ValidationError::RequiredFieldMissing {
        field: name.to_string(),
    }
}

fn kind_of(row: &ColumnMap) -> Result<RuleKind, ValidationError> {
    let kind = row
        .get(column::KIND)
        .and_then(Value::as_str)
        .ok_or_else(|| missing(column::KIND))?;
    RuleKind::parse(kind)
}
