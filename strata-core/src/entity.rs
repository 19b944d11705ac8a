//! Per-entity configuration and the immutable entity registry.
//!
//! Business handlers describe their record types here: table, key columns,
//! cache namespace, dependent namespaces, named filters and write rules. The
//! engine never learns about entity types any other way.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConfigError, StrataError, StrataResult, ValidationError};
use crate::key::{cache_key, KeyTuple};
use crate::predicate::{CompareOp, Filter, Predicate};
use crate::ColumnMap;

fn default_true() -> bool {
    true
}

/// A cache namespace that derives from this entity and is evicted with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependentCache {
    /// Namespace prefix of the dependent cache.
    pub namespace: String,
    /// Number of leading key parts the dependent cache is keyed by.
    pub key_len: usize,
}

/// Column rules applied to every write.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteSpec {
    /// Filled in when the record does not carry the column.
    #[serde(default)]
    pub defaults: ColumnMap,
    /// Always overwrite whatever the record carries.
    #[serde(default)]
    pub forced: ColumnMap,
    /// Must be present (and non-null) after defaults and forced values.
    #[serde(default)]
    pub required: Vec<String>,
}

/// Shape of the predicate a named filter produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NamedFilterKind {
    Compare {
        op: CompareOp,
    },
    In,
    /// Bound value must be a two-element array.
    Between,
    Matches,
    NotMatches,
    /// Bound value must be `true`.
    IsNull,
    /// Column is among `select` of `table` rows whose `match_column` equals
    /// the bound value.
    Subquery {
        table: String,
        select: String,
        match_column: String,
    },
    /// Bound value becomes the parameter list.
    Raw {
        expression: String,
    },
}

/// A filter callers refer to by name, bound to a value per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedFilter {
    pub column: String,
    #[serde(flatten)]
    pub kind: NamedFilterKind,
}

impl NamedFilter {
    pub fn new(column: impl Into<String>, kind: NamedFilterKind) -> Self {
        Self {
            column: column.into(),
            kind,
        }
    }

    /// Produce the predicate for one bound value.
    pub fn bind(&self, value: Value) -> Result<Predicate, ValidationError> {
        let column = self.column.clone();
        let predicate = match &self.kind {
            NamedFilterKind::Compare { op } => Predicate::compare(column, *op, value),
            NamedFilterKind::In => match value {
                Value::Array(values) => Predicate::one_of(column, values),
                single => Predicate::one_of(column, vec![single]),
            },
            NamedFilterKind::Between => match value {
                Value::Array(bounds) if bounds.len() == 2 => {
                    let mut bounds = bounds.into_iter();
                    let low = bounds.next().unwrap_or(Value::Null);
                    let high = bounds.next().unwrap_or(Value::Null);
                    Predicate::between(column, low, high)
                }
                _ => {
                    return Err(ValidationError::InvalidValue {
                        field: self.column.clone(),
                        reason: "between filter needs [low, high]".to_string(),
                    })
                }
            },
            NamedFilterKind::Matches | NamedFilterKind::NotMatches => {
                let Value::String(pattern) = value else {
                    return Err(ValidationError::InvalidValue {
                        field: self.column.clone(),
                        reason: "pattern filter needs a string".to_string(),
                    });
                };
                let predicate = if matches!(self.kind, NamedFilterKind::Matches) {
                    Predicate::matches(column, pattern)
                } else {
                    Predicate::not_matches(column, pattern)
                };
                predicate.validate()?;
                predicate
            }
            NamedFilterKind::IsNull => {
                if value != Value::Bool(true) {
                    return Err(ValidationError::InvalidValue {
                        field: self.column.clone(),
                        reason: "null filter only accepts true".to_string(),
                    });
                }
                Predicate::is_null(column)
            }
            NamedFilterKind::Subquery {
                table,
                select,
                match_column,
            } => Predicate::in_subquery(
                column,
                table.clone(),
                select.clone(),
                Filter::all().with(Predicate::eq(match_column.clone(), value)),
            ),
            NamedFilterKind::Raw { expression } => {
                let params = match value {
                    Value::Array(values) => values,
                    Value::Null => Vec::new(),
                    single => vec![single],
                };
                Predicate::raw(expression.clone(), params)
            }
        };
        Ok(predicate)
    }
}

/// Immutable description of one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityConfig {
    pub name: String,
    pub table: String,
    pub key_columns: Vec<String>,
    /// Appended to `key_columns` to form the full key tuple.
    #[serde(default)]
    pub extra_key_columns: Vec<String>,
    /// Cache key prefix, e.g. `"token:"`.
    pub namespace: String,
    #[serde(default)]
    pub dependents: Vec<DependentCache>,
    #[serde(default)]
    pub filters: BTreeMap<String, NamedFilter>,
    #[serde(default)]
    pub write: WriteSpec,
    /// Overrides the engine-wide snapshot TTL. 0 = no expiry.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    /// Epoch-seconds column bounding the snapshot TTL by the record's own
    /// remaining lifetime.
    #[serde(default)]
    pub expiry_column: Option<String>,
}

impl EntityConfig {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        key_columns: &[&str],
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            key_columns: key_columns.iter().map(|c| c.to_string()).collect(),
            extra_key_columns: Vec::new(),
            namespace: namespace.into(),
            dependents: Vec::new(),
            filters: BTreeMap::new(),
            write: WriteSpec::default(),
            cache_ttl_secs: None,
            cache_enabled: true,
            expiry_column: None,
        }
    }

    pub fn with_extra_key_columns(mut self, columns: &[&str]) -> Self {
        self.extra_key_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_dependent(mut self, namespace: impl Into<String>, key_len: usize) -> Self {
        self.dependents.push(DependentCache {
            namespace: namespace.into(),
            key_len,
        });
        self
    }

    pub fn with_filter(mut self, name: impl Into<String>, filter: NamedFilter) -> Self {
        self.filters.insert(name.into(), filter);
        self
    }

    pub fn with_write(mut self, write: WriteSpec) -> Self {
        self.write = write;
        self
    }

    pub fn with_cache_ttl(mut self, secs: u64) -> Self {
        self.cache_ttl_secs = Some(secs);
        self
    }

    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_expiry_column(mut self, column: impl Into<String>) -> Self {
        self.expiry_column = Some(column.into());
        self
    }

    /// Key columns followed by extra key columns.
    pub fn full_key_columns(&self) -> impl Iterator<Item = &str> {
        self.key_columns
            .iter()
            .chain(self.extra_key_columns.iter())
            .map(String::as_str)
    }

    pub fn key_arity(&self) -> usize {
        self.key_columns.len() + self.extra_key_columns.len()
    }

    pub fn is_key_column(&self, column: &str) -> bool {
        self.full_key_columns().any(|c| c == column)
    }

    pub fn check_key(&self, key: &KeyTuple) -> Result<(), ValidationError> {
        if key.len() != self.key_arity() {
            return Err(ValidationError::KeyArity {
                entity: self.name.clone(),
                expected: self.key_arity(),
                got: key.len(),
            });
        }
        Ok(())
    }

    /// Extract the full key tuple from a row.
    pub fn key_of(&self, row: &ColumnMap) -> Result<KeyTuple, ValidationError> {
        let mut parts = Vec::with_capacity(self.key_arity());
        for column in self.full_key_columns() {
            match row.get(column) {
                Some(v) if !v.is_null() => parts.push(v.clone()),
                _ => {
                    return Err(ValidationError::RequiredFieldMissing {
                        field: column.to_string(),
                    })
                }
            }
        }
        Ok(KeyTuple::new(parts))
    }

    /// Cache key of this entity's snapshot for `key`.
    pub fn cache_key(&self, key: &KeyTuple) -> String {
        cache_key(&self.namespace, key)
    }

    /// Every cache key a write to `key` must evict: the snapshot itself and
    /// each dependent namespace keyed by a prefix of the tuple.
    pub fn eviction_keys(&self, key: &KeyTuple) -> Vec<String> {
        let mut keys = vec![self.cache_key(key)];
        for dependent in &self.dependents {
            keys.push(cache_key(&dependent.namespace, &key.prefix(dependent.key_len)));
        }
        keys
    }

    /// Snapshot TTL given the engine default. `None` = no expiry.
    pub fn snapshot_ttl(&self, default_secs: u64) -> Option<Duration> {
        match self.cache_ttl_secs.unwrap_or(default_secs) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Apply defaults and forced values, then check required columns.
    pub fn prepare_write(&self, mut row: ColumnMap) -> Result<ColumnMap, ValidationError> {
        for (column, value) in &self.write.defaults {
            row.entry(column.clone()).or_insert_with(|| value.clone());
        }
        for (column, value) in &self.write.forced {
            row.insert(column.clone(), value.clone());
        }
        for column in &self.write.required {
            if row.get(column).map_or(true, Value::is_null) {
                return Err(ValidationError::RequiredFieldMissing {
                    field: column.clone(),
                });
            }
        }
        Ok(row)
    }

    /// Bind a named filter to a value.
    pub fn bind_filter(&self, name: &str, value: Value) -> StrataResult<Predicate> {
        let filter = self.filters.get(name).ok_or_else(|| ConfigError::UnknownFilter {
            entity: self.name.clone(),
            filter: name.to_string(),
        })?;
        filter.bind(value).map_err(StrataError::from)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("name", self.name.is_empty()),
            ("table", self.table.is_empty()),
            ("key_columns", self.key_columns.is_empty()),
            ("namespace", self.namespace.is_empty()),
        ];
        for (field, missing) in required {
            if missing {
                return Err(ConfigError::MissingRequired {
                    field: format!("entities.{}.{}", self.name, field),
                });
            }
        }
        for dependent in &self.dependents {
            if dependent.key_len == 0 || dependent.key_len > self.key_arity() {
                return Err(ConfigError::InvalidValue {
                    field: format!("entities.{}.dependents.key_len", self.name),
                    value: dependent.key_len.to_string(),
                    reason: format!("must be between 1 and {}", self.key_arity()),
                });
            }
            if dependent.namespace == self.namespace {
                return Err(ConfigError::InvalidValue {
                    field: format!("entities.{}.dependents.namespace", self.name),
                    value: dependent.namespace.clone(),
                    reason: "must differ from the entity namespace".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Immutable map of entity name to configuration.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<String, Arc<EntityConfig>>,
}

impl EntityRegistry {
    pub fn new(entities: Vec<EntityConfig>) -> Result<Self, ConfigError> {
        let mut map = BTreeMap::new();
        for entity in entities {
            entity.validate()?;
            if map.contains_key(&entity.name) {
                return Err(ConfigError::DuplicateEntity { name: entity.name });
            }
            map.insert(entity.name.clone(), Arc::new(entity));
        }
        Ok(Self { entities: map })
    }

    pub fn get(&self, name: &str) -> Result<Arc<EntityConfig>, ConfigError> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownEntity {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
