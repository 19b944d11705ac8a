//! Engine configuration.
//!
//! Loaded from TOML, optionally overridden from the environment, validated
//! once, then turned into an immutable [`EntityRegistry`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::entity::{EntityConfig, EntityRegistry};
use crate::error::ConfigError;

/// Cache tier switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheSettings {
    /// Master switch; when off every read goes to the store.
    pub enabled: bool,
    /// Write store hits back into the cache.
    pub repopulate: bool,
    /// Treat snapshots missing a required column as misses.
    pub check_shape: bool,
    /// Snapshot TTL when the entity sets none. 0 = no expiry.
    pub default_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            repopulate: true,
            check_shape: true,
            default_ttl_secs: 3600,
        }
    }
}

/// Consumable token settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TokenSettings {
    /// Lifetime of a token created without an explicit TTL.
    pub default_ttl_secs: u64,
    /// Claims older than this are treated as abandoned by acquire.
    pub max_lock_age_secs: u64,
    /// Skip the secret check on consume. Test environments only.
    pub bypass_locks: bool,
    /// Separator used to serialize the tag list.
    pub tag_delimiter: String,
    pub max_id_len: usize,
    pub max_action_len: usize,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 86_400,
            max_lock_age_secs: 30,
            bypass_locks: false,
            tag_delimiter: ",".to_string(),
            max_id_len: 256,
            max_action_len: 1024,
        }
    }
}

impl TokenSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn max_lock_age(&self) -> Duration {
        Duration::from_secs(self.max_lock_age_secs)
    }
}

/// Address shape for allow/deny lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AccessSettings {
    pub component_separator: char,
    pub component_count: usize,
    /// Inclusive upper bound of every component.
    pub component_max: u32,
}

impl Default for AccessSettings {
    fn default() -> Self {
        Self {
            component_separator: '.',
            component_count: 4,
            component_max: 255,
        }
    }
}

/// Master configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub tokens: TokenSettings,
    #[serde(default)]
    pub access: AccessSettings,
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(input).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Override switches from `STRATA_CACHE_ENABLED` and `STRATA_BYPASS_LOCKS`.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(enabled) = env_flag("STRATA_CACHE_ENABLED")? {
            self.cache.enabled = enabled;
        }
        if let Some(bypass) = env_flag("STRATA_BYPASS_LOCKS")? {
            self.tokens.bypass_locks = bypass;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tokens.tag_delimiter.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "tokens.tag_delimiter".to_string(),
                value: String::new(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.tokens.max_lock_age_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tokens.max_lock_age_secs".to_string(),
                value: "0".to_string(),
                reason: "every claim from an earlier second would count as stale".to_string(),
            });
        }
        if i64::try_from(self.tokens.max_lock_age_secs).is_err() {
            return Err(ConfigError::InvalidValue {
                field: "tokens.max_lock_age_secs".to_string(),
                value: self.tokens.max_lock_age_secs.to_string(),
                reason: format!("must not exceed {}", i64::MAX),
            });
        }
        if self.access.component_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "access.component_count".to_string(),
                value: "0".to_string(),
                reason: "addresses need at least one component".to_string(),
            });
        }
        let mut names = std::collections::HashSet::new();
        for entity in &self.entities {
            entity.validate()?;
            if !names.insert(entity.name.as_str()) {
                return Err(ConfigError::DuplicateEntity {
                    name: entity.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Build the entity registry.
    pub fn registry(&self) -> Result<EntityRegistry, ConfigError> {
        EntityRegistry::new(self.entities.clone())
    }
}

fn env_flag(name: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => parse_flag(name, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_flag(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: name.to_string(),
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
