//! Token records and requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use strata_core::{
    columns, ColumnMap, EntityConfig, TokenSettings, ValidationError, WriteSpec,
};

/// Column names of the token table.
pub mod column {
    pub const ID: &str = "token_id";
    pub const ACTION: &str = "action";
    pub const USES: &str = "uses";
    pub const EXPIRES: &str = "expires";
    pub const TAGS: &str = "tags";
    pub const LOCK: &str = "lock";
    pub const LOCKED_AT: &str = "locked_at";
    pub const CREATED_AT: &str = "created_at";
}

pub const TOKEN_ENTITY: &str = "token";

/// Entity configuration of the token table.
pub fn token_entity() -> EntityConfig {
    EntityConfig::new(TOKEN_ENTITY, "tokens", &[column::ID], "token:")
        .with_expiry_column(column::EXPIRES)
        .with_write(WriteSpec {
            required: vec![
                column::ACTION.to_string(),
                column::USES.to_string(),
                column::EXPIRES.to_string(),
            ],
            ..Default::default()
        })
}

/// Request to create one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSpec {
    pub id: String,
    /// Regex over action names. Empty matches every action.
    pub action: String,
    pub uses: i64,
    /// `None` uses the configured default.
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl TokenSpec {
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            uses: 1,
            ttl: None,
            tags: Vec::new(),
        }
    }

    pub fn with_uses(mut self, uses: i64) -> Self {
        self.uses = uses;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self, settings: &TokenSettings) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: column::ID.to_string(),
            });
        }
        let id_len = self.id.chars().count();
        if id_len > settings.max_id_len {
            return Err(ValidationError::TooLong {
                field: column::ID.to_string(),
                len: id_len,
                max: settings.max_id_len,
            });
        }
        let action_len = self.action.chars().count();
        if action_len > settings.max_action_len {
            return Err(ValidationError::TooLong {
                field: column::ACTION.to_string(),
                len: action_len,
                max: settings.max_action_len,
            });
        }
        if !self.action.is_empty() {
            regex::Regex::new(&self.action).map_err(|e| ValidationError::InvalidPattern {
                pattern: self.action.clone(),
                reason: e.to_string(),
            })?;
        }
        if self.uses < 1 {
            return Err(ValidationError::InvalidValue {
                field: column::USES.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let delimiter = settings.tag_delimiter.as_str();
        if let Some(tag) = self.tags.iter().find(|t| t.contains(delimiter)) {
            return Err(ValidationError::InvalidValue {
                field: column::TAGS.to_string(),
                reason: format!("tag {tag:?} contains the delimiter {delimiter:?}"),
            });
        }
        Ok(())
    }

    /// Row for a freshly created, unlocked token.
    pub fn to_row(&self, settings: &TokenSettings, now: i64) -> ColumnMap {
        let ttl = self.ttl.unwrap_or_else(|| settings.default_ttl());
        let expires = now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX));
        columns([
            (column::ID, Value::from(self.id.clone())),
            (column::ACTION, Value::from(self.action.clone())),
            (column::USES, Value::from(self.uses)),
            (column::EXPIRES, Value::from(expires)),
            (column::TAGS, Value::from(self.tags.join(settings.tag_delimiter.as_str()))),
            (column::LOCK, Value::Null),
            (column::LOCKED_AT, Value::Null),
            (column::CREATED_AT, Value::from(now)),
        ])
    }
}

/// Read-only view of a stored token. Never carries the lock secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub action: String,
    pub uses: i64,
    pub expires_at: i64,
    pub tags: Vec<String>,
    pub locked: bool,
    pub locked_at: Option<i64>,
}

impl Token {
    pub fn from_row(row: &ColumnMap, delimiter: &str) -> Result<Self, ValidationError> {
        fn text<'r>(row: &'r ColumnMap, name: &str) -> &'r str {
            row.get(name).and_then(Value::as_str).unwrap_or_default()
        }
        let int = |name: &str| {
            row.get(name)
                .and_then(Value::as_i64)
                .ok_or_else(|| ValidationError::RequiredFieldMissing {
                    field: name.to_string(),
                })
        };
        let id = text(row, column::ID);
        if id.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: column::ID.to_string(),
            });
        }
        let tags = text(row, column::TAGS);
        Ok(Token {
            id: id.to_string(),
            action: text(row, column::ACTION).to_string(),
            uses: int(column::USES)?,
            expires_at: int(column::EXPIRES)?,
            tags: if tags.is_empty() {
                Vec::new()
            } else {
                tags.split(delimiter).map(str::to_string).collect()
            },
            locked: row.get(column::LOCK).is_some_and(|v| !v.is_null()),
            locked_at: row.get(column::LOCKED_AT).and_then(Value::as_i64),
        })
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// Spend `uses` of token `id` on `action`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeRequest {
    pub id: String,
    pub action: String,
    pub uses: i64,
}

impl ConsumeRequest {
    pub fn new(id: impl Into<String>, action: impl Into<String>, uses: i64) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            uses,
        }
    }
}

/// Successful consumption of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOutcome {
    /// Uses left after this request.
    pub remaining: i64,
    /// The token was used up and removed.
    pub deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings() -> TokenSettings {
        TokenSettings::default()
    }

    #[test]
    fn test_spec_defaults() {
        let spec = TokenSpec::new("t1", "download");
        assert_eq!(spec.uses, 1);
        assert!(spec.validate(&settings()).is_ok());
    }

    #[test]
    fn test_spec_rejects_long_id() {
        let spec = TokenSpec::new("x".repeat(257), "");
        assert!(matches!(
            spec.validate(&settings()),
            Err(ValidationError::TooLong { len: 257, max: 256, .. })
        ));
    }

    #[test]
    fn test_spec_rejects_long_action() {
        let spec = TokenSpec::new("t1", "a".repeat(1025));
        assert!(matches!(
            spec.validate(&settings()),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn test_spec_rejects_bad_pattern() {
        let spec = TokenSpec::new("t1", "(unclosed");
        assert!(matches!(
            spec.validate(&settings()),
            Err(ValidationError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_spec_rejects_delimiter_in_tag() {
        let spec = TokenSpec::new("t1", "").with_tags(["a,b"]);
        assert!(matches!(
            spec.validate(&settings()),
            Err(ValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_spec_rejects_zero_uses() {
        let spec = TokenSpec::new("t1", "").with_uses(0);
        assert!(spec.validate(&settings()).is_err());
    }

    #[test]
    fn test_row_round_trip_through_view() {
        let spec = TokenSpec::new("t1", "^dl$")
            .with_uses(3)
            .with_ttl(Duration::from_secs(60))
            .with_tags(["promo", "spring"]);
        let row = spec.to_row(&settings(), 1_000);
        assert_eq!(row[column::EXPIRES], json!(1_060));
        assert_eq!(row[column::TAGS], json!("promo,spring"));

        let token = Token::from_row(&row, ",").unwrap();
        assert_eq!(token.uses, 3);
        assert_eq!(token.tags, vec!["promo", "spring"]);
        assert!(!token.locked);
        assert!(!token.is_expired(1_059));
        assert!(token.is_expired(1_060));
    }

    #[test]
    fn test_default_ttl_applied() {
        let row = TokenSpec::new("t1", "").to_row(&settings(), 0);
        assert_eq!(row[column::EXPIRES], json!(86_400));
    }
}
