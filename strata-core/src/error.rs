//! Error types for STRATA operations

use thiserror::Error;

/// Durable store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Connectivity or transport failure. Callers may retry.
    #[error("Store unavailable during {operation} on {table}: {reason}")]
    Unavailable {
        table: String,
        operation: String,
        reason: String,
    },

    #[error("Query failed on {table}: {reason}")]
    QueryFailed { table: String, reason: String },

    #[error("Write failed on {table}: {reason}")]
    WriteFailed { table: String, reason: String },

    #[error("Unknown table: {table}")]
    UnknownTable { table: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Whether the failure is transient (the record may well exist).
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. } | StoreError::LockPoisoned)
    }
}

/// Key-value cache errors. None of these are fatal to a read or a write.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache unavailable during {operation}: {reason}")]
    Unavailable { operation: String, reason: String },

    #[error("Snapshot codec error for {key}: {reason}")]
    Codec { key: String, reason: String },

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Unknown entity type: {name}")]
    UnknownEntity { name: String },

    #[error("Duplicate entity type: {name}")]
    DuplicateEntity { name: String },

    #[error("Unknown named filter {filter} on entity {entity}")]
    UnknownFilter { entity: String, filter: String },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },

    #[error("Telemetry initialization failed: {reason}")]
    Telemetry { reason: String },
}

/// Validation errors for records and requests.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Value for {field} is {len} characters, limit is {max}")]
    TooLong { field: String, len: usize, max: usize },

    #[error("Key for {entity} has {got} parts, expected {expected}")]
    KeyArity {
        entity: String,
        expected: usize,
        got: usize,
    },

    #[error("Invalid pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Per-key failures of the consumable-resource protocol.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Resource not found: {key}")]
    NotFound { key: String },

    #[error("Lock contention: acquired {acquired} of {requested} claims")]
    LockContention { requested: usize, acquired: usize },

    #[error("Resource {key} is locked by another holder")]
    LockHeldByOther { key: String },

    #[error("Resource {key} has {remaining} uses left, {requested} requested")]
    InsufficientResource {
        key: String,
        remaining: i64,
        requested: i64,
    },

    #[error("Action {action} is outside the scope of {key}")]
    ScopeMismatch { key: String, action: String },

    #[error("Resource {key} expired at {expired_at}")]
    Expired { key: String, expired_at: i64 },

    #[error("Invalid request for {key}: {reason}")]
    InvalidRequest { key: String, reason: String },

    #[error("Resource {key} already exists")]
    AlreadyExists { key: String },

    #[error("Store failure on {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: StoreError,
    },
}

impl ResourceError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ResourceError::NotFound { .. } => "not_found",
            ResourceError::LockContention { .. } => "lock_contention",
            ResourceError::LockHeldByOther { .. } => "locked_by_other",
            ResourceError::InsufficientResource { .. } => "insufficient_uses",
            ResourceError::ScopeMismatch { .. } => "scope_mismatch",
            ResourceError::Expired { .. } => "expired",
            ResourceError::InvalidRequest { .. } => "invalid_request",
            ResourceError::AlreadyExists { .. } => "already_exists",
            ResourceError::Store { .. } => "store_unavailable",
        }
    }
}

/// Master error type for all STRATA errors.
#[derive(Debug, Clone, Error)]
pub enum StrataError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),
}

/// Result type alias for STRATA operations.
pub type StrataResult<T> = Result<T, StrataError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display_unavailable() {
        let err = StoreError::Unavailable {
            table: "tokens".to_string(),
            operation: "select".to_string(),
            reason: "connection reset".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("unavailable"));
        assert!(msg.contains("tokens"));
        assert!(msg.contains("connection reset"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_query_failure_is_not_retryable() {
        let err = StoreError::QueryFailed {
            table: "tokens".to_string(),
            reason: "bad column".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_resource_error_codes_are_distinct() {
        let errors = [
            ResourceError::NotFound { key: "a".into() },
            ResourceError::LockContention {
                requested: 2,
                acquired: 1,
            },
            ResourceError::LockHeldByOther { key: "a".into() },
            ResourceError::InsufficientResource {
                key: "a".into(),
                remaining: 1,
                requested: 2,
            },
            ResourceError::ScopeMismatch {
                key: "a".into(),
                action: "write".into(),
            },
            ResourceError::Expired {
                key: "a".into(),
                expired_at: 0,
            },
            ResourceError::InvalidRequest {
                key: "a".into(),
                reason: "uses must be positive".into(),
            },
            ResourceError::AlreadyExists { key: "a".into() },
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_validation_error_display_too_long() {
        let err = ValidationError::TooLong {
            field: "token_id".to_string(),
            len: 300,
            max: 256,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("token_id"));
        assert!(msg.contains("300"));
        assert!(msg.contains("256"));
    }

    #[test]
    fn test_strata_error_from_variants() {
        let store = StrataError::from(StoreError::LockPoisoned);
        assert!(matches!(store, StrataError::Store(_)));

        let cache = StrataError::from(CacheError::LockPoisoned);
        assert!(matches!(cache, StrataError::Cache(_)));

        let config = StrataError::from(ConfigError::UnknownEntity {
            name: "tokens".to_string(),
        });
        assert!(matches!(config, StrataError::Config(_)));

        let validation = StrataError::from(ValidationError::RequiredFieldMissing {
            field: "name".to_string(),
        });
        assert!(matches!(validation, StrataError::Validation(_)));

        let resource = StrataError::from(ResourceError::NotFound {
            key: "t1".to_string(),
        });
        assert!(matches!(resource, StrataError::Resource(_)));
    }
}
