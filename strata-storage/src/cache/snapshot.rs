//! Snapshot codec.
//!
//! A snapshot holds a record's non-key columns as a JSON object. Key columns
//! are implied by the cache key and restored from the key tuple on decode.

use serde_json::Value;
use strata_core::{CacheError, ColumnMap, EntityConfig, KeyTuple};

/// Serialize the non-key columns of `row`.
pub fn encode(entity: &EntityConfig, cache_key: &str, row: &ColumnMap) -> Result<String, CacheError> {
    let body: ColumnMap = row
        .iter()
        .filter(|(column, _)| !entity.is_key_column(column))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    serde_json::to_string(&body).map_err(|e| CacheError::Codec {
        key: cache_key.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a snapshot and put the key columns back.
pub fn decode(
    entity: &EntityConfig,
    key: &KeyTuple,
    cache_key: &str,
    raw: &str,
) -> Result<ColumnMap, CacheError> {
    let codec_error = |reason: String| CacheError::Codec {
        key: cache_key.to_string(),
        reason,
    };
    let mut row = match serde_json::from_str::<Value>(raw).map_err(|e| codec_error(e.to_string()))? {
        Value::Object(map) => map.into_iter().collect::<ColumnMap>(),
        other => return Err(codec_error(format!("expected an object, found {other}"))),
    };
    if key.len() != entity.key_arity() {
        return Err(codec_error(format!(
            "key has {} parts, entity {} expects {}",
            key.len(),
            entity.name,
            entity.key_arity()
        )));
    }
    for (column, value) in entity.full_key_columns().zip(key.parts()) {
        row.insert(column.to_string(), value.clone());
    }
    Ok(row)
}

/// Whether `row` carries every column in `required`.
pub fn has_shape(row: &ColumnMap, required: &[String]) -> bool {
    required.iter().all(|column| row.contains_key(column))
}
