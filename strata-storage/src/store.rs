//! Durable store boundary.
//!
//! The store is the single source of truth. Implementations translate the
//! engine's [`Filter`] into their native query language; every call is a
//! single statement and must be atomic on its own, which is what makes
//! [`RecordStore::update_where`] usable as a lock primitive.

use async_trait::async_trait;
use strata_core::{ColumnMap, EntityConfig, Filter, KeyTuple, StoreError};

/// Storage trait for config-described records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Rows whose full key is in `keys` (every row when `None`) and that pass
    /// `filter`. With `columns`, rows carry only those columns plus the key
    /// columns.
    async fn select(
        &self,
        entity: &EntityConfig,
        keys: Option<&[KeyTuple]>,
        filter: &Filter,
        columns: Option<&[String]>,
    ) -> Result<Vec<ColumnMap>, StoreError>;

    /// Insert rows, merging into existing rows on key conflict.
    /// All-or-nothing per call.
    async fn upsert(&self, entity: &EntityConfig, rows: &[ColumnMap]) -> Result<u64, StoreError>;

    /// Insert rows whose key is not taken yet. Existing rows are left
    /// untouched. Returns the keys inserted; all-or-nothing on failure.
    async fn insert_new(
        &self,
        entity: &EntityConfig,
        rows: &[ColumnMap],
    ) -> Result<Vec<KeyTuple>, StoreError>;

    /// `UPDATE .. SET set WHERE key IN keys AND filter`, one atomic statement.
    /// Returns the affected row count.
    async fn update_where(
        &self,
        entity: &EntityConfig,
        keys: &[KeyTuple],
        set: &ColumnMap,
        filter: &Filter,
    ) -> Result<u64, StoreError>;

    /// Per-row updates, each guarded by `filter`. Returns the affected row count.
    async fn update_rows(
        &self,
        entity: &EntityConfig,
        rows: &[(KeyTuple, ColumnMap)],
        filter: &Filter,
    ) -> Result<u64, StoreError>;

    /// Delete by key set. Returns the number of rows removed.
    async fn delete(&self, entity: &EntityConfig, keys: &[KeyTuple]) -> Result<u64, StoreError>;

    /// `DELETE WHERE key IN keys AND filter` (every row when `keys` is
    /// `None`), one atomic statement. Returns the keys removed.
    async fn delete_where(
        &self,
        entity: &EntityConfig,
        keys: Option<&[KeyTuple]>,
        filter: &Filter,
    ) -> Result<Vec<KeyTuple>, StoreError>;
}
