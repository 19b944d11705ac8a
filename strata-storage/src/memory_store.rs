//! In-memory reference store.
//!
//! Every statement runs under one table-map write lock, so conditional
//! updates are atomic exactly the way a single relational statement is.
//! Failure injection and a call log make it usable as a test double.

use async_trait::async_trait;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use serde_json::Value;
use strata_core::{
    ColumnMap, EntityConfig, Evaluation, Filter, KeyTuple, StoreError, SubqueryLookup, Tier,
};

use crate::store::RecordStore;

/// Store operation classes for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Select,
    Upsert,
    Update,
    Delete,
}

impl StoreOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOperation::Select => "select",
            StoreOperation::Upsert => "upsert",
            StoreOperation::Update => "update",
            StoreOperation::Delete => "delete",
        }
    }
}

/// Rows of one table keyed by encoded full key.
type Table = BTreeMap<String, ColumnMap>;

/// In-memory store for testing and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Table>>,
    failing: Mutex<HashSet<StoreOperation>>,
    selects: AtomicU64,
    fetched_keys: Mutex<Vec<String>>,
}

struct TablesView<'a>(&'a HashMap<String, Table>);

impl SubqueryLookup for TablesView<'_> {
    fn lookup(&self, table: &str, select: &str, filter: &Filter) -> Option<Vec<Value>> {
        let Some(rows) = self.0.get(table) else {
            return Some(Vec::new());
        };
        let mut values = Vec::new();
        for row in rows.values() {
            match filter.evaluate(row, Tier::Store(self)) {
                Evaluation::Pass => {
                    if let Some(v) = row.get(select).filter(|v| !v.is_null()) {
                        values.push(v.clone());
                    }
                }
                Evaluation::Fail => {}
                Evaluation::Unsupported => return None,
            }
        }
        Some(values)
    }
}

fn row_matches(
    row: &ColumnMap,
    filter: &Filter,
    view: &TablesView<'_>,
    table: &str,
) -> Result<bool, StoreError> {
    match filter.evaluate(row, Tier::Store(view)) {
        Evaluation::Pass => Ok(true),
        Evaluation::Fail => Ok(false),
        Evaluation::Unsupported => Err(StoreError::QueryFailed {
            table: table.to_string(),
            reason: "filter contains a predicate the in-memory store cannot evaluate"
                .to_string(),
        }),
    }
}

fn project(entity: &EntityConfig, row: &ColumnMap, columns: Option<&[String]>) -> ColumnMap {
    match columns {
        None => row.clone(),
        Some(columns) => row
            .iter()
            .filter(|(name, _)| entity.is_key_column(name) || columns.contains(*name))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `operation` fail with `StoreError::Unavailable`.
    pub fn fail(&self, operation: StoreOperation) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(operation);
        }
    }

    /// Undo [`MemoryStore::fail`].
    pub fn recover(&self, operation: StoreOperation) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.remove(&operation);
        }
    }

    /// Toggle every operation at once.
    pub fn set_available(&self, available: bool) {
        for op in [
            StoreOperation::Select,
            StoreOperation::Upsert,
            StoreOperation::Update,
            StoreOperation::Delete,
        ] {
            if available {
                self.recover(op);
            } else {
                self.fail(op);
            }
        }
    }

    /// Number of `select` calls served so far.
    pub fn select_calls(&self) -> u64 {
        self.selects.load(Ordering::SeqCst)
    }

    /// Encoded keys requested through keyed `select` calls, in order.
    pub fn fetched_keys(&self) -> Vec<String> {
        self.fetched_keys
            .lock()
            .map(|keys| keys.clone())
            .unwrap_or_default()
    }

    /// Reset the call log.
    pub fn clear_call_log(&self) {
        self.selects.store(0, Ordering::SeqCst);
        if let Ok(mut keys) = self.fetched_keys.lock() {
            keys.clear();
        }
    }

    /// Read one row directly, bypassing the trait.
    pub fn row(&self, entity: &EntityConfig, key: &KeyTuple) -> Option<ColumnMap> {
        let tables = self.tables.read().ok()?;
        tables.get(&entity.table)?.get(&key.encode()).cloned()
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .map(|tables| tables.get(table).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    fn check(&self, operation: StoreOperation, table: &str) -> Result<(), StoreError> {
        let failing = self.failing.lock().map_err(|_| StoreError::LockPoisoned)?;
        if failing.contains(&operation) {
            return Err(StoreError::Unavailable {
                table: table.to_string(),
                operation: operation.as_str().to_string(),
                reason: "store is unavailable".to_string(),
            });
        }
        Ok(())
    }

    /// Encoded keys among `keys` whose rows pass `filter`.
    fn matching_keys(
        tables: &HashMap<String, Table>,
        entity: &EntityConfig,
        keys: impl Iterator<Item = String>,
        filter: &Filter,
    ) -> Result<Vec<String>, StoreError> {
        let Some(table) = tables.get(&entity.table) else {
            return Ok(Vec::new());
        };
        let view = TablesView(tables);
        let mut matched = Vec::new();
        for encoded in keys {
            if let Some(row) = table.get(&encoded) {
                if row_matches(row, filter, &view, &entity.table)? && !matched.contains(&encoded) {
                    matched.push(encoded);
                }
            }
        }
        Ok(matched)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn select(
        &self,
        entity: &EntityConfig,
        keys: Option<&[KeyTuple]>,
        filter: &Filter,
        columns: Option<&[String]>,
    ) -> Result<Vec<ColumnMap>, StoreError> {
        self.check(StoreOperation::Select, &entity.table)?;
        self.selects.fetch_add(1, Ordering::SeqCst);
        if let Some(keys) = keys {
            if let Ok(mut log) = self.fetched_keys.lock() {
                log.extend(keys.iter().map(KeyTuple::encode));
            }
        }

        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        let Some(table) = tables.get(&entity.table) else {
            return Ok(Vec::new());
        };
        let view = TablesView(&tables);
        let candidates: Vec<&ColumnMap> = match keys {
            Some(keys) => keys
                .iter()
                .filter_map(|k| table.get(&k.encode()))
                .collect(),
            None => table.values().collect(),
        };

        let mut rows = Vec::with_capacity(candidates.len());
        for row in candidates {
            if row_matches(row, filter, &view, &entity.table)? {
                rows.push(project(entity, row, columns));
            }
        }
        Ok(rows)
    }

    async fn upsert(&self, entity: &EntityConfig, rows: &[ColumnMap]) -> Result<u64, StoreError> {
        self.check(StoreOperation::Upsert, &entity.table)?;
        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let key = entity.key_of(row).map_err(|e| StoreError::WriteFailed {
                table: entity.table.clone(),
                reason: e.to_string(),
            })?;
            keyed.push((key.encode(), row));
        }

        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        let table = tables.entry(entity.table.clone()).or_default();
        for (encoded, row) in keyed {
            let existing = table.entry(encoded).or_default();
            for (column, value) in row {
                existing.insert(column.clone(), value.clone());
            }
        }
        Ok(rows.len() as u64)
    }

    async fn insert_new(
        &self,
        entity: &EntityConfig,
        rows: &[ColumnMap],
    ) -> Result<Vec<KeyTuple>, StoreError> {
        self.check(StoreOperation::Upsert, &entity.table)?;
        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let key = entity.key_of(row).map_err(|e| StoreError::WriteFailed {
                table: entity.table.clone(),
                reason: e.to_string(),
            })?;
            keyed.push((key, row));
        }

        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        let table = tables.entry(entity.table.clone()).or_default();
        let mut inserted = Vec::with_capacity(keyed.len());
        for (key, row) in keyed {
            if let Entry::Vacant(slot) = table.entry(key.encode()) {
                slot.insert(row.clone());
                inserted.push(key);
            }
        }
        Ok(inserted)
    }

    async fn update_where(
        &self,
        entity: &EntityConfig,
        keys: &[KeyTuple],
        set: &ColumnMap,
        filter: &Filter,
    ) -> Result<u64, StoreError> {
        self.check(StoreOperation::Update, &entity.table)?;
        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        let matched =
            Self::matching_keys(&tables, entity, keys.iter().map(KeyTuple::encode), filter)?;
        if let Some(table) = tables.get_mut(&entity.table) {
            for encoded in &matched {
                if let Some(row) = table.get_mut(encoded) {
                    for (column, value) in set {
                        row.insert(column.clone(), value.clone());
                    }
                }
            }
        }
        Ok(matched.len() as u64)
    }

    async fn update_rows(
        &self,
        entity: &EntityConfig,
        rows: &[(KeyTuple, ColumnMap)],
        filter: &Filter,
    ) -> Result<u64, StoreError> {
        self.check(StoreOperation::Update, &entity.table)?;
        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        let matched = Self::matching_keys(
            &tables,
            entity,
            rows.iter().map(|(k, _)| k.encode()),
            filter,
        )?;
        let Some(table) = tables.get_mut(&entity.table) else {
            return Ok(0);
        };
        let mut affected = 0u64;
        for (key, set) in rows {
            let encoded = key.encode();
            if !matched.contains(&encoded) {
                continue;
            }
            if let Some(row) = table.get_mut(&encoded) {
                for (column, value) in set {
                    row.insert(column.clone(), value.clone());
                }
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn delete(&self, entity: &EntityConfig, keys: &[KeyTuple]) -> Result<u64, StoreError> {
        self.check(StoreOperation::Delete, &entity.table)?;
        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        let Some(table) = tables.get_mut(&entity.table) else {
            return Ok(0);
        };
        let removed = keys
            .iter()
            .filter(|k| table.remove(&k.encode()).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn delete_where(
        &self,
        entity: &EntityConfig,
        keys: Option<&[KeyTuple]>,
        filter: &Filter,
    ) -> Result<Vec<KeyTuple>, StoreError> {
        self.check(StoreOperation::Delete, &entity.table)?;
        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        let candidates: Vec<String> = match (keys, tables.get(&entity.table)) {
            (_, None) => return Ok(Vec::new()),
            (Some(keys), Some(_)) => keys.iter().map(KeyTuple::encode).collect(),
            (None, Some(table)) => table.keys().cloned().collect(),
        };
        let matched = Self::matching_keys(&tables, entity, candidates.into_iter(), filter)?;
        let Some(table) = tables.get_mut(&entity.table) else {
            return Ok(Vec::new());
        };
        let mut removed = Vec::with_capacity(matched.len());
        for encoded in matched {
            if let Some(row) = table.remove(&encoded) {
                if let Ok(key) = entity.key_of(&row) {
                    removed.push(key);
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_core::{columns, Predicate};

    fn entity() -> EntityConfig {
        EntityConfig::new("token", "tokens", &["token_id"], "token:")
    }

    fn token(id: &str, uses: i64) -> ColumnMap {
        columns([
            ("token_id", json!(id)),
            ("uses", json!(uses)),
            ("lock", Value::Null),
        ])
    }

    #[tokio::test]
    async fn test_upsert_and_select_by_key() {
        let store = MemoryStore::new();
        let entity = entity();
        store.upsert(&entity, &[token("a", 1), token("b", 2)]).await.unwrap();

        let rows = store
            .select(&entity, Some(&[KeyTuple::single("b")]), &Filter::all(), None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["uses"], json!(2));
        assert_eq!(store.fetched_keys(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_upsert_merges_columns() {
        let store = MemoryStore::new();
        let entity = entity();
        store.upsert(&entity, &[token("a", 1)]).await.unwrap();
        store
            .upsert(&entity, &[columns([("token_id", json!("a")), ("action", json!("x"))])])
            .await
            .unwrap();
        let row = store.row(&entity, &KeyTuple::single("a")).unwrap();
        assert_eq!(row["uses"], json!(1));
        assert_eq!(row["action"], json!("x"));
    }

    #[tokio::test]
    async fn test_upsert_without_key_is_all_or_nothing() {
        let store = MemoryStore::new();
        let entity = entity();
        let result = store
            .upsert(&entity, &[token("a", 1), columns([("uses", json!(1))])])
            .await;
        assert!(matches!(result, Err(StoreError::WriteFailed { .. })));
        assert_eq!(store.row_count("tokens"), 0);
    }

    #[tokio::test]
    async fn test_conditional_update_only_when_null() {
        let store = MemoryStore::new();
        let entity = entity();
        store.upsert(&entity, &[token("a", 1)]).await.unwrap();
        let keys = [KeyTuple::single("a")];
        let guard = Filter::all().with(Predicate::is_null("lock"));

        let first = store
            .update_where(&entity, &keys, &columns([("lock", json!("s1"))]), &guard)
            .await
            .unwrap();
        let second = store
            .update_where(&entity, &keys, &columns([("lock", json!("s2"))]), &guard)
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(store.row(&entity, &keys[0]).unwrap()["lock"], json!("s1"));
    }

    #[tokio::test]
    async fn test_update_rows_guarded() {
        let store = MemoryStore::new();
        let entity = entity();
        store.upsert(&entity, &[token("a", 3), token("b", 3)]).await.unwrap();
        let guard = Filter::all().with(Predicate::gte("uses", 3));
        let affected = store
            .update_rows(
                &entity,
                &[
                    (KeyTuple::single("a"), columns([("uses", json!(2))])),
                    (KeyTuple::single("missing"), columns([("uses", json!(2))])),
                ],
                &guard,
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);
    }

    #[tokio::test]
    async fn test_delete_where() {
        let store = MemoryStore::new();
        let entity = entity();
        store
            .upsert(&entity, &[token("a", 0), token("b", 2), token("c", 0)])
            .await
            .unwrap();
        let removed = store
            .delete_where(&entity, None, &Filter::all().with(Predicate::lte("uses", 0)))
            .await
            .unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(store.row_count("tokens"), 1);
    }

    #[tokio::test]
    async fn test_keyed_delete_where_checks_filter() {
        let store = MemoryStore::new();
        let entity = entity();
        store
            .upsert(&entity, &[token("a", 0), token("b", 0), token("c", 0)])
            .await
            .unwrap();
        let removed = store
            .delete_where(
                &entity,
                Some(&[KeyTuple::single("a"), KeyTuple::single("b")][..]),
                &Filter::all().with(Predicate::eq("token_id", "b")),
            )
            .await
            .unwrap();
        assert_eq!(removed, vec![KeyTuple::single("b")]);
        assert_eq!(store.row_count("tokens"), 2);
    }

    #[tokio::test]
    async fn test_insert_new_keeps_existing_rows() {
        let store = MemoryStore::new();
        let entity = entity();
        store.upsert(&entity, &[token("a", 5)]).await.unwrap();
        let inserted = store
            .insert_new(&entity, &[token("a", 1), token("b", 1), token("b", 9)])
            .await
            .unwrap();
        assert_eq!(inserted, vec![KeyTuple::single("b")]);
        let a = store.row(&entity, &KeyTuple::single("a")).unwrap();
        assert_eq!(a["uses"], json!(5));
        let b = store.row(&entity, &KeyTuple::single("b")).unwrap();
        assert_eq!(b["uses"], json!(1));
    }

    #[tokio::test]
    async fn test_subquery_membership() {
        let store = MemoryStore::new();
        let entity = entity();
        let tags = EntityConfig::new("token_tag", "token_tags", &["token_id", "tag"], "tt:");
        store.upsert(&entity, &[token("a", 1), token("b", 1)]).await.unwrap();
        store
            .upsert(&tags, &[columns([("token_id", json!("b")), ("tag", json!("promo"))])])
            .await
            .unwrap();

        let filter = Filter::all().with(Predicate::in_subquery(
            "token_id",
            "token_tags",
            "token_id",
            Filter::all().with(Predicate::eq("tag", "promo")),
        ));
        let rows = store.select(&entity, None, &filter, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["token_id"], json!("b"));
    }

    #[tokio::test]
    async fn test_raw_predicate_is_query_failure() {
        let store = MemoryStore::new();
        let entity = entity();
        store.upsert(&entity, &[token("a", 1)]).await.unwrap();
        let filter = Filter::all().with(Predicate::raw("uses > 0", vec![]));
        let result = store.select(&entity, None, &filter, None).await;
        assert!(matches!(result, Err(StoreError::QueryFailed { .. })));
    }

    #[tokio::test]
    async fn test_projection_keeps_key_columns() {
        let store = MemoryStore::new();
        let entity = entity();
        store.upsert(&entity, &[token("a", 1)]).await.unwrap();
        let cols = vec!["uses".to_string()];
        let rows = store
            .select(&entity, None, &Filter::all(), Some(&cols))
            .await
            .unwrap();
        assert_eq!(rows[0].len(), 2);
        assert!(rows[0].contains_key("token_id"));
        assert!(!rows[0].contains_key("lock"));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::new();
        let entity = entity();
        store.fail(StoreOperation::Select);
        let result = store.select(&entity, None, &Filter::all(), None).await;
        assert!(matches!(result, Err(StoreError::Unavailable { .. })));
        store.recover(StoreOperation::Select);
        assert!(store.select(&entity, None, &Filter::all(), None).await.is_ok());
    }
}
