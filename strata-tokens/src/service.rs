//! Token lifecycle and the acquire/consume/release protocol.
//!
//! Mutual exclusion comes from one conditional update in the store:
//! `SET lock = secret, locked_at = now WHERE token_id IN (..) AND (lock IS
//! NULL OR locked_at < now - max_age)`. Counters are always read from the
//! store, never from the cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use strata_core::{
    columns, now_epoch, ColumnMap, EngineConfig, EntityConfig, Filter, KeyTuple, Predicate,
    ResourceError, StoreError, StrataError, StrataResult, TokenSettings,
};
use strata_storage::{
    CacheBackend, DeleteReport, RecordStore, ResolveRequest, Resolution, Resolver, WritePipeline,
};
use tracing::{debug, error, info, warn};

use crate::lock::{generate_secret, ClaimData, Held, LockClaim, Released};
use crate::model::{column, token_entity, ConsumeOutcome, ConsumeRequest, Token, TokenSpec};

/// Per-id outcomes, in request order.
pub type TokenResults<T> = Vec<(String, Result<T, ResourceError>)>;

/// Whether `action` is inside the stored scope pattern. Empty scope is a
/// wildcard; otherwise the pattern must match the whole action.
pub fn scope_allows(scope: &str, action: &str) -> bool {
    if scope.is_empty() {
        return true;
    }
    Regex::new(&format!("^(?:{scope})$"))
        .map(|re| re.is_match(action))
        .unwrap_or(false)
}

fn token_key(id: &str) -> KeyTuple {
    KeyTuple::single(id)
}

fn dedupe<S: AsRef<str>>(ids: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(|id| id.as_ref().to_string())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// A request that passed every check, waiting to be written.
struct Accepted {
    index: usize,
    id: String,
    remaining: i64,
}

/// Consumable tokens on top of the record store.
pub struct TokenService {
    entity: Arc<EntityConfig>,
    store: Arc<dyn RecordStore>,
    resolver: Resolver,
    pipeline: WritePipeline,
    settings: TokenSettings,
}

impl TokenService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cache: Arc<dyn CacheBackend>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            entity: Arc::new(token_entity()),
            resolver: Resolver::new(store.clone(), cache.clone(), config.cache.clone()),
            pipeline: WritePipeline::new(store.clone(), cache),
            store,
            settings: config.tokens.clone(),
        }
    }

    pub fn entity(&self) -> &EntityConfig {
        &self.entity
    }

    pub fn settings(&self) -> &TokenSettings {
        &self.settings
    }

    /// Create tokens. Results are aligned with `specs`.
    ///
    /// Ids already present are reported as [`ResourceError::AlreadyExists`]
    /// and their rows, locks included, are left untouched.
    pub async fn create(&self, specs: Vec<TokenSpec>) -> Vec<StrataResult<String>> {
        let now = now_epoch();
        let mut results: Vec<StrataResult<String>> = Vec::with_capacity(specs.len());
        let mut rows = Vec::new();
        let mut slots = Vec::new();
        for spec in &specs {
            let row = spec
                .validate(&self.settings)
                .and_then(|()| self.entity.prepare_write(spec.to_row(&self.settings, now)));
            match row {
                Ok(row) => {
                    slots.push(results.len());
                    results.push(Ok(spec.id.clone()));
                    rows.push(row);
                }
                Err(e) => {
                    debug!(token = %spec.id, error = %e, "Rejected token spec");
                    results.push(Err(e.into()));
                }
            }
        }
        if rows.is_empty() {
            return results;
        }

        let inserted = match self.store.insert_new(&self.entity, &rows).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(tokens = slots.len(), operation = "create", error = %e, "Token insert failed");
                for slot in slots {
                    results[slot] = Err(e.clone().into());
                }
                return results;
            }
        };

        let mut fresh: HashSet<String> = inserted.iter().map(KeyTuple::encode).collect();
        for slot in slots {
            let Ok(id) = &results[slot] else { continue };
            if !fresh.remove(&token_key(id).encode()) {
                let key = id.clone();
                debug!(token = %key, "Token id already exists");
                results[slot] = Err(ResourceError::AlreadyExists { key }.into());
            }
        }
        self.pipeline.invalidate(&self.entity, &inserted).await;
        results
    }

    /// Read tokens for display. Served through the cache, so the counter
    /// may lag behind the store by up to the snapshot TTL.
    pub async fn get<S: AsRef<str>>(&self, ids: &[S]) -> StrataResult<TokenResults<Token>> {
        let ids = dedupe(ids);
        let request = ResolveRequest::keys(ids.iter().map(|id| token_key(id)));
        let resolved = self.resolver.resolve(&self.entity, &request).await?;
        let now = now_epoch();

        let results = ids
            .into_iter()
            .map(|id| {
                let result = match resolved.get(&token_key(&id)) {
                    Some(Resolution::Found(row)) => {
                        match Token::from_row(row, &self.settings.tag_delimiter) {
                            Ok(token) if token.is_expired(now) => Err(ResourceError::Expired {
                                key: id.clone(),
                                expired_at: token.expires_at,
                            }),
                            Ok(token) => Ok(token),
                            Err(e) => {
                                warn!(token = %id, error = %e, "Malformed token row");
                                Err(ResourceError::NotFound { key: id.clone() })
                            }
                        }
                    }
                    Some(Resolution::Error(e)) => Err(ResourceError::Store {
                        key: id.clone(),
                        source: e.clone(),
                    }),
                    Some(Resolution::Missing) | None => {
                        Err(ResourceError::NotFound { key: id.clone() })
                    }
                };
                (id, result)
            })
            .collect();
        Ok(results)
    }

    /// Claim every token in `ids` or none of them.
    ///
    /// Claims older than `max_lock_age_secs` are treated as abandoned and
    /// taken over. On a partial claim the rows this call did lock are
    /// released again before reporting contention.
    pub async fn acquire<S: AsRef<str>>(&self, ids: &[S]) -> Result<LockClaim<Held>, ResourceError> {
        let ids = dedupe(ids);
        let secret = generate_secret();
        let acquired_at = Utc::now();
        if ids.is_empty() {
            return Ok(LockClaim::new(ClaimData::new(secret, ids, acquired_at)));
        }

        let now = acquired_at.timestamp();
        let max_age = i64::try_from(self.settings.max_lock_age_secs).unwrap_or(i64::MAX);
        let stale_before = now.saturating_sub(max_age);
        let keys: Vec<KeyTuple> = ids.iter().map(|id| token_key(id)).collect();
        let set = columns([
            (column::LOCK, Value::from(secret.clone())),
            (column::LOCKED_AT, Value::from(now)),
        ]);
        let unlocked = Filter::any()
            .with(Predicate::is_null(column::LOCK))
            .with(Predicate::lt(column::LOCKED_AT, stale_before));

        let claimed = self
            .store
            .update_where(&self.entity, &keys, &set, &unlocked)
            .await
            .map_err(|e| {
                error!(tokens = ?ids, operation = "acquire", error = %e, "Lock acquire failed");
                ResourceError::Store {
                    key: ids.join(","),
                    source: e,
                }
            })?;

        if claimed as usize != keys.len() {
            info!(
                tokens = ?ids,
                requested = keys.len(),
                acquired = claimed,
                "Lock contention"
            );
            if claimed > 0 {
                if let Err(e) = self.clear_locks(&keys, Some(&secret)).await {
                    warn!(tokens = ?ids, error = %e, "Rollback of partial claim failed");
                }
            }
            return Err(ResourceError::LockContention {
                requested: keys.len(),
                acquired: claimed as usize,
            });
        }

        self.pipeline.invalidate(&self.entity, &keys).await;
        let claim = LockClaim::new(ClaimData::new(secret, ids, acquired_at));
        debug!(claim = %claim.claim_id(), tokens = claim.token_ids().len(), "Lock acquired");
        Ok(claim)
    }

    /// Spend uses under a held claim.
    ///
    /// Every request is checked against the authoritative row: lock secret,
    /// remaining uses, scope, expiry. Requests failing a check are left out
    /// of the write. Used-up tokens are deleted in one batch; the counter
    /// updates of the rest are written in a second batch only if the delete
    /// succeeded.
    pub async fn consume(
        &self,
        claim: &LockClaim<Held>,
        requests: &[ConsumeRequest],
    ) -> TokenResults<ConsumeOutcome> {
        let mut results: Vec<Option<Result<ConsumeOutcome, ResourceError>>> =
            vec![None; requests.len()];

        let ids: Vec<String> = dedupe(
            &requests
                .iter()
                .filter(|r| claim.covers(&r.id))
                .map(|r| r.id.as_str())
                .collect::<Vec<_>>(),
        );
        let rows = if ids.is_empty() {
            Ok(Vec::new())
        } else {
            let keys: Vec<KeyTuple> = ids.iter().map(|id| token_key(id)).collect();
            self.store
                .select(&self.entity, Some(&keys), &Filter::all(), None)
                .await
        };
        let rows: HashMap<String, ColumnMap> = match rows {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|row| {
                    let id = row.get(column::ID)?.as_str()?.to_string();
                    Some((id, row))
                })
                .collect(),
            Err(e) => {
                error!(tokens = ?ids, operation = "consume", error = %e, "Token read failed");
                return requests
                    .iter()
                    .map(|r| {
                        let result = if claim.covers(&r.id) {
                            Err(ResourceError::Store {
                                key: r.id.clone(),
                                source: e.clone(),
                            })
                        } else {
                            Err(ResourceError::LockHeldByOther { key: r.id.clone() })
                        };
                        (r.id.clone(), result)
                    })
                    .collect();
            }
        };

        let now = now_epoch();
        let mut remaining: HashMap<&str, i64> = HashMap::new();
        let mut accepted = Vec::new();
        for (index, request) in requests.iter().enumerate() {
            match self.check(claim, request, rows.get(&request.id), &mut remaining, now) {
                Ok(left) => accepted.push(Accepted {
                    index,
                    id: request.id.clone(),
                    remaining: left,
                }),
                Err(e) => {
                    debug!(token = %request.id, code = e.code(), "Consume check failed");
                    results[index] = Some(Err(e));
                }
            }
        }

        self.apply(claim, &accepted, &remaining, &mut results).await;

        requests
            .iter()
            .zip(results)
            .map(|(request, result)| {
                let result = result.unwrap_or_else(|| {
                    Err(ResourceError::NotFound {
                        key: request.id.clone(),
                    })
                });
                (request.id.clone(), result)
            })
            .collect()
    }

    /// Validate one request against its row, updating the running counter.
    fn check<'a>(
        &self,
        claim: &LockClaim<Held>,
        request: &'a ConsumeRequest,
        row: Option<&ColumnMap>,
        remaining: &mut HashMap<&'a str, i64>,
        now: i64,
    ) -> Result<i64, ResourceError> {
        let key = request.id.clone();
        if request.uses < 1 {
            return Err(ResourceError::InvalidRequest {
                key,
                reason: format!("uses must be at least 1, got {}", request.uses),
            });
        }
        if !claim.covers(&request.id) {
            return Err(ResourceError::LockHeldByOther { key });
        }
        let Some(row) = row else {
            return Err(ResourceError::NotFound { key });
        };
        let token = Token::from_row(row, &self.settings.tag_delimiter).map_err(|e| {
            warn!(token = %request.id, error = %e, "Malformed token row");
            ResourceError::NotFound { key: key.clone() }
        })?;

        if !self.settings.bypass_locks {
            let lock = row.get(column::LOCK).and_then(Value::as_str);
            if lock != Some(claim.secret()) {
                return Err(ResourceError::LockHeldByOther { key });
            }
        }

        let left = *remaining.entry(request.id.as_str()).or_insert(token.uses);
        if left - request.uses < 0 {
            return Err(ResourceError::InsufficientResource {
                key,
                remaining: left,
                requested: request.uses,
            });
        }
        if !scope_allows(&token.action, &request.action) {
            return Err(ResourceError::ScopeMismatch {
                key,
                action: request.action.clone(),
            });
        }
        if token.is_expired(now) {
            return Err(ResourceError::Expired {
                key,
                expired_at: token.expires_at,
            });
        }

        let after = left - request.uses;
        remaining.insert(request.id.as_str(), after);
        Ok(after)
    }

    /// Write accepted requests: deletes first, then counter updates.
    async fn apply(
        &self,
        claim: &LockClaim<Held>,
        accepted: &[Accepted],
        remaining: &HashMap<&str, i64>,
        results: &mut [Option<Result<ConsumeOutcome, ResourceError>>],
    ) {
        if accepted.is_empty() {
            return;
        }
        let touched: Vec<String> =
            dedupe(&accepted.iter().map(|a| a.id.as_str()).collect::<Vec<_>>());
        let final_uses = |id: &str| remaining.get(id).copied().unwrap_or(0);
        let (spent, live): (Vec<&String>, Vec<&String>) =
            touched.iter().partition(|id| final_uses(id.as_str()) <= 0);

        let fail_all = |results: &mut [Option<Result<ConsumeOutcome, ResourceError>>],
                        ids: &[&String],
                        make: &dyn Fn(&str) -> ResourceError| {
            for a in accepted.iter().filter(|a| ids.contains(&&a.id)) {
                results[a.index] = Some(Err(make(&a.id)));
            }
        };

        let mut lost = 0;
        if !spent.is_empty() {
            let keys: Vec<KeyTuple> = spent.iter().map(|id| token_key(id)).collect();
            let deleted = match self
                .store
                .delete_where(&self.entity, Some(&keys), &self.held_by(claim))
                .await
            {
                Ok(deleted) => deleted,
                Err(e) => {
                    error!(tokens = ?spent, operation = "delete", error = %e, "Deleting used-up tokens failed");
                    let all: Vec<&String> = touched.iter().collect();
                    fail_all(&mut *results, &all, &|id| store_error(id, &e));
                    return;
                }
            };
            if deleted.len() != keys.len() {
                let deleted: HashSet<String> = deleted.iter().map(KeyTuple::encode).collect();
                let kept: Vec<&String> = spent
                    .iter()
                    .copied()
                    .filter(|id| !deleted.contains(&token_key(id).encode()))
                    .collect();
                error!(tokens = ?kept, "Delete of used-up tokens lost the lock");
                fail_all(&mut *results, &kept, &|id| ResourceError::LockHeldByOther {
                    key: id.to_string(),
                });
                lost = kept.len();
            }
        }

        let mut update_failed = false;
        if !live.is_empty() {
            let rows: Vec<(KeyTuple, ColumnMap)> = live
                .iter()
                .map(|id| {
                    (
                        token_key(id),
                        columns([(column::USES, Value::from(final_uses(id.as_str())))]),
                    )
                })
                .collect();
            match self.store.update_rows(&self.entity, &rows, &self.held_by(claim)).await {
                Ok(n) if n as usize == rows.len() => {}
                Ok(n) => {
                    error!(
                        tokens = ?live,
                        expected = rows.len(),
                        updated = n,
                        "Counter update lost the lock"
                    );
                    fail_all(&mut *results, &live, &|id| ResourceError::LockHeldByOther {
                        key: id.to_string(),
                    });
                    update_failed = true;
                }
                Err(e) => {
                    error!(tokens = ?live, operation = "update", error = %e, "Counter update failed");
                    fail_all(&mut *results, &live, &|id| store_error(id, &e));
                    update_failed = true;
                }
            }
        }

        for a in accepted {
            if results[a.index].is_none() {
                results[a.index] = Some(Ok(ConsumeOutcome {
                    remaining: a.remaining,
                    deleted: final_uses(a.id.as_str()) <= 0,
                }));
            }
        }

        let keys: Vec<KeyTuple> = touched.iter().map(|id| token_key(id)).collect();
        self.pipeline.invalidate(&self.entity, &keys).await;
        debug!(
            claim = %claim.claim_id(),
            deleted = spent.len() - lost,
            updated = if update_failed { 0 } else { live.len() },
            "Consumption applied"
        );
    }

    /// Clear the lock columns of every claimed token.
    pub async fn release(&self, claim: LockClaim<Held>) -> Result<LockClaim<Released>, ResourceError> {
        let keys: Vec<KeyTuple> = claim.token_ids().iter().map(|id| token_key(id)).collect();
        if !keys.is_empty() {
            let secret = if self.settings.bypass_locks {
                None
            } else {
                Some(claim.secret())
            };
            let cleared = self.clear_locks(&keys, secret).await.map_err(|e| {
                error!(claim = %claim.claim_id(), error = %e, "Lock release failed");
                ResourceError::Store {
                    key: claim.token_ids().join(","),
                    source: e,
                }
            })?;
            self.pipeline.invalidate(&self.entity, &keys).await;
            debug!(claim = %claim.claim_id(), cleared, "Lock released");
        }
        Ok(claim.into_released())
    }

    /// Acquire, consume, and always release.
    pub async fn use_tokens(&self, requests: &[ConsumeRequest]) -> TokenResults<ConsumeOutcome> {
        let ids: Vec<&str> = requests.iter().map(|r| r.id.as_str()).collect();
        let claim = match self.acquire(&ids).await {
            Ok(claim) => claim,
            Err(e) => {
                return requests
                    .iter()
                    .map(|r| (r.id.clone(), Err(e.clone())))
                    .collect()
            }
        };
        let results = self.consume(&claim, requests).await;
        if let Err(e) = self.release(claim).await {
            warn!(error = %e, "Claim left for stale-lock reclaim");
        }
        results
    }

    /// Delete tokens outright.
    pub async fn delete<S: AsRef<str>>(&self, ids: &[S]) -> StrataResult<DeleteReport> {
        let keys: Vec<KeyTuple> = dedupe(ids).iter().map(|id| token_key(id)).collect();
        self.pipeline.delete(&self.entity, &keys).await
    }

    /// Delete every expired token. Returns the removed ids.
    pub async fn sweep_expired(&self) -> StrataResult<Vec<String>> {
        let expired = Filter::all().with(Predicate::lte(column::EXPIRES, now_epoch()));
        let keys = self
            .store
            .delete_where(&self.entity, None, &expired)
            .await
            .map_err(|e| {
                error!(operation = "sweep", error = %e, "Expiry sweep failed");
                StrataError::from(e)
            })?;
        self.pipeline.invalidate(&self.entity, &keys).await;
        let ids: Vec<String> = keys
            .iter()
            .filter_map(|k| k.parts().first().and_then(Value::as_str).map(str::to_string))
            .collect();
        info!(removed = ids.len(), "Expired tokens swept");
        Ok(ids)
    }

    fn held_by(&self, claim: &LockClaim<Held>) -> Filter {
        if self.settings.bypass_locks {
            Filter::all()
        } else {
            Filter::all().with(Predicate::eq(column::LOCK, claim.secret()))
        }
    }

    async fn clear_locks(&self, keys: &[KeyTuple], secret: Option<&str>) -> Result<u64, StoreError> {
        let set = columns([(column::LOCK, Value::Null), (column::LOCKED_AT, Value::Null)]);
        let guard = match secret {
            Some(secret) => Filter::all().with(Predicate::eq(column::LOCK, secret)),
            None => Filter::all(),
        };
        self.store.update_where(&self.entity, keys, &set, &guard).await
    }
}

fn store_error(id: &str, source: &StoreError) -> ResourceError {
    ResourceError::Store {
        key: id.to_string(),
        source: source.clone(),
    }
}
