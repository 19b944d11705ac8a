//! Predicate language shared by the cache tier and the store tier.
//!
//! Named filters compile to a closed set of [`Predicate`] variants rather than
//! executable callbacks. The same [`Filter`] is evaluated against cached
//! snapshots and handed to the store, which evaluates or translates it.
//!
//! Evaluation is three-valued: a tier that cannot decide a predicate reports
//! [`Evaluation::Unsupported`]. The resolver treats that as a cache miss so the
//! store gets the final word.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::ValidationError;
use crate::key::canonical_part;
use crate::ColumnMap;

/// Comparison operator for column predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// A single column condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Numeric or string comparison against a constant.
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    /// Column value is one of `values`.
    In { column: String, values: Vec<Value> },
    /// Inclusive range.
    Between {
        column: String,
        low: Value,
        high: Value,
    },
    /// Regex must match the column's string form.
    Matches { column: String, pattern: String },
    /// Regex must not match the column's string form.
    NotMatches { column: String, pattern: String },
    /// Column is absent or null.
    IsNull { column: String },
    /// Column value is among `select` of the rows of `table` matching `filter`.
    InSubquery {
        column: String,
        table: String,
        select: String,
        filter: Filter,
    },
    /// Store-native expression passed through untouched.
    Raw {
        expression: String,
        #[serde(default)]
        params: Vec<Value>,
    },
}

/// How the conditions of a [`Filter`] combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    /// Every condition must pass.
    #[default]
    All,
    /// At least one condition must pass.
    Any,
}

/// A predicate or a nested group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Predicate(Predicate),
    Group(Filter),
}

/// A combination of conditions. The empty `All` filter accepts everything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub mode: Combinator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Outcome of evaluating a predicate or filter against one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Pass,
    Fail,
    /// The evaluating tier cannot decide this condition.
    Unsupported,
}

impl Evaluation {
    fn from_bool(b: bool) -> Self {
        if b {
            Evaluation::Pass
        } else {
            Evaluation::Fail
        }
    }
}

/// Resolves subquery membership for the store tier.
pub trait SubqueryLookup {
    /// Values of `select` across the rows of `table` matching `filter`.
    /// `None` when the lookup itself cannot be served.
    fn lookup(&self, table: &str, select: &str, filter: &Filter) -> Option<Vec<Value>>;
}

/// Which tier is evaluating.
#[derive(Clone, Copy)]
pub enum Tier<'a> {
    /// Cached snapshot: absent columns and subqueries are undecidable.
    Cache,
    /// Authoritative row: absent columns read as null.
    Store(&'a dyn SubqueryLookup),
}

impl Predicate {
    pub fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Ne, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Lt, value)
    }

    pub fn lte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Lte, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Gt, value)
    }

    pub fn gte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Gte, value)
    }

    pub fn one_of(column: impl Into<String>, values: Vec<Value>) -> Self {
        Predicate::In {
            column: column.into(),
            values,
        }
    }

    pub fn between(
        column: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        Predicate::Between {
            column: column.into(),
            low: low.into(),
            high: high.into(),
        }
    }

    pub fn matches(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Predicate::Matches {
            column: column.into(),
            pattern: pattern.into(),
        }
    }

    pub fn not_matches(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Predicate::NotMatches {
            column: column.into(),
            pattern: pattern.into(),
        }
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Predicate::IsNull {
            column: column.into(),
        }
    }

    pub fn in_subquery(
        column: impl Into<String>,
        table: impl Into<String>,
        select: impl Into<String>,
        filter: Filter,
    ) -> Self {
        Predicate::InSubquery {
            column: column.into(),
            table: table.into(),
            select: select.into(),
            filter,
        }
    }

    pub fn raw(expression: impl Into<String>, params: Vec<Value>) -> Self {
        Predicate::Raw {
            expression: expression.into(),
            params,
        }
    }

    /// Check patterns compile. Called once per request, not per row.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Predicate::Matches { pattern, .. } | Predicate::NotMatches { pattern, .. } => {
                Regex::new(pattern)
                    .map(|_| ())
                    .map_err(|e| ValidationError::InvalidPattern {
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    })
            }
            Predicate::InSubquery { filter, .. } => filter.validate(),
            _ => Ok(()),
        }
    }

    pub fn evaluate(&self, row: &ColumnMap, tier: Tier<'_>) -> Evaluation {
        match self {
            Predicate::Raw { .. } => Evaluation::Unsupported,
            Predicate::InSubquery {
                column,
                table,
                select,
                filter,
            } => {
                let Tier::Store(lookup) = tier else {
                    return Evaluation::Unsupported;
                };
                let Some(candidates) = lookup.lookup(table, select, filter) else {
                    return Evaluation::Unsupported;
                };
                match read_column(row, column, tier) {
                    None => Evaluation::Unsupported,
                    Some(Value::Null) => Evaluation::Fail,
                    Some(v) => Evaluation::from_bool(candidates.iter().any(|c| values_equal(v, c))),
                }
            }
            Predicate::IsNull { column } => match read_column(row, column, tier) {
                None => Evaluation::Unsupported,
                Some(v) => Evaluation::from_bool(v.is_null()),
            },
            Predicate::Compare { column, op, value } => {
                with_value(row, column, tier, |v| compare(v, *op, value))
            }
            Predicate::In { column, values } => with_value(row, column, tier, |v| {
                Evaluation::from_bool(values.iter().any(|c| values_equal(v, c)))
            }),
            Predicate::Between { column, low, high } => with_value(row, column, tier, |v| {
                match (compare_values(v, low), compare_values(v, high)) {
                    (Some(lo), Some(hi)) => {
                        Evaluation::from_bool(lo != Ordering::Less && hi != Ordering::Greater)
                    }
                    _ => Evaluation::Fail,
                }
            }),
            Predicate::Matches { column, pattern } => with_value(row, column, tier, |v| {
                regex_match(pattern, v).map_or(Evaluation::Unsupported, Evaluation::from_bool)
            }),
            Predicate::NotMatches { column, pattern } => with_value(row, column, tier, |v| {
                regex_match(pattern, v).map_or(Evaluation::Unsupported, |m| Evaluation::from_bool(!m))
            }),
        }
    }
}

impl Filter {
    /// Empty `All` filter (accepts every row).
    pub fn all() -> Self {
        Self::default()
    }

    /// Empty `Any` filter. Rejects every row until a condition is added.
    pub fn any() -> Self {
        Self {
            mode: Combinator::Any,
            conditions: Vec::new(),
        }
    }

    /// Add a predicate.
    pub fn with(mut self, predicate: Predicate) -> Self {
        self.conditions.push(Condition::Predicate(predicate));
        self
    }

    /// Add a nested group.
    pub fn group(mut self, filter: Filter) -> Self {
        self.conditions.push(Condition::Group(filter));
        self
    }

    /// Both filters must pass.
    pub fn and(self, other: Filter) -> Filter {
        if self.is_empty_all() {
            return other;
        }
        if other.is_empty_all() {
            return self;
        }
        Filter::all().group(self).group(other)
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    fn is_empty_all(&self) -> bool {
        self.mode == Combinator::All && self.conditions.is_empty()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for condition in &self.conditions {
            match condition {
                Condition::Predicate(p) => p.validate()?,
                Condition::Group(g) => g.validate()?,
            }
        }
        Ok(())
    }

    /// Evaluate against one row.
    ///
    /// `All`: any failure fails; otherwise any undecidable condition makes
    /// the whole filter undecidable. `Any`: one pass is enough; otherwise any
    /// undecidable condition makes it undecidable; otherwise it fails.
    pub fn evaluate(&self, row: &ColumnMap, tier: Tier<'_>) -> Evaluation {
        let mut passed = 0usize;
        let mut failed = 0usize;
        let mut unsupported = 0usize;
        for condition in &self.conditions {
            let outcome = match condition {
                Condition::Predicate(p) => p.evaluate(row, tier),
                Condition::Group(g) => g.evaluate(row, tier),
            };
            match outcome {
                Evaluation::Pass => passed += 1,
                Evaluation::Fail => failed += 1,
                Evaluation::Unsupported => unsupported += 1,
            }
        }
        match self.mode {
            Combinator::All => {
                if failed > 0 {
                    Evaluation::Fail
                } else if unsupported > 0 {
                    Evaluation::Unsupported
                } else {
                    Evaluation::Pass
                }
            }
            Combinator::Any => {
                if passed >= 1 {
                    Evaluation::Pass
                } else if unsupported > 0 {
                    Evaluation::Unsupported
                } else {
                    Evaluation::Fail
                }
            }
        }
    }
}

static NULL: Value = Value::Null;

/// `None` means the tier cannot see the column.
fn read_column<'r>(row: &'r ColumnMap, column: &str, tier: Tier<'_>) -> Option<&'r Value> {
    match (row.get(column), tier) {
        (Some(v), _) => Some(v),
        (None, Tier::Cache) => None,
        (None, Tier::Store(_)) => Some(&NULL),
    }
}

fn with_value(
    row: &ColumnMap,
    column: &str,
    tier: Tier<'_>,
    check: impl FnOnce(&Value) -> Evaluation,
) -> Evaluation {
    match read_column(row, column, tier) {
        None => Evaluation::Unsupported,
        Some(Value::Null) => Evaluation::Fail,
        Some(v) => check(v),
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> Evaluation {
    let result = match op {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::Ne => !values_equal(left, right),
        CompareOp::Lt => compare_values(left, right) == Some(Ordering::Less),
        CompareOp::Lte => matches!(
            compare_values(left, right),
            Some(Ordering::Less | Ordering::Equal)
        ),
        CompareOp::Gt => compare_values(left, right) == Some(Ordering::Greater),
        CompareOp::Gte => matches!(
            compare_values(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        ),
    };
    Evaluation::from_bool(result)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Order two values: numerically when either side is a number and the other
/// parses as one, lexically for two strings.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            as_number(left)?.partial_cmp(&as_number(right)?)
        }
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Equality that tolerates `1` vs `"1"` the way a relational store would.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    if left.is_null() || right.is_null() {
        return false;
    }
    compare_values(left, right) == Some(Ordering::Equal)
        || canonical_part(left) == canonical_part(right)
}

/// Bounded cache of compiled patterns.
static PATTERNS: Lazy<RwLock<HashMap<String, Regex>>> = Lazy::new(|| RwLock::new(HashMap::new()));

const MAX_CACHED_PATTERNS: usize = 256;

/// `None` if the pattern does not compile.
fn regex_match(pattern: &str, value: &Value) -> Option<bool> {
    let haystack = canonical_part(value);
    if let Ok(cached) = PATTERNS.read() {
        if let Some(re) = cached.get(pattern) {
            return Some(re.is_match(&haystack));
        }
    }
    let re = Regex::new(pattern).ok()?;
    let matched = re.is_match(&haystack);
    if let Ok(mut cached) = PATTERNS.write() {
        if cached.len() >= MAX_CACHED_PATTERNS {
            cached.clear();
        }
        cached.insert(pattern.to_string(), re);
    }
    Some(matched)
}
