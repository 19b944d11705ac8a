//! Lock claim typestate.
//!
//! A claim is the proof of a successful acquire: the random secret written
//! into the lock column of every claimed token. Consuming needs a
//! `LockClaim<Held>`; releasing consumes it and hands back a
//! `LockClaim<Released>` that can no longer be used for anything but
//! inspection.
//!
//! ```text
//! (unlocked) ─── acquire() ──→ Held ─── release() ──→ Released
//!                               │
//!                          consume() ↺
//! ```

use rand::RngCore;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;
use strata_core::Timestamp;
use uuid::Uuid;

/// Bytes of entropy in a claim secret.
const SECRET_BYTES: usize = 32;

/// Fresh random claim secret, hex encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ============================================================================
// CLAIM DATA
// ============================================================================

/// State-independent claim contents.
#[derive(Clone, PartialEq, Eq)]
pub struct ClaimData {
    pub claim_id: Uuid,
    secret: String,
    /// Claimed token ids, deduplicated, in request order.
    pub token_ids: Vec<String>,
    pub acquired_at: Timestamp,
}

impl ClaimData {
    pub fn new(secret: String, token_ids: Vec<String>, acquired_at: Timestamp) -> Self {
        Self {
            claim_id: Uuid::now_v7(),
            secret,
            token_ids,
            acquired_at,
        }
    }
}

impl fmt::Debug for ClaimData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimData")
            .field("claim_id", &self.claim_id)
            .field("secret", &"<redacted>")
            .field("token_ids", &self.token_ids)
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

// ============================================================================
// TYPESTATE MARKERS
// ============================================================================

/// Marker trait for claim states.
pub trait ClaimState: private::Sealed + Send + Sync {}

/// The secret is in the store; consume may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Held;
impl ClaimState for Held {}

/// The lock columns have been cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released;
impl ClaimState for Released {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Held {}
    impl Sealed for super::Released {}
}

// ============================================================================
// CLAIM WRAPPER
// ============================================================================

/// A lock claim with compile-time state tracking.
#[derive(Debug, Clone)]
pub struct LockClaim<S: ClaimState> {
    data: ClaimData,
    _state: PhantomData<S>,
}

impl<S: ClaimState> LockClaim<S> {
    pub fn data(&self) -> &ClaimData {
        &self.data
    }

    pub fn claim_id(&self) -> Uuid {
        self.data.claim_id
    }

    pub fn token_ids(&self) -> &[String] {
        &self.data.token_ids
    }

    pub fn acquired_at(&self) -> Timestamp {
        self.data.acquired_at
    }

    pub fn covers(&self, token_id: &str) -> bool {
        self.data.token_ids.iter().any(|id| id == token_id)
    }
}

impl LockClaim<Held> {
    /// Only the service creates held claims, after the conditional update
    /// claimed every requested row.
    pub(crate) fn new(data: ClaimData) -> Self {
        LockClaim {
            data,
            _state: PhantomData,
        }
    }

    pub(crate) fn secret(&self) -> &str {
        &self.data.secret
    }

    /// Whether acquire elsewhere would already treat this claim as abandoned.
    pub fn is_stale(&self, now: Timestamp, max_age: Duration) -> bool {
        (now - self.data.acquired_at)
            .to_std()
            .map(|age| age >= max_age)
            .unwrap_or(false)
    }

    pub(crate) fn into_released(self) -> LockClaim<Released> {
        LockClaim {
            data: self.data,
            _state: PhantomData,
        }
    }
}
