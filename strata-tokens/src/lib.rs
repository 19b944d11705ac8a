//! STRATA Tokens - consumable single/limited-use tokens
//!
//! Tokens are ordinary records of the `tokens` table. Exclusive access is a
//! lock claim written into the record itself by a conditional update, so it
//! holds across processes without shared memory. See [`TokenService`] for
//! the protocol.

pub mod lock;
pub mod model;
pub mod service;

pub use lock::{generate_secret, ClaimData, ClaimState, Held, LockClaim, Released};
pub use model::{
    column, token_entity, ConsumeOutcome, ConsumeRequest, Token, TokenSpec, TOKEN_ENTITY,
};
pub use service::{scope_allows, TokenResults, TokenService};
