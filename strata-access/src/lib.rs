//! STRATA Access - allow/deny address lists
//!
//! Rules are either exact (one full address) or ranges (a fixed prefix plus
//! an inclusive interval on the next component). The most specific level
//! with a live matching rule decides; see [`precedence`].

pub mod address;
pub mod list;
pub mod precedence;
pub mod rule;

pub use address::{Address, AddressFormat};
pub use list::{exact_entity, range_entity, AccessList, Decision, Query, EXACT_ENTITY, RANGE_ENTITY};
pub use rule::{Rule, RuleKind, RuleTarget};
