//! Cache tier.
//!
//! The cache is a disposable accelerant in front of the store: anyone may
//! evict, only the write pipeline's repopulation and successful reads
//! populate it. Snapshots are JSON objects of a record's non-key columns
//! stored under `<namespace><encoded key>`.

pub mod memory;
pub mod snapshot;
pub mod traits;

pub use memory::MemoryCache;
pub use traits::{CacheBackend, CacheEntry, CacheStats};
