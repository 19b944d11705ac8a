//! STRATA Storage - two-tier record access
//!
//! The durable [`RecordStore`] is the single source of truth; the
//! [`CacheBackend`] is a TTL-bound accelerant in front of it. The
//! [`Resolver`] reads through the cache, the [`WritePipeline`] writes to the
//! store and evicts. In-memory implementations of both tiers are provided
//! for tests and embedding.

pub mod cache;
pub mod engine;
pub mod memory_store;
pub mod pipeline;
pub mod resolver;
pub mod store;

pub use cache::{CacheBackend, CacheEntry, CacheStats, MemoryCache};
pub use engine::Engine;
pub use memory_store::{MemoryStore, StoreOperation};
pub use pipeline::{DeleteReport, WritePipeline, WriteReport};
pub use resolver::{
    ResolveOptions, ResolveRequest, ResolveStats, Resolution, Resolved, Resolver,
    SnapshotLifetime,
};
pub use store::RecordStore;
