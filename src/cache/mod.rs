//! Persistent blob store and the caching strategies built on it.
//!
//! This module provides:
//! - `CacheStorage`: namespaced get/put/delete with namespace enumeration
//! - `SqliteStorage` / `MemoryStorage`: durable and process-local backends
//! - `CacheLayer`: network-first and cache-first strategies over one namespace

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, StoredEntry};
