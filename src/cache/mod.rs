//! Named response caches for offline support.
//!
//! This module provides the worker's cache store:
//! - Versioned static and dynamic caches named `{prefix}-{kind}-v{version}`
//! - Lookup by request identity (GET + URL) across every cache
//! - Pruning of caches left behind by older versions
//! - In-memory and SQLite storage backends

mod storage;
mod store;
mod traits;

pub use storage::{MemoryStorage, SqliteStorage};
pub use store::{CacheNames, CacheStore};
pub use traits::{CacheSource, CacheStorage, CachedResponse, Served};
