//! Response caching for offline reads.
//!
//! This module provides two independently versioned caches:
//! - a shell cache for the bootstrap assets of the application
//! - an API cache for allow-listed read endpoints
//!
//! Both are filled network-first and only consulted when the network is
//! unreachable.

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheNames, CacheNamespace, CacheResult, CacheSource, CachedResponse};
