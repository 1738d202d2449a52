// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cache collaborators used by the loader.
//!
//! The loader only talks to the [`MemoryCache`] and [`DiskCache`] traits.
//! [`RecyclingCache`] and [`FsDiskCache`] are the default implementations.

mod disk;
mod memory;

pub use disk::FsDiskCache;
pub use memory::{RecyclingCache, DEFAULT_MEMORY_BYTES, DEFAULT_RECYCLER_BYTES};

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::error::LoaderError;

/// A decoded resource that the memory cache can weigh and reclaim.
pub trait CachedResource: Send + Sync + 'static {
    /// Bytes this resource accounts for against the cache limit.
    fn byte_size(&self) -> usize;

    /// Release native backing storage. Called once, only for entries that
    /// were marked unused or are no longer referenced by the cache.
    fn reclaim(&self) {}
}

impl CachedResource for Vec<u8> {
    fn byte_size(&self) -> usize {
        self.len()
    }
}

impl CachedResource for String {
    fn byte_size(&self) -> usize {
        self.len()
    }
}

/// In-memory store of decoded resources.
///
/// An entry is either in use, marked unused, or evicted while still in use
/// (recycled). Only unused entries are ever reclaimed.
pub trait MemoryCache<R>: Send + Sync {
    fn get(&self, key: &str) -> Option<Arc<R>>;

    fn put(&self, key: &str, resource: Arc<R>);

    /// Mark the entry as no longer referenced by its consumer. Idempotent.
    fn unused(&self, key: &str);

    fn remove_all(&self);

    /// Reclaim every entry currently marked unused.
    fn reduce(&self) {}

    fn report(&self) -> MemoryReport {
        MemoryReport::default()
    }
}

/// Occupancy of a memory cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryReport {
    pub entries: usize,
    pub bytes: usize,
    pub max_bytes: usize,
    pub unused: usize,
    pub recycled: usize,
    pub recycled_bytes: usize,
    pub recycler_max_bytes: usize,
    pub reclaimed: u64,
}

/// On-disk store of raw resource bytes.
pub trait DiskCache: Send + Sync {
    /// Path of value `index` for `key`, if it has been committed.
    fn get_file(&self, key: &str, index: usize) -> Option<PathBuf>;

    /// Start a write transaction. `Ok(None)` means another editor holds `key`.
    fn edit(&self, key: &str) -> Result<Option<Box<dyn CacheEditor>>, LoaderError>;

    /// Persist the index of committed entries.
    fn flush(&self) -> Result<(), LoaderError>;

    /// Flush and release the cache. Later calls fail or return nothing.
    fn close(&self) -> Result<(), LoaderError>;

    /// Delete every entry.
    fn wipe(&self) -> Result<(), LoaderError>;

    /// Bytes currently committed.
    fn size(&self) -> u64 {
        0
    }
}

/// Write transaction for one key. Dropping an editor without committing
/// aborts it.
pub trait CacheEditor: Send {
    /// Sink for value `index`. Repeated calls return the same sink.
    fn output(&mut self, index: usize) -> Result<&mut dyn Write, LoaderError>;

    /// Publish everything written so far.
    fn commit(self: Box<Self>) -> Result<(), LoaderError>;

    /// Discard everything written so far.
    fn abort(self: Box<Self>);
}
