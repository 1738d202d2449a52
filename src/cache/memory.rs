// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Byte-bounded LRU with unused marks and a recycle bin.

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use super::{CachedResource, MemoryCache, MemoryReport};
use crate::sync::resilient_lock;

/// Default memory budget (16 MiB).
pub const DEFAULT_MEMORY_BYTES: usize = 16 * 1024 * 1024;

/// Default recycle bin budget (8 MiB).
pub const DEFAULT_RECYCLER_BYTES: usize = 8 * 1024 * 1024;

struct Entry<R> {
    value: Arc<R>,
    size: usize,
    unused: bool,
}

struct Inner<R> {
    /// Least recently used first.
    entries: IndexMap<String, Entry<R>>,
    bytes: usize,
    max_bytes: usize,
    /// Evicted while still in use. Reclaimed once marked unused.
    recycler: IndexMap<String, Entry<R>>,
    recycled_bytes: usize,
    recycler_max_bytes: usize,
    reclaimed: u64,
}

impl<R: CachedResource> Inner<R> {
    fn free(&mut self, key: &str, entry: Entry<R>) {
        tracing::trace!(target: "resloader::cache", key, bytes = entry.size, "Reclaiming resource");
        entry.value.reclaim();
        self.reclaimed += 1;
    }

    fn take_recycled(&mut self, key: &str) -> Option<Entry<R>> {
        let entry = self.recycler.shift_remove(key)?;
        self.recycled_bytes -= entry.size;
        Some(entry)
    }

    fn take_entry(&mut self, key: &str) -> Option<Entry<R>> {
        let entry = self.entries.shift_remove(key)?;
        self.bytes -= entry.size;
        Some(entry)
    }

    fn insert(&mut self, key: &str, entry: Entry<R>) {
        self.bytes += entry.size;
        self.entries.insert(key.to_string(), entry);
        self.trim_to_size();
    }

    /// Evict eldest entries until the byte budget holds.
    fn trim_to_size(&mut self) {
        while self.bytes > self.max_bytes {
            let Some((key, entry)) = self.entries.shift_remove_index(0) else {
                break;
            };
            self.bytes -= entry.size;
            if entry.unused {
                self.free(&key, entry);
                continue;
            }

            self.recycled_bytes += entry.size;
            self.recycler.insert(key.clone(), entry);
            if self.recycled_bytes > self.recycler_max_bytes {
                tracing::warn!(
                    target: "resloader::cache",
                    key = %key,
                    recycled_bytes = self.recycled_bytes,
                    limit = self.recycler_max_bytes,
                    "Recycle bin over its limit; resources evicted while in use are not being released"
                );
            }
        }
    }
}

/// Default [`MemoryCache`].
///
/// Entries evicted by the LRU while still in use move to a recycle bin
/// instead of being reclaimed, so a consumer never holds a reclaimed
/// resource. `unused` on a recycled entry reclaims it; on a live entry it
/// only sets a mark that makes the entry reclaimable on eviction or
/// [`MemoryCache::reduce`].
pub struct RecyclingCache<R> {
    inner: Mutex<Inner<R>>,
}

impl<R: CachedResource> RecyclingCache<R> {
    pub fn new(max_bytes: usize, recycler_max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: IndexMap::new(),
                bytes: 0,
                max_bytes,
                recycler: IndexMap::new(),
                recycled_bytes: 0,
                recycler_max_bytes,
                reclaimed: 0,
            }),
        }
    }

    /// Whether `key` is cached and marked unused.
    pub fn is_unused(&self, key: &str) -> bool {
        let inner = resilient_lock(&self.inner);
        inner.entries.get(key).map_or(false, |entry| entry.unused)
    }

    /// Whether `key` sits in the recycle bin.
    pub fn is_recycled(&self, key: &str) -> bool {
        resilient_lock(&self.inner).recycler.contains_key(key)
    }
}

impl<R: CachedResource> Default for RecyclingCache<R> {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_BYTES, DEFAULT_RECYCLER_BYTES)
    }
}

impl<R: CachedResource> MemoryCache<R> for RecyclingCache<R> {
    fn get(&self, key: &str) -> Option<Arc<R>> {
        let mut inner = resilient_lock(&self.inner);
        if let Some(index) = inner.entries.get_index_of(key) {
            let last = inner.entries.len() - 1;
            inner.entries.move_index(index, last);
            let entry = &mut inner.entries[last];
            entry.unused = false;
            return Some(Arc::clone(&entry.value));
        }

        // Still referenced somewhere; bring it back.
        let mut entry = inner.take_recycled(key)?;
        entry.unused = false;
        let value = Arc::clone(&entry.value);
        inner.insert(key, entry);
        Some(value)
    }

    fn put(&self, key: &str, resource: Arc<R>) {
        let mut inner = resilient_lock(&self.inner);
        let size = resource.byte_size();

        for old in [inner.take_entry(key), inner.take_recycled(key)].into_iter().flatten() {
            if Arc::ptr_eq(&old.value, &resource) {
                continue;
            }
            if old.unused {
                inner.free(key, old);
            }
            // An in-use predecessor is left to its holders.
        }

        inner.insert(
            key,
            Entry {
                value: resource,
                size,
                unused: false,
            },
        );
    }

    fn unused(&self, key: &str) {
        let mut inner = resilient_lock(&self.inner);
        if let Some(entry) = inner.take_recycled(key) {
            inner.free(key, entry);
            return;
        }
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.unused = true;
        }
    }

    fn remove_all(&self) {
        let mut inner = resilient_lock(&self.inner);
        let entries: Vec<_> = inner.entries.drain(..).collect();
        for (key, entry) in entries {
            if entry.unused {
                inner.free(&key, entry);
            }
        }
        inner.recycler.clear();
        inner.bytes = 0;
        inner.recycled_bytes = 0;
    }

    fn reduce(&self) {
        let mut inner = resilient_lock(&self.inner);
        let unused: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.unused)
            .map(|(key, _)| key.clone())
            .collect();
        for key in unused {
            if let Some(entry) = inner.take_entry(&key) {
                inner.free(&key, entry);
            }
        }
    }

    fn report(&self) -> MemoryReport {
        let inner = resilient_lock(&self.inner);
        MemoryReport {
            entries: inner.entries.len(),
            bytes: inner.bytes,
            max_bytes: inner.max_bytes,
            unused: inner.entries.values().filter(|entry| entry.unused).count(),
            recycled: inner.recycler.len(),
            recycled_bytes: inner.recycled_bytes,
            recycler_max_bytes: inner.recycler_max_bytes,
            reclaimed: inner.reclaimed,
        }
    }
}
