// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Filesystem disk cache.
//!
//! Layout inside the cache directory:
//!
//! - `.lock`: held exclusively by the open cache (fs2)
//! - `journal.json`: version, value count and committed entries, least
//!   recently used first. Written through a temp file and an atomic rename.
//! - `<key>.<index>`: committed values
//! - `<key>.<index>.tmp`: values being written by an editor

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::{CacheEditor, DiskCache};
use crate::error::LoaderError;
use crate::sync::resilient_lock;

/// Default timeout for acquiring the directory lock (5 seconds)
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

const JOURNAL_FILE: &str = "journal.json";
const LOCK_FILE: &str = ".lock";
const MAX_KEY_LEN: usize = 120;

#[derive(Debug, Serialize, Deserialize)]
struct Journal {
    version: u32,
    value_count: usize,
    /// Committed value sizes per key, least recently used first.
    entries: IndexMap<String, Vec<u64>>,
}

struct State {
    entries: IndexMap<String, Vec<u64>>,
    size: u64,
    editing: HashSet<String>,
    closed: bool,
    dirty: bool,
}

impl State {
    fn empty() -> Self {
        Self {
            entries: IndexMap::new(),
            size: 0,
            editing: HashSet::new(),
            closed: false,
            dirty: false,
        }
    }

    /// Drop least recently used entries until `size <= max_bytes`.
    /// Entries with an open editor and `keep` are skipped, so a single entry
    /// larger than the budget survives until the next trim.
    fn trim_to_size(&mut self, dir: &Path, max_bytes: u64, keep: Option<&str>) {
        let mut index = 0;
        while self.size > max_bytes && index < self.entries.len() {
            let Some((key, _)) = self.entries.get_index(index) else {
                break;
            };
            if self.editing.contains(key) || keep == Some(key.as_str()) {
                index += 1;
                continue;
            }
            if let Some((key, sizes)) = self.entries.shift_remove_index(index) {
                remove_values(dir, &key, sizes.len());
                self.size -= sizes.iter().sum::<u64>();
                self.dirty = true;
                tracing::debug!(target: "resloader::disk", key = %key, "Evicted disk cache entry");
            }
        }
    }
}

fn value_path(dir: &Path, key: &str, index: usize) -> PathBuf {
    dir.join(format!("{}.{}", key, index))
}

fn temp_path(dir: &Path, key: &str, index: usize) -> PathBuf {
    dir.join(format!("{}.{}.tmp", key, index))
}

fn remove_values(dir: &Path, key: &str, value_count: usize) {
    for index in 0..value_count {
        let path = value_path(dir, key, index);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(target: "resloader::disk", path = ?path, "Failed to delete cache file: {}", err);
            }
        }
    }
}

fn validate_key(key: &str) -> Result<(), LoaderError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(LoaderError::InvalidKey(key.to_string()))
    }
}

/// Acquire an exclusive lock on the cache directory's lock file.
fn acquire_lock(dir: &Path, timeout: Duration) -> Result<File, LoaderError> {
    let path = dir.join(LOCK_FILE);
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;

    let start = Instant::now();
    loop {
        match lock_file.try_lock_exclusive() {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    return Err(LoaderError::CacheLocked(dir.to_path_buf()));
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => return Err(LoaderError::Io(e)),
        }
    }
}

/// Whether `name` is the journal or a value file written by this cache.
fn is_cache_file(name: &str) -> bool {
    if name == JOURNAL_FILE || name == "journal.json.tmp" {
        return true;
    }
    let name = name.strip_suffix(".tmp").unwrap_or(name);
    match name.rsplit_once('.') {
        Some((key, index)) => {
            validate_key(key).is_ok() && !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Delete the journal and every value file in `dir`. Foreign files stay.
fn clear_cache_files(dir: &Path) -> Result<(), LoaderError> {
    for item in fs::read_dir(dir)? {
        let item = item?;
        let name = item.file_name();
        let is_ours = name.to_str().map_or(false, is_cache_file);
        if is_ours && item.path().is_file() {
            fs::remove_file(item.path())?;
        }
    }
    Ok(())
}

/// Byte-bounded LRU of files on disk.
pub struct FsDiskCache {
    dir: PathBuf,
    version: u32,
    value_count: usize,
    max_bytes: u64,
    state: Arc<Mutex<State>>,
    lock_file: Mutex<Option<File>>,
}

impl FsDiskCache {
    /// Open or create a cache in `dir`.
    ///
    /// A journal written with a different `version` or `value_count` is
    /// discarded together with every cached file.
    pub fn open(dir: impl AsRef<Path>, version: u32, value_count: usize, max_bytes: u64) -> Result<Self, LoaderError> {
        Self::open_with_timeout(dir, version, value_count, max_bytes, LOCK_TIMEOUT)
    }

    /// Same as [`FsDiskCache::open`] with a custom lock timeout.
    pub fn open_with_timeout(
        dir: impl AsRef<Path>,
        version: u32,
        value_count: usize,
        max_bytes: u64,
        lock_timeout: Duration,
    ) -> Result<Self, LoaderError> {
        if value_count == 0 {
            return Err(LoaderError::Config("disk cache value count must be at least 1".into()));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let lock_file = acquire_lock(&dir, lock_timeout)?;

        let mut state = match Self::read_journal(&dir) {
            Some(journal) if journal.version == version && journal.value_count == value_count => {
                let mut state = State::empty();
                for (key, sizes) in journal.entries {
                    let complete = sizes.len() == value_count
                        && (0..value_count).all(|i| value_path(&dir, &key, i).is_file());
                    if complete {
                        state.size += sizes.iter().sum::<u64>();
                        state.entries.insert(key, sizes);
                    } else {
                        remove_values(&dir, &key, value_count);
                        state.dirty = true;
                    }
                }
                Self::remove_temp_files(&dir);
                state
            }
            Some(journal) => {
                tracing::info!(
                    target: "resloader::disk",
                    dir = ?dir,
                    old_version = journal.version,
                    new_version = version,
                    "Disk cache format changed, wiping"
                );
                clear_cache_files(&dir)?;
                State::empty()
            }
            None => {
                clear_cache_files(&dir)?;
                State::empty()
            }
        };
        state.trim_to_size(&dir, max_bytes, None);

        let cache = Self {
            dir,
            version,
            value_count,
            max_bytes,
            state: Arc::new(Mutex::new(state)),
            lock_file: Mutex::new(Some(lock_file)),
        };
        cache.flush()?;
        Ok(cache)
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        resilient_lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_journal(dir: &Path) -> Option<Journal> {
        let content = fs::read_to_string(dir.join(JOURNAL_FILE)).ok()?;
        match serde_json::from_str(&content) {
            Ok(journal) => Some(journal),
            Err(err) => {
                tracing::warn!(target: "resloader::disk", dir = ?dir, "Corrupt disk cache journal: {}", err);
                None
            }
        }
    }

    /// Delete editor leftovers from a previous run. Foreign `.tmp` files stay.
    fn remove_temp_files(dir: &Path) {
        let Ok(items) = fs::read_dir(dir) else {
            return;
        };
        for item in items.flatten() {
            let name = item.file_name();
            let is_leftover = name
                .to_str()
                .map_or(false, |name| name.ends_with(".tmp") && is_cache_file(name));
            if is_leftover {
                let _ = fs::remove_file(item.path());
            }
        }
    }

    /// Write the journal via temp file + atomic rename.
    fn write_journal(&self, state: &State) -> Result<(), LoaderError> {
        let journal = Journal {
            version: self.version,
            value_count: self.value_count,
            entries: state.entries.clone(),
        };
        let content = serde_json::to_string_pretty(&journal)
            .map_err(|err| LoaderError::Io(io::Error::new(io::ErrorKind::InvalidData, err)))?;

        let path = self.dir.join(JOURNAL_FILE);
        let temp = path.with_extension("json.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&temp, &path)?;
        Ok(())
    }
}

impl DiskCache for FsDiskCache {
    fn get_file(&self, key: &str, index: usize) -> Option<PathBuf> {
        if index >= self.value_count || validate_key(key).is_err() {
            return None;
        }
        let mut state = resilient_lock(&self.state);
        if state.closed {
            return None;
        }
        let position = state.entries.get_index_of(key)?;
        let path = value_path(&self.dir, key, index);
        if !path.is_file() {
            // Deleted behind our back.
            if let Some((key, sizes)) = state.entries.shift_remove_index(position) {
                state.size -= sizes.iter().sum::<u64>();
                remove_values(&self.dir, &key, self.value_count);
                state.dirty = true;
            }
            return None;
        }
        let last = state.entries.len() - 1;
        state.entries.move_index(position, last);
        state.dirty = true;
        Some(path)
    }

    fn edit(&self, key: &str) -> Result<Option<Box<dyn CacheEditor>>, LoaderError> {
        validate_key(key)?;
        let mut state = resilient_lock(&self.state);
        if state.closed {
            return Err(LoaderError::CacheClosed);
        }
        if !state.editing.insert(key.to_string()) {
            return Ok(None);
        }
        Ok(Some(Box::new(FsEditor {
            key: key.to_string(),
            dir: self.dir.clone(),
            max_bytes: self.max_bytes,
            state: Arc::clone(&self.state),
            value_count: self.value_count,
            outputs: (0..self.value_count).map(|_| None).collect(),
            finished: false,
        })))
    }

    fn flush(&self) -> Result<(), LoaderError> {
        let mut state = resilient_lock(&self.state);
        if state.closed {
            return Err(LoaderError::CacheClosed);
        }
        if !state.dirty {
            return Ok(());
        }
        self.write_journal(&state)?;
        state.dirty = false;
        Ok(())
    }

    fn close(&self) -> Result<(), LoaderError> {
        let result = {
            let mut state = resilient_lock(&self.state);
            if state.closed {
                return Ok(());
            }
            let result = if state.dirty { self.write_journal(&state) } else { Ok(()) };
            state.closed = true;
            state.dirty = false;
            result
        };
        if let Some(lock_file) = resilient_lock(&self.lock_file).take() {
            let _ = lock_file.unlock();
        }
        tracing::debug!(target: "resloader::disk", dir = ?self.dir, "Disk cache closed");
        result
    }

    fn wipe(&self) -> Result<(), LoaderError> {
        let mut state = resilient_lock(&self.state);
        if state.closed {
            return Err(LoaderError::CacheClosed);
        }
        let keys: Vec<String> = state.entries.keys().cloned().collect();
        for key in &keys {
            remove_values(&self.dir, key, self.value_count);
        }
        state.entries.clear();
        state.size = 0;
        self.write_journal(&state)?;
        state.dirty = false;
        tracing::info!(target: "resloader::disk", dir = ?self.dir, removed = keys.len(), "Disk cache wiped");
        Ok(())
    }

    fn size(&self) -> u64 {
        resilient_lock(&self.state).size
    }
}

impl Drop for FsDiskCache {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(target: "resloader::disk", dir = ?self.dir, "Failed to close disk cache: {}", err);
        }
    }
}

/// Editor handed out by [`FsDiskCache::edit`].
struct FsEditor {
    key: String,
    dir: PathBuf,
    max_bytes: u64,
    state: Arc<Mutex<State>>,
    value_count: usize,
    outputs: Vec<Option<BufWriter<File>>>,
    finished: bool,
}

impl FsEditor {
    fn discard(&mut self) {
        self.outputs.clear();
        for index in 0..self.value_count {
            let _ = fs::remove_file(temp_path(&self.dir, &self.key, index));
        }
        resilient_lock(&self.state).editing.remove(&self.key);
        self.finished = true;
    }
}

impl CacheEditor for FsEditor {
    fn output(&mut self, index: usize) -> Result<&mut dyn Write, LoaderError> {
        if index >= self.outputs.len() {
            return Err(LoaderError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("value index {} out of range", index),
            )));
        }
        if self.outputs[index].is_none() {
            let file = File::create(temp_path(&self.dir, &self.key, index))?;
            self.outputs[index] = Some(BufWriter::new(file));
        }
        match self.outputs[index].as_mut() {
            Some(writer) => Ok(writer),
            None => Err(LoaderError::CacheClosed),
        }
    }

    fn commit(mut self: Box<Self>) -> Result<(), LoaderError> {
        let outputs = std::mem::take(&mut self.outputs);
        let value_count = self.value_count;

        let mut state = resilient_lock(&self.state);
        let previous = state.entries.get(&self.key).cloned();
        let result = (|| {
            if state.closed {
                return Err(LoaderError::CacheClosed);
            }
            if previous.is_none() {
                if let Some(missing) = outputs.iter().position(Option::is_none) {
                    return Err(LoaderError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("new entry did not write value {}", missing),
                    )));
                }
            }

            let mut sizes = previous.clone().unwrap_or_else(|| vec![0; value_count]);
            for (index, output) in outputs.into_iter().enumerate() {
                let Some(writer) = output else {
                    continue;
                };
                let file = writer.into_inner().map_err(|err| LoaderError::Io(err.into_error()))?;
                file.sync_all()?;
                drop(file);
                let target = value_path(&self.dir, &self.key, index);
                fs::rename(temp_path(&self.dir, &self.key, index), &target)?;
                sizes[index] = fs::metadata(&target)?.len();
            }
            Ok(sizes)
        })();

        match result {
            Ok(sizes) => {
                let old_size: u64 = previous.map(|s| s.iter().sum()).unwrap_or(0);
                state.size = state.size - old_size + sizes.iter().sum::<u64>();
                state.entries.shift_remove(&self.key);
                state.entries.insert(self.key.clone(), sizes);
                state.editing.remove(&self.key);
                state.dirty = true;
                state.trim_to_size(&self.dir, self.max_bytes, Some(&self.key));
                drop(state);
                self.finished = true;
                Ok(())
            }
            Err(err) => {
                drop(state);
                self.discard();
                Err(err)
            }
        }
    }

    fn abort(mut self: Box<Self>) {
        self.discard();
    }
}

impl Drop for FsEditor {
    fn drop(&mut self) {
        if !self.finished {
            self.discard();
        }
    }
}
