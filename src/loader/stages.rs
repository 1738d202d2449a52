// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The two pipeline stages: disk lookup and network fetch.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context;

use super::hooks::{Decoder, ExceptionHandler, LoadListener, LoadLogger, LoadRequest, NetworkLoader};
use crate::cache::{CachedResource, DiskCache, MemoryCache};
use crate::queue::TaskQueue;
use crate::error::LoaderError;
use crate::sync::{resilient_lock, resilient_read};
use crate::task::{CancelToken, Job, Outcome, Task, TaskHandle};

/// Result of a stage body.
pub enum StageResult<R> {
    /// Decoded and stored in the memory cache.
    Loaded(Arc<R>),
    /// Not on disk; hand over to the network stage.
    Continue,
    /// Stopped at a cancellation check.
    Interrupted,
}

impl<R> Clone for StageResult<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Loaded(resource) => Self::Loaded(Arc::clone(resource)),
            Self::Continue => Self::Continue,
            Self::Interrupted => Self::Interrupted,
        }
    }
}

impl<R> std::fmt::Debug for StageResult<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loaded(_) => f.write_str("Loaded"),
            Self::Continue => f.write_str("Continue"),
            Self::Interrupted => f.write_str("Interrupted"),
        }
    }
}

/// Loads of one key between queueing and their callback.
#[derive(Default)]
pub(crate) struct Pending {
    loads: usize,
    /// Set by `unused`; stages still on their way must not deliver.
    released: bool,
}

/// Collaborators shared by every stage of one loader.
pub(crate) struct Shared<R: CachedResource> {
    pub(crate) memory: Arc<dyn MemoryCache<R>>,
    pub(crate) disk: Option<Arc<dyn DiskCache>>,
    pub(crate) decoder: Arc<dyn Decoder<R>>,
    pub(crate) network: Arc<dyn NetworkLoader>,
    pub(crate) exceptions: Arc<dyn ExceptionHandler>,
    pub(crate) logger: RwLock<Option<Arc<dyn LoadLogger>>>,
    pub(crate) net_queue: TaskQueue<NetStage<R>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) pending: Mutex<HashMap<String, Pending>>,
    pub(crate) destroyed: AtomicBool,
}

impl<R: CachedResource> Shared<R> {
    pub(crate) fn log(&self, key: &str, message: &str) {
        if let Some(logger) = resilient_read(&self.logger).as_ref() {
            logger.log(key, message);
        }
    }

    /// Record a load of `key` about to be queued. Clears an earlier release.
    pub(crate) fn begin(&self, key: &str) {
        let mut pending = resilient_lock(&self.pending);
        let entry = pending.entry(key.to_string()).or_default();
        entry.loads += 1;
        entry.released = false;
    }

    /// Mark every queued load of `key` as no longer wanted.
    pub(crate) fn mark_released(&self, key: &str) {
        if let Some(entry) = resilient_lock(&self.pending).get_mut(key) {
            entry.released = true;
        }
    }

    fn is_released(&self, key: &str) -> bool {
        resilient_lock(&self.pending).get(key).map_or(false, |entry| entry.released)
    }

    /// One load of `key` delivered its callback.
    fn end(&self, key: &str) {
        let mut pending = resilient_lock(&self.pending);
        if let Some(entry) = pending.get_mut(key) {
            entry.loads = entry.loads.saturating_sub(1);
            if entry.loads == 0 {
                pending.remove(key);
            }
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn succeed(&self, key: &str, listener: &dyn LoadListener<R>, resource: Arc<R>, message: &str) {
        self.log(key, message);
        self.end(key);
        listener.on_succeed(key, resource);
    }

    pub(crate) fn stage_task<J: Job>(&self, job: J) -> Task<J> {
        let task = Task::new(job);
        match self.timeout {
            Some(timeout) => task.timeout(timeout),
            None => task,
        }
    }

    /// Queue the network stage for `key`.
    pub(crate) fn enqueue_net(
        self: &Arc<Self>,
        key: String,
        request: LoadRequest,
        listener: Arc<dyn LoadListener<R>>,
    ) -> Result<TaskHandle, LoaderError> {
        let task = self.stage_task(NetStage {
            key: key.clone(),
            request,
            listener,
            shared: Arc::clone(self),
        });
        self.net_queue.put(key, task)
    }

    /// Report a canceled or failed stage and release the memory entry.
    fn release(&self, key: &str, listener: &dyn LoadListener<R>, failure: Option<anyhow::Error>) {
        match failure {
            Some(err) => {
                self.log(key, &format!("load failed: {:#}", err));
                self.exceptions.on_load_error(key, &err);
                listener.on_failed(key, &err);
            }
            None => {
                self.log(key, "load canceled");
                listener.on_canceled(key);
            }
        }
        self.memory.unused(key);
        self.end(key);
    }

    fn store(&self, key: &str, resource: R) -> Arc<R> {
        let resource = Arc::new(resource);
        self.memory.put(key, Arc::clone(&resource));
        resource
    }
}

// =============================================================================
// Disk stage
// =============================================================================

/// Looks the key up in the disk cache and decodes it.
pub struct DiskStage<R: CachedResource> {
    pub(crate) key: String,
    pub(crate) request: LoadRequest,
    pub(crate) listener: Arc<dyn LoadListener<R>>,
    pub(crate) shared: Arc<Shared<R>>,
}

impl<R: CachedResource> Job for DiskStage<R> {
    type Output = StageResult<R>;

    fn do_in_background(&self, token: &CancelToken) -> anyhow::Result<StageResult<R>> {
        let Some(disk) = self.shared.disk.as_ref() else {
            return Ok(StageResult::Continue);
        };
        let Some(path) = disk.get_file(&self.key, 0) else {
            self.shared.log(&self.key, "disk cache miss");
            return Ok(StageResult::Continue);
        };
        token.check()?;

        match self.shared.decoder.decode_file(&path, &self.request) {
            Ok(resource) => {
                if token.is_canceled() {
                    return Ok(StageResult::Interrupted);
                }
                Ok(StageResult::Loaded(self.shared.store(&self.key, resource)))
            }
            Err(err) => {
                self.shared.exceptions.on_corrupt_entry(&self.key, &err);
                Ok(StageResult::Continue)
            }
        }
    }

    fn on_post_execute(&self, outcome: Outcome<StageResult<R>>) {
        match outcome {
            Outcome::Completed(StageResult::Loaded(resource)) => {
                self.shared
                    .succeed(&self.key, self.listener.as_ref(), resource, "loaded from disk cache");
            }
            Outcome::Completed(StageResult::Continue) => {
                self.shared.log(&self.key, "handing over to network stage");
                if self.shared.is_released(&self.key) {
                    self.shared.release(&self.key, self.listener.as_ref(), None);
                    return;
                }
                let queued = self.shared.enqueue_net(
                    self.key.clone(),
                    self.request.clone(),
                    Arc::clone(&self.listener),
                );
                // A refused task already delivered its canceled callback.
                if let Err(err) = queued {
                    self.shared.log(&self.key, &format!("network stage refused: {}", err));
                }
            }
            Outcome::Completed(StageResult::Interrupted) | Outcome::Canceled(_) => {
                self.shared.release(&self.key, self.listener.as_ref(), None);
            }
            Outcome::Failed(err) => {
                self.shared.release(&self.key, self.listener.as_ref(), Some(err));
            }
        }
    }
}

// =============================================================================
// Network stage
// =============================================================================

/// Fetches the resource, commits it to the disk cache and decodes it.
pub struct NetStage<R: CachedResource> {
    pub(crate) key: String,
    pub(crate) request: LoadRequest,
    pub(crate) listener: Arc<dyn LoadListener<R>>,
    pub(crate) shared: Arc<Shared<R>>,
}

impl<R: CachedResource> NetStage<R> {
    /// Fetch into memory and decode the bytes. Used without a disk cache or
    /// when another editor holds the key.
    fn fetch_to_memory(&self, token: &CancelToken) -> anyhow::Result<StageResult<R>> {
        let mut buffer = Vec::new();
        self.shared
            .network
            .fetch(&self.request.identifier, &mut buffer, token)
            .with_context(|| format!("fetching {}", self.request.identifier))?;
        if token.is_canceled() {
            return Ok(StageResult::Interrupted);
        }
        let resource = self.shared.decoder.decode_bytes(&buffer, &self.request)?;
        Ok(StageResult::Loaded(self.shared.store(&self.key, resource)))
    }

    /// Report a disk write failure, unless the stage is being torn down and
    /// the failure is only the cache closing under it.
    fn disk_write_failed(&self, err: anyhow::Error, token: &CancelToken) -> anyhow::Result<StageResult<R>> {
        if token.is_canceled() || self.shared.is_destroyed() {
            self.shared
                .log(&self.key, &format!("disk write stopped by cancellation: {:#}", err));
            return Ok(StageResult::Interrupted);
        }
        self.shared.exceptions.on_disk_write_error(&self.key, &err);
        Err(err)
    }
}

impl<R: CachedResource> Job for NetStage<R> {
    type Output = StageResult<R>;

    fn do_in_background(&self, token: &CancelToken) -> anyhow::Result<StageResult<R>> {
        // Released while the handover from the disk stage was in transit.
        if self.shared.is_released(&self.key) {
            return Ok(StageResult::Interrupted);
        }
        let Some(disk) = self.shared.disk.as_ref() else {
            return self.fetch_to_memory(token);
        };
        let mut editor = match disk.edit(&self.key) {
            Ok(Some(editor)) => editor,
            Ok(None) => {
                self.shared.log(&self.key, "disk entry busy, fetching without caching");
                return self.fetch_to_memory(token);
            }
            Err(err) => return self.disk_write_failed(anyhow::Error::from(err), token),
        };

        let (fetched, write_error) = {
            let sink = match editor.output(0) {
                Ok(sink) => sink,
                Err(err) => {
                    editor.abort();
                    return self.disk_write_failed(anyhow::Error::from(err), token);
                }
            };
            let mut guard = SinkGuard::new(sink);
            let fetched = self.shared.network.fetch(&self.request.identifier, &mut guard, token);
            self.shared.log(&self.key, &format!("fetched {} bytes", guard.written));
            (fetched, guard.error.take())
        };

        if let Some(io_err) = write_error {
            editor.abort();
            let err = anyhow::Error::new(io_err).context("writing to disk cache");
            return self.disk_write_failed(err, token);
        }
        if let Err(err) = fetched {
            editor.abort();
            return Err(err.context(format!("fetching {}", self.request.identifier)));
        }
        if let Err(err) = editor.commit() {
            return self.disk_write_failed(anyhow::Error::from(err), token);
        }
        if let Err(err) = disk.flush() {
            if !token.is_canceled() && !self.shared.is_destroyed() {
                self.shared.exceptions.on_disk_write_error(&self.key, &anyhow::Error::from(err));
            }
        }

        // The committed bytes stay on disk for the next load.
        if token.is_canceled() {
            return Ok(StageResult::Interrupted);
        }

        match disk.get_file(&self.key, 0) {
            Some(path) => {
                let resource = self.shared.decoder.decode_file(&path, &self.request)?;
                Ok(StageResult::Loaded(self.shared.store(&self.key, resource)))
            }
            None => {
                // Trimmed by another commit before it could be read back.
                self.shared.log(&self.key, "committed entry evicted, fetching again");
                self.fetch_to_memory(token)
            }
        }
    }

    fn on_post_execute(&self, outcome: Outcome<StageResult<R>>) {
        match outcome {
            Outcome::Completed(StageResult::Loaded(resource)) => {
                self.shared
                    .succeed(&self.key, self.listener.as_ref(), resource, "loaded from network");
            }
            Outcome::Completed(_) | Outcome::Canceled(_) => {
                self.shared.release(&self.key, self.listener.as_ref(), None);
            }
            Outcome::Failed(err) => {
                self.shared.release(&self.key, self.listener.as_ref(), Some(err));
            }
        }
    }
}

/// Remembers the first I/O error of the wrapped sink so disk failures can
/// be told apart from network failures.
struct SinkGuard<'a> {
    inner: &'a mut dyn Write,
    error: Option<io::Error>,
    written: u64,
}

impl<'a> SinkGuard<'a> {
    fn new(inner: &'a mut dyn Write) -> Self {
        Self {
            inner,
            error: None,
            written: 0,
        }
    }

    fn record(&mut self, err: io::Error) -> io::Error {
        let copy = io::Error::new(err.kind(), err.to_string());
        if self.error.is_none() {
            self.error = Some(err);
        }
        copy
    }
}

impl Write for SinkGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.write(buf) {
            Ok(n) => {
                self.written += n as u64;
                Ok(n)
            }
            Err(err) => Err(self.record(err)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().map_err(|err| self.record(err))
    }
}
