// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tiered resource loader: memory cache, then disk cache, then network.
//!
//! `load` answers from the memory cache synchronously when it can. Otherwise
//! a disk-stage task is queued; on a disk miss it hands over to a
//! network-stage task that streams the bytes into a disk cache transaction,
//! commits, decodes and stores the result in memory. Every `load` ends in
//! exactly one listener callback.

mod hooks;
mod stages;

pub use hooks::{
    BytesDecoder, Decoder, ExceptionHandler, KeyDeriver, LoadListener, LoadLogger, LoadRequest,
    NetworkLoader, Sha256KeyDeriver, TracingExceptionHandler, TracingLogger,
};
pub use stages::{DiskStage, NetStage, StageResult};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;

use crate::cache::{CachedResource, DiskCache, FsDiskCache, MemoryCache, MemoryReport, RecyclingCache};
use crate::config::LoaderConfig;
use crate::error::LoaderError;
use crate::queue::{KeyConflictPolicy, QueueMode, QueueStats, TaskQueue};
use crate::sync::resilient_write;
use crate::task::{Job, TaskHandle};
use stages::Shared;

/// Values per disk cache entry.
const DISK_VALUE_COUNT: usize = 1;

/// Snapshot of a loader's queues and caches.
#[derive(Debug, Clone, Serialize)]
pub struct LoaderStats {
    pub disk_queue: QueueStats,
    pub net_queue: QueueStats,
    pub memory: MemoryReport,
    /// Committed disk cache bytes, `None` when running without a disk cache.
    pub disk_bytes: Option<u64>,
}

/// Builder for [`ResourceLoader`].
pub struct ResourceLoaderBuilder<R: CachedResource> {
    config: LoaderConfig,
    decoder: Option<Arc<dyn Decoder<R>>>,
    network: Option<Arc<dyn NetworkLoader>>,
    key_deriver: Arc<dyn KeyDeriver>,
    exceptions: Arc<dyn ExceptionHandler>,
    memory: Option<Arc<dyn MemoryCache<R>>>,
    disk: Option<Arc<dyn DiskCache>>,
    logger: Option<Arc<dyn LoadLogger>>,
}

impl<R: CachedResource> ResourceLoaderBuilder<R> {
    pub fn decoder(mut self, decoder: Arc<dyn Decoder<R>>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn network(mut self, network: Arc<dyn NetworkLoader>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn key_deriver(mut self, key_deriver: Arc<dyn KeyDeriver>) -> Self {
        self.key_deriver = key_deriver;
        self
    }

    pub fn exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exceptions = handler;
        self
    }

    /// Use this memory cache instead of a [`RecyclingCache`] sized from the config.
    pub fn memory_cache(mut self, memory: Arc<dyn MemoryCache<R>>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Use this disk cache instead of opening an [`FsDiskCache`].
    /// Ignored when the config disables the disk cache.
    pub fn disk_cache(mut self, disk: Arc<dyn DiskCache>) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn LoadLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Open the caches and start both stage queues.
    ///
    /// Must run inside a tokio runtime. A missing decoder or network loader
    /// is an error; a disk cache that fails to open is reported to the
    /// exception handler and the loader continues without one.
    pub fn build(self) -> Result<ResourceLoader<R>, LoaderError> {
        let config = self.config;
        config.validate()?;
        let decoder = self.decoder.ok_or(LoaderError::MissingCollaborator("decoder"))?;
        let network = self.network.ok_or(LoaderError::MissingCollaborator("network loader"))?;
        let exceptions = self.exceptions;

        let memory: Arc<dyn MemoryCache<R>> = match self.memory {
            Some(memory) => memory,
            None => Arc::new(RecyclingCache::new(config.memory_cache_bytes, config.recycler_bytes)),
        };

        let disk: Option<Arc<dyn DiskCache>> = if !config.disk_cache_enabled {
            None
        } else if let Some(disk) = self.disk {
            Some(disk)
        } else {
            let dir = config.resolved_cache_dir();
            match FsDiskCache::open(&dir, config.app_version, DISK_VALUE_COUNT, config.disk_cache_bytes) {
                Ok(cache) => Some(Arc::new(cache) as Arc<dyn DiskCache>),
                Err(err) => {
                    exceptions.on_disk_open_error(&anyhow::Error::new(err));
                    None
                }
            }
        };

        let policy = if config.duplicate_load {
            KeyConflictPolicy::Follow
        } else {
            KeyConflictPolicy::Reject
        };
        let disk_queue = stage_queue("disk", config.disk_concurrency, config.disk_capacity, policy)?;
        let net_queue = stage_queue("net", config.net_concurrency, config.net_capacity, policy)?;

        tracing::info!(
            target: "resloader::loader",
            disk_cache = disk.is_some(),
            disk_concurrency = config.disk_concurrency,
            net_concurrency = config.net_concurrency,
            ?policy,
            "Resource loader ready"
        );

        Ok(ResourceLoader {
            shared: Arc::new(Shared {
                memory,
                disk,
                decoder,
                network,
                exceptions,
                logger: RwLock::new(self.logger),
                net_queue,
                timeout: config.task_timeout_secs.map(Duration::from_secs),
                pending: Mutex::new(HashMap::new()),
                destroyed: AtomicBool::new(false),
            }),
            disk_queue,
            key_deriver: self.key_deriver,
        })
    }
}

fn stage_queue<J: Job>(
    name: &str,
    concurrency: usize,
    capacity: usize,
    policy: KeyConflictPolicy,
) -> Result<TaskQueue<J>, LoaderError> {
    let queue = TaskQueue::named(name, QueueMode::Reverse, concurrency)?;
    queue.set_capacity(capacity)?;
    queue.set_wait_canceling(true)?;
    queue.set_key_conflict_policy(policy)?;
    Ok(queue)
}

/// Resolves resources through memory, disk and network.
pub struct ResourceLoader<R: CachedResource> {
    shared: Arc<Shared<R>>,
    disk_queue: TaskQueue<DiskStage<R>>,
    key_deriver: Arc<dyn KeyDeriver>,
}

impl<R: CachedResource> ResourceLoader<R> {
    pub fn builder(config: LoaderConfig) -> ResourceLoaderBuilder<R> {
        ResourceLoaderBuilder {
            config,
            decoder: None,
            network: None,
            key_deriver: Arc::new(Sha256KeyDeriver),
            exceptions: Arc::new(TracingExceptionHandler),
            memory: None,
            disk: None,
            logger: None,
        }
    }

    /// Cache key for an identifier pair.
    pub fn key_for(&self, identifier: &str, aux_key: &str) -> String {
        self.key_deriver.derive(identifier, aux_key)
    }

    /// Load a resource. See [`ResourceLoader::load_request`].
    pub fn load(
        &self,
        identifier: &str,
        aux_key: &str,
        width: u32,
        height: u32,
        params: serde_json::Value,
        listener: Arc<dyn LoadListener<R>>,
    ) -> Result<Option<TaskHandle>, LoaderError> {
        let request = LoadRequest::new(identifier)
            .aux_key(aux_key)
            .size(width, height)
            .params(params);
        self.load_request(request, listener)
    }

    /// Load a resource.
    ///
    /// A memory hit calls `on_succeed` before returning and yields `None`.
    /// Otherwise the handle of the first queued stage is returned and the
    /// listener hears back from the stage queues.
    pub fn load_request(
        &self,
        request: LoadRequest,
        listener: Arc<dyn LoadListener<R>>,
    ) -> Result<Option<TaskHandle>, LoaderError> {
        if self.is_destroyed() {
            return Err(LoaderError::Destroyed);
        }
        let key = self.key_for(&request.identifier, &request.aux_key);

        if let Some(resource) = self.shared.memory.get(&key) {
            self.shared.log(&key, "memory cache hit");
            listener.on_succeed(&key, resource);
            return Ok(None);
        }

        self.shared.begin(&key);
        if self.shared.disk.is_none() {
            return self.shared.enqueue_net(key, request, listener).map(Some);
        }

        let task = self.shared.stage_task(DiskStage {
            key: key.clone(),
            request,
            listener,
            shared: Arc::clone(&self.shared),
        });
        self.disk_queue.put(key, task).map(Some)
    }

    /// Memory cache lookup only; never starts a load.
    pub fn get(&self, identifier: &str, aux_key: &str) -> Option<Arc<R>> {
        if self.is_destroyed() {
            return None;
        }
        self.shared.memory.get(&self.key_for(identifier, aux_key))
    }

    /// Cancel in-flight stages for the key and mark its memory entry unused.
    ///
    /// A load passing from the disk stage to the network stage is caught by
    /// the release mark rather than by either queue.
    pub fn unused(&self, identifier: &str, aux_key: &str) {
        let key = self.key_for(identifier, aux_key);
        self.shared.mark_released(&key);
        // Closed queues have nothing left to cancel.
        let _ = self.disk_queue.cancel(key.as_str());
        let _ = self.shared.net_queue.cancel(key.as_str());
        self.shared.memory.unused(&key);
    }

    /// Replace the diagnostics sink. `None` turns it off.
    pub fn set_logger(&self, logger: Option<Arc<dyn LoadLogger>>) {
        *resilient_write(&self.shared.logger) = logger;
    }

    /// Reclaim every memory entry marked unused.
    pub fn reduce_memory_cache(&self) {
        self.shared.memory.reduce();
    }

    /// Delete every disk cache entry.
    pub fn wipe_disk_cache(&self) -> Result<(), LoaderError> {
        match &self.shared.disk {
            Some(disk) => disk.wipe(),
            None => Ok(()),
        }
    }

    pub fn has_disk_cache(&self) -> bool {
        self.shared.disk.is_some()
    }

    pub async fn stats(&self) -> Result<LoaderStats, LoaderError> {
        Ok(LoaderStats {
            disk_queue: self.disk_queue.stats().await?,
            net_queue: self.shared.net_queue.stats().await?,
            memory: self.shared.memory.report(),
            disk_bytes: self.shared.disk.as_ref().map(|disk| disk.size()),
        })
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    /// Cancel every task, close the disk cache and clear the memory cache.
    ///
    /// Irreversible. Tasks already running still deliver their canceled
    /// callbacks afterwards.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disk_queue.shutdown();
        self.shared.net_queue.shutdown();
        if let Some(disk) = &self.shared.disk {
            if let Err(err) = disk.close() {
                tracing::warn!(target: "resloader::loader", "Failed to close disk cache: {}", err);
            }
        }
        self.shared.memory.remove_all();
        tracing::debug!(target: "resloader::loader", "Resource loader destroyed");
    }

    /// Wait until both stage queues have drained after `destroy`.
    pub async fn closed(&self) {
        self.disk_queue.closed().await;
        self.shared.net_queue.closed().await;
    }
}
