// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! resloader - cache-backed asynchronous resource loader
//!
//! Resolves a resource through a tiered pipeline:
//!
//! **Memory cache** -> **Disk cache** -> **Network**
//!
//! Each tier past memory runs as a cancellable [`task::Task`] on its own
//! bounded [`queue::TaskQueue`], so disk reads and network fetches are
//! throttled independently.
//!
//! # Core Modules
//!
//! - [`task`] - Task lifecycle, cancellation tokens and timeouts
//! - [`queue`] - Keyed, bounded task scheduler
//! - [`loader`] - The memory/disk/network pipeline and its hooks
//! - [`cache`] - Memory cache with recycle bin, file-backed disk cache
//! - [`net`] - HTTP network loader
//! - [`config`] - Loader configuration
//! - [`error`] - Error type shared by all modules

pub mod cache;
pub mod config;
pub mod error;
pub mod loader;
pub mod net;
pub mod queue;
pub mod sync;
pub mod task;

pub use cache::{CachedResource, DiskCache, FsDiskCache, MemoryCache, RecyclingCache};
pub use config::LoaderConfig;
pub use error::LoaderError;
pub use loader::{LoadListener, LoadRequest, LoaderStats, ResourceLoader, ResourceLoaderBuilder};
pub use net::HttpNetworkLoader;
pub use queue::{KeyConflictPolicy, QueueMode, QueueStats, TaskQueue};
pub use task::{CancelToken, Job, Outcome, Task, TaskHandle, TaskState};
