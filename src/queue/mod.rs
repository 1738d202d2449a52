// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bounded, keyed task scheduler.
//!
//! A [`TaskQueue`] is a cheap handle to a scheduler actor running on the tokio
//! runtime. Every mutation is a message; the actor owns the waiting and
//! running sets, so there is no shared lock around dispatch. Bursts of
//! messages are drained before the next dispatch pass, which keeps redundant
//! passes from piling up.
//!
//! ## Example
//!
//! ```no_run
//! # use resloader::queue::{QueueMode, TaskQueue};
//! # use resloader::task::{CancelToken, Job, Outcome, Task};
//! struct Fetch(String);
//!
//! impl Job for Fetch {
//!     type Output = usize;
//!     fn do_in_background(&self, token: &CancelToken) -> anyhow::Result<usize> {
//!         token.check()?;
//!         Ok(self.0.len())
//!     }
//!     fn on_post_execute(&self, outcome: Outcome<usize>) {
//!         println!("{} -> {:?}", self.0, outcome);
//!     }
//! }
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let queue = TaskQueue::new(QueueMode::Sequential, 2)?;
//! let handle = queue.put("a", Task::new(Fetch("a".into())))?;
//! handle.wait().await;
//! # Ok(())
//! # }
//! ```

mod dispatcher;

use std::sync::Arc;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch, Notify};

use crate::error::LoaderError;
use crate::task::{Job, Task, TaskHandle, TaskState};
use dispatcher::Dispatcher;

/// Order in which waiting tasks are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// First in, first out. Overflow evicts the newest waiting task.
    #[default]
    Sequential,
    /// Last in, first out. Overflow evicts the oldest waiting task.
    Reverse,
}

/// What `put` does when the key is already waiting or running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyConflictPolicy {
    /// Cancel the existing task and admit the new one (last writer wins).
    #[default]
    Displace,
    /// Attach the new task to the existing one; it receives the same outcome.
    Follow,
    /// Cancel the new task.
    Reject,
}

/// Snapshot of a queue's sets and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub waiting: usize,
    /// Running tasks that have not been canceled.
    pub running: usize,
    /// Canceled tasks whose bodies have not returned yet.
    pub canceling: usize,
    pub followers: usize,
    pub concurrency: usize,
    pub capacity: usize,
    pub completed: u64,
    pub canceled: u64,
    pub evicted: u64,
    /// Highest number of concurrency slots ever held at once.
    pub peak_running: usize,
}

/// Messages understood by the scheduler actor.
pub(crate) enum Command<J: Job> {
    Put { key: String, task: Task<J> },
    Cancel { key: String },
    CancelAll,
    Preferred { key: String },
    SetCapacity(usize),
    SetConcurrency(usize),
    SetPolicy(KeyConflictPolicy),
    SetWaitCanceling(bool),
    Stats(oneshot::Sender<QueueStats>),
    Shutdown,
}

/// Handle to a keyed, concurrency-limited scheduler.
pub struct TaskQueue<J: Job> {
    tx: mpsc::UnboundedSender<Command<J>>,
    notify: Arc<Notify>,
    done: watch::Receiver<bool>,
}

impl<J: Job> Clone for TaskQueue<J> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            notify: Arc::clone(&self.notify),
            done: self.done.clone(),
        }
    }
}

impl<J: Job> TaskQueue<J> {
    /// Create a queue and spawn its scheduler on the current runtime.
    ///
    /// Waiting capacity starts unbounded; see [`TaskQueue::set_capacity`].
    pub fn new(mode: QueueMode, concurrency: usize) -> Result<Self, LoaderError> {
        Self::named("queue", mode, concurrency)
    }

    /// Same as [`TaskQueue::new`], with a name used in logs and stats.
    pub fn named(name: &str, mode: QueueMode, concurrency: usize) -> Result<Self, LoaderError> {
        if concurrency == 0 {
            return Err(LoaderError::Config("queue concurrency must be at least 1".into()));
        }
        let runtime = Handle::try_current().map_err(|_| LoaderError::NoRuntime)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        let notify = Arc::new(Notify::new());

        let dispatcher = Dispatcher::new(name, mode, concurrency, Arc::clone(&notify));
        runtime.spawn(dispatcher.run(rx, done_tx));

        tracing::debug!(target: "resloader::queue", queue = name, ?mode, concurrency, "Task queue started");

        Ok(Self {
            tx,
            notify,
            done: done_rx,
        })
    }

    /// Admit `task` under `key`.
    ///
    /// The task must still be waiting. If the queue has shut down the task
    /// is canceled on the spot (its post-execute still runs) and
    /// `QueueClosed` is returned.
    pub fn put(&self, key: impl Into<String>, task: Task<J>) -> Result<TaskHandle, LoaderError> {
        let state = task.state();
        if state != TaskState::Waiting {
            return Err(LoaderError::IllegalState {
                from: state,
                to: TaskState::Waiting,
            });
        }

        task.attach(Arc::downgrade(&self.notify));
        let handle = task.handle();
        let key = key.into();
        if let Err(mpsc::error::SendError(command)) = self.tx.send(Command::Put { key, task }) {
            if let Command::Put { task, .. } = command {
                task.finish_canceled(Vec::new());
            }
            return Err(LoaderError::QueueClosed);
        }
        Ok(handle)
    }

    /// Cancel whichever waiting or running task holds `key`.
    pub fn cancel(&self, key: impl Into<String>) -> Result<(), LoaderError> {
        self.send(Command::Cancel { key: key.into() })
    }

    /// Cancel every waiting and running task.
    pub fn cancel_all(&self) -> Result<(), LoaderError> {
        self.send(Command::CancelAll)
    }

    /// Make the waiting task under `key` the next one to start.
    pub fn preferred(&self, key: impl Into<String>) -> Result<(), LoaderError> {
        self.send(Command::Preferred { key: key.into() })
    }

    /// Bound the waiting set. Shrinking evicts until the bound holds.
    pub fn set_capacity(&self, capacity: usize) -> Result<(), LoaderError> {
        self.send(Command::SetCapacity(capacity))
    }

    pub fn set_concurrency(&self, concurrency: usize) -> Result<(), LoaderError> {
        if concurrency == 0 {
            return Err(LoaderError::Config("queue concurrency must be at least 1".into()));
        }
        self.send(Command::SetConcurrency(concurrency))
    }

    pub fn set_key_conflict_policy(&self, policy: KeyConflictPolicy) -> Result<(), LoaderError> {
        self.send(Command::SetPolicy(policy))
    }

    /// When enabled, a canceled running task keeps its slot until its body
    /// returns. Disabled by default.
    pub fn set_wait_canceling(&self, wait: bool) -> Result<(), LoaderError> {
        self.send(Command::SetWaitCanceling(wait))
    }

    pub async fn stats(&self) -> Result<QueueStats, LoaderError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Stats(reply_tx))?;
        reply_rx.await.map_err(|_| LoaderError::QueueClosed)
    }

    /// Cancel everything and stop accepting work.
    ///
    /// Non-cancelable running tasks finish normally. The scheduler exits
    /// once every in-flight body has returned; await [`TaskQueue::closed`]
    /// to observe that.
    pub fn shutdown(&self) {
        // A scheduler that is already gone has nothing left to cancel.
        let _ = self.tx.send(Command::Shutdown);
    }

    /// Wait until the scheduler has exited.
    pub async fn closed(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|exited| *exited).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || *self.done.borrow()
    }

    fn send(&self, command: Command<J>) -> Result<(), LoaderError> {
        self.tx.send(command).map_err(|_| LoaderError::QueueClosed)
    }
}
