// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cancellable units of background work.
//!
//! A [`Task`] wraps a [`Job`] with a state machine, a cancellation token, an
//! optional timeout and a back-reference to the queue that owns it. The queue
//! drives the lifecycle: `on_pre_execute` and `on_post_execute` run on the
//! queue's scheduler, `do_in_background` runs on a blocking worker.

mod state;
mod token;

pub use state::TaskState;
pub use token::{CancelToken, Canceled};

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::LoaderError;
use crate::sync::resilient_lock;
use state::StateCell;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// The work a task performs.
pub trait Job: Send + Sync + 'static {
    /// Result of the background body. Cloned when followers share it.
    type Output: Clone + Send + 'static;

    /// Runs on the scheduler right before the body is handed to a worker.
    fn on_pre_execute(&self) {}

    /// Runs on a dedicated worker thread. Poll `token` to stop early.
    fn do_in_background(&self, token: &CancelToken) -> anyhow::Result<Self::Output>;

    /// Runs on the scheduler exactly once per task.
    fn on_post_execute(&self, outcome: Outcome<Self::Output>);
}

/// What a task's post-execute hook receives.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The body returned a value and nobody canceled the task.
    Completed(T),
    /// The body returned an error or panicked.
    Failed(anyhow::Error),
    /// The task was canceled. Holds the body's value if it finished anyway.
    Canceled(Option<T>),
}

impl<T> Outcome<T> {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

impl<T: Clone> Outcome<T> {
    /// Copy handed to a follower of the task that produced this outcome.
    pub(crate) fn share(&self) -> Self {
        match self {
            Self::Completed(value) => Self::Completed(value.clone()),
            Self::Failed(err) => Self::Failed(anyhow::anyhow!("{:#}", err)),
            Self::Canceled(value) => Self::Canceled(value.clone()),
        }
    }
}

/// State shared between a task, its handles and its scheduler.
#[derive(Debug)]
struct TaskShared {
    id: u64,
    state: StateCell,
    token: CancelToken,
    cancelable: AtomicBool,
    owner: Mutex<Option<Weak<Notify>>>,
}

impl TaskShared {
    fn wake_owner(&self) {
        let owner = resilient_lock(&self.owner).as_ref().and_then(Weak::upgrade);
        if let Some(notify) = owner {
            notify.notify_one();
        }
    }

    /// Move to CANCELING and raise the token. Returns false if the task was
    /// already canceling or finished.
    fn enter_canceling(&self) -> bool {
        let moved = self.state.try_transition(TaskState::Canceling);
        if moved {
            self.token.cancel();
        }
        moved
    }
}

/// A unit of work admitted to a [`TaskQueue`](crate::queue::TaskQueue).
pub struct Task<J: Job> {
    job: Arc<J>,
    shared: Arc<TaskShared>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl<J: Job> Task<J> {
    /// Create a waiting, cancelable task without a timeout.
    pub fn new(job: J) -> Self {
        Self {
            job: Arc::new(job),
            shared: Arc::new(TaskShared {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                state: StateCell::new(),
                token: CancelToken::new(),
                cancelable: AtomicBool::new(true),
                owner: Mutex::new(None),
            }),
            timeout: None,
            deadline: None,
        }
    }

    /// Whether `cancel()` has any effect. Timeouts and evictions ignore this.
    pub fn cancelable(self, cancelable: bool) -> Self {
        self.shared.cancelable.store(cancelable, Ordering::SeqCst);
        self
    }

    /// Force-cancel the task if it is still running `timeout` after it starts.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> TaskState {
        self.shared.state.get()
    }

    pub fn job(&self) -> &J {
        &self.job
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Request cancellation. No-op unless the task is cancelable.
    pub fn cancel(&self) -> bool {
        self.handle().cancel()
    }

    pub(crate) fn attach(&self, owner: Weak<Notify>) {
        *resilient_lock(&self.shared.owner) = Some(owner);
    }

    /// Deadline of a started task with a timeout.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn is_canceling(&self) -> bool {
        self.state() == TaskState::Canceling
            || self.shared.token.is_canceled()
            || self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Cancel regardless of the cancelable flag.
    pub(crate) fn force_cancel(&self) -> bool {
        self.shared.enter_canceling()
    }

    /// Move WAITING -> STARTING -> RUNNING and run the pre-execute hook.
    ///
    /// Returns the token for the body, or `None` if the task was canceled
    /// before it could start. Fails if the task is in any other state.
    pub(crate) fn start(&mut self) -> Result<Option<CancelToken>, LoaderError> {
        if self.state() == TaskState::Canceling {
            return Ok(None);
        }
        self.shared.state.transition(TaskState::Starting)?;
        self.job.on_pre_execute();
        if let Err(err) = self.shared.state.transition(TaskState::Running) {
            // A handle canceled us while the pre-execute hook ran.
            if self.state() == TaskState::Canceling {
                return Ok(None);
            }
            return Err(err);
        }

        let token = match self.timeout {
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                self.deadline = Some(deadline);
                self.shared.token.with_deadline(deadline)
            }
            None => self.shared.token.clone(),
        };
        Ok(Some(token))
    }

    /// Closure executed on the worker. Panics become failures.
    pub(crate) fn body(&self, token: CancelToken) -> impl FnOnce() -> anyhow::Result<J::Output> + Send + 'static {
        let job = Arc::clone(&self.job);
        move || {
            match panic::catch_unwind(AssertUnwindSafe(|| job.do_in_background(&token))) {
                Ok(result) => result,
                Err(payload) => Err(anyhow::anyhow!(
                    "background body panicked: {}",
                    panic_message(payload.as_ref())
                )),
            }
        }
    }

    /// Deliver post-execute for a task whose body ran, then for its followers.
    ///
    /// A task that was canceled or timed out while running gets
    /// `Outcome::Canceled` carrying whatever the body returned.
    pub(crate) fn finish(self, result: anyhow::Result<J::Output>, followers: Vec<Task<J>>) -> TaskState {
        let (outcome, terminal) = if self.is_canceling() {
            self.shared.enter_canceling();
            (Outcome::Canceled(result.ok()), TaskState::Canceled)
        } else {
            match result {
                Ok(value) => (Outcome::Completed(value), TaskState::Complete),
                Err(err) => (Outcome::Failed(err), TaskState::Complete),
            }
        };
        let template = if followers.is_empty() { None } else { Some(outcome.share()) };
        self.deliver(outcome, terminal);
        if let Some(template) = template {
            for follower in followers {
                follower.finish_following(&template);
            }
        }
        terminal
    }

    /// Deliver a canceled post-execute for a task whose body never ran.
    pub(crate) fn finish_canceled(self, followers: Vec<Task<J>>) -> TaskState {
        self.shared.enter_canceling();
        self.deliver(Outcome::Canceled(None), TaskState::Canceled);
        for follower in followers {
            follower.finish_canceled(Vec::new());
        }
        TaskState::Canceled
    }

    /// Complete a follower with a copy of its leader's outcome.
    pub(crate) fn finish_following(mut self, leader: &Outcome<J::Output>) {
        if leader.is_canceled() {
            self.finish_canceled(Vec::new());
            return;
        }
        match self.start() {
            Ok(Some(_)) => self.deliver(leader.share(), TaskState::Complete),
            Ok(None) => {
                self.finish_canceled(Vec::new());
            }
            Err(err) => {
                tracing::warn!(target: "resloader::task", task = self.id(), "Follower could not start: {}", err);
                self.finish_canceled(Vec::new());
            }
        }
    }

    fn deliver(self, outcome: Outcome<J::Output>, terminal: TaskState) {
        let job = Arc::clone(&self.job);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || job.on_post_execute(outcome))) {
            tracing::error!(
                target: "resloader::task",
                task = self.id(),
                "Post-execute hook panicked: {}",
                panic_message(payload.as_ref())
            );
        }
        if let Err(err) = self.shared.state.transition(terminal) {
            tracing::error!(target: "resloader::task", task = self.id(), "{}", err);
        }
    }
}

impl<J: Job> std::fmt::Debug for Task<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("timeout", &self.timeout)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Observer and canceller for a task that has been handed to a queue.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> TaskState {
        self.shared.state.get()
    }

    /// Every state the task has been in, oldest first.
    pub fn history(&self) -> Vec<TaskState> {
        self.shared.state.history()
    }

    pub fn is_cancelable(&self) -> bool {
        self.shared.cancelable.load(Ordering::SeqCst)
    }

    /// Request cancellation and wake the owning queue.
    ///
    /// Returns false if the task is not cancelable or already finishing.
    pub fn cancel(&self) -> bool {
        if !self.is_cancelable() {
            return false;
        }
        let moved = self.shared.enter_canceling();
        if moved {
            self.shared.wake_owner();
        }
        moved
    }

    /// Wait until the task reaches COMPLETE or CANCELED.
    pub async fn wait(&self) -> TaskState {
        let mut rx = self.shared.state.subscribe();
        let result = rx.wait_for(|state| state.is_terminal()).await.map(|state| *state);
        result.unwrap_or_else(|_| self.state())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
