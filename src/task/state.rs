// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task lifecycle states and the cell that guards transitions.

use std::fmt;
use std::sync::Mutex;

use tokio::sync::watch;

use crate::error::LoaderError;
use crate::sync::resilient_lock;

/// Lifecycle of a task.
///
/// Two paths are valid: `WAITING -> STARTING -> RUNNING -> COMPLETE`, or any
/// prefix of it that is not yet complete followed by `CANCELING -> CANCELED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Admitted to a queue, not yet dispatched.
    Waiting,
    /// Picked by the scheduler, pre-execute hook running.
    Starting,
    /// Background body running on a worker.
    Running,
    /// Post-execute delivered for a finished or failed body.
    Complete,
    /// Cancellation requested, post-execute not yet delivered.
    Canceling,
    /// Post-execute delivered with the canceled flag.
    Canceled,
}

impl TaskState {
    /// Check if the state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Canceled)
    }

    /// Check if the task occupies a worker.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// Check whether `next` is reachable from this state in one step.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Waiting, Starting)
                | (Starting, Running)
                | (Running, Complete)
                | (Waiting, Canceling)
                | (Starting, Canceling)
                | (Running, Canceling)
                | (Canceling, Canceled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Waiting => "WAITING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
            Self::Canceling => "CANCELING",
            Self::Canceled => "CANCELED",
        };
        f.write_str(name)
    }
}

/// Shared, observable task state.
///
/// Transitions are checked and applied atomically under the watch channel's
/// lock, and every applied state is appended to the history.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<TaskState>,
    history: Mutex<Vec<TaskState>>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(TaskState::Waiting);
        Self {
            tx,
            history: Mutex::new(vec![TaskState::Waiting]),
        }
    }

    pub(crate) fn get(&self) -> TaskState {
        *self.tx.borrow()
    }

    pub(crate) fn history(&self) -> Vec<TaskState> {
        resilient_lock(&self.history).clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.tx.subscribe()
    }

    /// Apply `to` if it is reachable. Returns the previous state, or the
    /// current state as the error when the move is not allowed.
    fn apply(&self, to: TaskState) -> Result<TaskState, TaskState> {
        let mut result = Err(to);
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(to) {
                result = Ok(*current);
                *current = to;
                resilient_lock(&self.history).push(to);
                true
            } else {
                result = Err(*current);
                false
            }
        });
        result
    }

    /// Strict transition used by the scheduler.
    pub(crate) fn transition(&self, to: TaskState) -> Result<TaskState, LoaderError> {
        self.apply(to)
            .map_err(|from| LoaderError::IllegalState { from, to })
    }

    /// Lenient transition; returns whether it happened.
    pub(crate) fn try_transition(&self, to: TaskState) -> bool {
        self.apply(to).is_ok()
    }
}
