// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scheduler actor behind a [`TaskQueue`](super::TaskQueue).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tokio::sync::{mpsc, watch, Notify};

use super::{Command, KeyConflictPolicy, QueueMode, QueueStats};
use crate::task::{Job, Task, TaskState};

/// Body results reported back by workers.
type Finished<T> = (u64, anyhow::Result<T>);

/// A started task whose post-execute has not run yet.
struct InFlight<J: Job> {
    key: String,
    task: Task<J>,
    /// Counts against the concurrency limit.
    holds_slot: bool,
}

/// What pushed the waiting set over capacity.
#[derive(Clone, Copy)]
enum Overflow {
    /// A task was just inserted at the back.
    Put,
    /// The capacity was lowered.
    Shrink,
}

/// Where a key currently lives.
enum Slot {
    Waiting,
    Running(u64),
}

pub(super) struct Dispatcher<J: Job> {
    name: String,
    mode: QueueMode,
    concurrency: usize,
    capacity: usize,
    policy: KeyConflictPolicy,
    wait_canceling: bool,
    closing: bool,

    waiting: IndexMap<String, Task<J>>,
    in_flight: HashMap<u64, InFlight<J>>,
    /// Tasks attached to a leader under the Follow policy, by leader id.
    followers: HashMap<u64, Vec<Task<J>>>,

    notify: Arc<Notify>,
    finished_tx: mpsc::UnboundedSender<Finished<J::Output>>,
    finished_rx: mpsc::UnboundedReceiver<Finished<J::Output>>,

    completed: u64,
    canceled: u64,
    evicted: u64,
    peak_running: usize,
}

impl<J: Job> Dispatcher<J> {
    pub(super) fn new(name: &str, mode: QueueMode, concurrency: usize, notify: Arc<Notify>) -> Self {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            mode,
            concurrency,
            capacity: usize::MAX,
            policy: KeyConflictPolicy::default(),
            wait_canceling: false,
            closing: false,
            waiting: IndexMap::new(),
            in_flight: HashMap::new(),
            followers: HashMap::new(),
            notify,
            finished_tx,
            finished_rx,
            completed: 0,
            canceled: 0,
            evicted: 0,
            peak_running: 0,
        }
    }

    /// Actor loop. Every wakeup is followed by one dispatch pass.
    pub(super) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command<J>>,
        done: watch::Sender<bool>,
    ) {
        let notify = Arc::clone(&self.notify);
        let mut commands_open = true;

        loop {
            if self.closing && self.is_drained() {
                break;
            }

            let next_deadline = self.next_deadline();
            let sleep_until = next_deadline
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(command) => {
                        self.handle(command);
                        // Drain the rest of a burst before dispatching once.
                        while let Ok(command) = commands.try_recv() {
                            self.handle(command);
                        }
                    }
                    None => {
                        commands_open = false;
                        self.begin_shutdown();
                    }
                },
                Some((id, result)) = self.finished_rx.recv() => {
                    self.on_finished(id, result);
                }
                _ = notify.notified() => {
                    // Handles canceled something; the pass below collects it.
                }
                _ = tokio::time::sleep_until(sleep_until), if next_deadline.is_some() => {
                    self.expire_deadlines();
                }
            }

            self.dispatch();
        }

        // Refuse further sends, then cancel whatever slipped in before the close.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            self.handle(command);
        }
        drop(commands);

        tracing::debug!(target: "resloader::queue", queue = %self.name, "Task queue stopped");
        let _ = done.send(true);
    }

    fn handle(&mut self, command: Command<J>) {
        match command {
            Command::Put { key, task } => self.put(key, task),
            Command::Cancel { key } => self.cancel(&key),
            Command::CancelAll => self.cancel_all(false),
            Command::Preferred { key } => self.preferred(&key),
            Command::SetCapacity(capacity) => {
                self.capacity = capacity;
                self.enforce_capacity(Overflow::Shrink);
            }
            Command::SetConcurrency(concurrency) => self.concurrency = concurrency.max(1),
            Command::SetPolicy(policy) => self.policy = policy,
            Command::SetWaitCanceling(wait) => {
                self.wait_canceling = wait;
                if !wait {
                    self.release_canceled_slots();
                }
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown => self.begin_shutdown(),
        }
    }

    // =========================================================================
    // Admission
    // =========================================================================

    fn put(&mut self, key: String, task: Task<J>) {
        if self.closing {
            tracing::debug!(target: "resloader::queue", queue = %self.name, key = %key, "Queue closing, canceling new task");
            self.cancel_unstarted(task);
            return;
        }

        match (self.policy, self.locate(&key)) {
            (_, None) => {}
            (KeyConflictPolicy::Displace, Some(Slot::Waiting)) => {
                if let Some(old) = self.waiting.shift_remove(&key) {
                    tracing::debug!(target: "resloader::queue", queue = %self.name, key = %key, task = old.id(), "Displacing waiting task");
                    self.cancel_unstarted(old);
                }
            }
            (KeyConflictPolicy::Displace, Some(Slot::Running(id))) => {
                tracing::debug!(target: "resloader::queue", queue = %self.name, key = %key, task = id, "Displacing running task");
                self.cancel_running(id, true);
            }
            (KeyConflictPolicy::Follow, Some(slot)) => {
                let leader = match slot {
                    Slot::Running(id) => Some(id),
                    Slot::Waiting => self.waiting.get(&key).map(|t| t.id()),
                };
                if let Some(leader) = leader {
                    tracing::debug!(target: "resloader::queue", queue = %self.name, key = %key, leader, "Task follows existing task");
                    self.followers.entry(leader).or_default().push(task);
                    return;
                }
            }
            (KeyConflictPolicy::Reject, Some(_)) => {
                tracing::debug!(target: "resloader::queue", queue = %self.name, key = %key, "Key busy, rejecting task");
                self.cancel_unstarted(task);
                return;
            }
        }

        self.waiting.insert(key, task);
        self.enforce_capacity(Overflow::Put);
    }

    /// Find the non-canceled task holding `key`.
    fn locate(&self, key: &str) -> Option<Slot> {
        if self.waiting.contains_key(key) {
            return Some(Slot::Waiting);
        }
        self.in_flight
            .iter()
            .find(|(_, entry)| entry.key == key && !entry.task.is_canceling())
            .map(|(id, _)| Slot::Running(*id))
    }

    fn enforce_capacity(&mut self, cause: Overflow) {
        while self.waiting.len() > self.capacity {
            let victim = match (self.mode, cause) {
                // Keep older requests; drop the newest one that was already waiting.
                (QueueMode::Sequential, Overflow::Put) => self.waiting.len().saturating_sub(2),
                (QueueMode::Sequential, Overflow::Shrink) => self.waiting.len() - 1,
                (QueueMode::Reverse, _) => 0,
            };
            let Some((key, task)) = self.waiting.shift_remove_index(victim) else {
                break;
            };
            tracing::debug!(target: "resloader::queue", queue = %self.name, key = %key, task = task.id(), "Waiting set full, evicting task");
            self.evicted += 1;
            self.cancel_unstarted(task);
        }
    }

    fn preferred(&mut self, key: &str) {
        let Some(index) = self.waiting.get_index_of(key) else {
            return;
        };
        let front = match self.mode {
            QueueMode::Sequential => 0,
            QueueMode::Reverse => self.waiting.len() - 1,
        };
        self.waiting.move_index(index, front);
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    fn cancel(&mut self, key: &str) {
        if let Some(task) = self.waiting.get(key) {
            if task.handle().is_cancelable() {
                if let Some(task) = self.waiting.shift_remove(key) {
                    self.cancel_unstarted(task);
                }
            } else {
                tracing::debug!(target: "resloader::queue", queue = %self.name, key = %key, "Task is not cancelable");
            }
            return;
        }

        let running: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.key == key && !entry.task.is_canceling())
            .map(|(id, _)| *id)
            .collect();
        for id in running {
            self.cancel_running(id, false);
        }
    }

    /// Cancel everything. `force` ignores the cancelable flag on waiting tasks.
    fn cancel_all(&mut self, force: bool) {
        let waiting: Vec<String> = self
            .waiting
            .iter()
            .filter(|(_, task)| force || task.handle().is_cancelable())
            .map(|(key, _)| key.clone())
            .collect();
        for key in waiting {
            if let Some(task) = self.waiting.shift_remove(&key) {
                self.cancel_unstarted(task);
            }
        }

        let running: Vec<u64> = self.in_flight.keys().copied().collect();
        for id in running {
            self.cancel_running(id, false);
        }
    }

    fn begin_shutdown(&mut self) {
        if self.closing {
            return;
        }
        tracing::debug!(target: "resloader::queue", queue = %self.name, "Shutting down task queue");
        self.closing = true;
        // Waiting tasks will never run, so the flag does not protect them.
        self.cancel_all(true);
    }

    /// Cancel a running task. Without `force` the cancelable flag is honored.
    fn cancel_running(&mut self, id: u64, force: bool) {
        let wait_canceling = self.wait_canceling;
        let Some(entry) = self.in_flight.get_mut(&id) else {
            return;
        };
        let canceled = if force {
            entry.task.force_cancel()
        } else {
            entry.task.cancel()
        };
        if canceled && !wait_canceling {
            entry.holds_slot = false;
        }
    }

    /// Deliver a canceled post-execute to a task that never started, and to
    /// anything following it.
    fn cancel_unstarted(&mut self, task: Task<J>) {
        task.force_cancel();
        let followers = self.followers.remove(&task.id()).unwrap_or_default();
        self.canceled += 1 + followers.len() as u64;
        task.finish_canceled(followers);
    }

    fn expire_deadlines(&mut self) {
        let now = Instant::now();
        let wait_canceling = self.wait_canceling;
        for entry in self.in_flight.values_mut() {
            let expired = entry.task.deadline().map_or(false, |d| d <= now);
            if expired && entry.task.state() == TaskState::Running {
                tracing::debug!(target: "resloader::queue", queue = %self.name, key = %entry.key, task = entry.task.id(), "Task timed out");
                entry.task.force_cancel();
                if !wait_canceling {
                    entry.holds_slot = false;
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.in_flight
            .values()
            .filter(|entry| entry.task.state() == TaskState::Running)
            .filter_map(|entry| entry.task.deadline())
            .min()
    }

    /// Pick up cancellations requested through task handles.
    fn collect_canceled(&mut self) {
        let canceled: Vec<String> = self
            .waiting
            .iter()
            .filter(|(_, task)| task.state() == TaskState::Canceling)
            .map(|(key, _)| key.clone())
            .collect();
        for key in canceled {
            if let Some(task) = self.waiting.shift_remove(&key) {
                self.cancel_unstarted(task);
            }
        }

        let mut dropped = Vec::new();
        for list in self.followers.values_mut() {
            let (keep, gone): (Vec<_>, Vec<_>) = std::mem::take(list)
                .into_iter()
                .partition(|task| task.state() != TaskState::Canceling);
            *list = keep;
            dropped.extend(gone);
        }
        self.followers.retain(|_, list| !list.is_empty());
        for task in dropped {
            self.canceled += 1;
            task.finish_canceled(Vec::new());
        }

        if !self.wait_canceling {
            self.release_canceled_slots();
        }
    }

    fn release_canceled_slots(&mut self) {
        for entry in self.in_flight.values_mut() {
            if entry.holds_slot && entry.task.is_canceling() {
                entry.holds_slot = false;
            }
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn active_slots(&self) -> usize {
        self.in_flight.values().filter(|entry| entry.holds_slot).count()
    }

    fn is_drained(&self) -> bool {
        self.waiting.is_empty() && self.in_flight.is_empty() && self.followers.is_empty()
    }

    /// One dispatch pass: purge, then start waiting tasks while slots are free.
    fn dispatch(&mut self) {
        self.collect_canceled();
        if self.closing {
            return;
        }

        loop {
            let free = self.concurrency.saturating_sub(self.active_slots());
            if free == 0 || self.waiting.is_empty() {
                break;
            }
            for _ in 0..free {
                let next = match self.mode {
                    QueueMode::Sequential => self.waiting.shift_remove_index(0),
                    QueueMode::Reverse => self.waiting.pop(),
                };
                let Some((key, task)) = next else {
                    break;
                };
                self.start(key, task);
            }

            let active = self.active_slots();
            if active > self.concurrency {
                tracing::error!(
                    target: "resloader::queue",
                    queue = %self.name,
                    active,
                    concurrency = self.concurrency,
                    "Running count exceeds concurrency limit"
                );
                break;
            }
        }
    }

    fn start(&mut self, key: String, mut task: Task<J>) {
        match task.start() {
            Ok(Some(token)) => {
                let id = task.id();
                let body = task.body(token);
                let finished = self.finished_tx.clone();
                tokio::task::spawn_blocking(move || {
                    let result = body();
                    let _ = finished.send((id, result));
                });
                tracing::debug!(target: "resloader::queue", queue = %self.name, key = %key, task = id, "Task started");
                self.in_flight.insert(
                    id,
                    InFlight {
                        key,
                        task,
                        holds_slot: true,
                    },
                );
                self.peak_running = self.peak_running.max(self.active_slots());
            }
            Ok(None) => self.cancel_unstarted(task),
            Err(err) => {
                tracing::error!(target: "resloader::queue", queue = %self.name, key = %key, "Cannot start task: {}", err);
                self.cancel_unstarted(task);
            }
        }
    }

    fn on_finished(&mut self, id: u64, result: anyhow::Result<J::Output>) {
        let Some(entry) = self.in_flight.remove(&id) else {
            tracing::warn!(target: "resloader::queue", queue = %self.name, task = id, "Result for unknown task");
            return;
        };
        if let Err(err) = &result {
            if !entry.task.is_canceling() {
                tracing::debug!(target: "resloader::queue", queue = %self.name, key = %entry.key, task = id, "Task failed: {:#}", err);
            }
        }
        let followers = self.followers.remove(&id).unwrap_or_default();
        let count = 1 + followers.len() as u64;
        match entry.task.finish(result, followers) {
            TaskState::Canceled => self.canceled += count,
            _ => self.completed += count,
        }
    }

    fn stats(&self) -> QueueStats {
        let canceling = self
            .in_flight
            .values()
            .filter(|entry| entry.task.is_canceling())
            .count();
        QueueStats {
            name: self.name.clone(),
            waiting: self.waiting.len(),
            running: self.in_flight.len() - canceling,
            canceling,
            followers: self.followers.values().map(Vec::len).sum(),
            concurrency: self.concurrency,
            capacity: self.capacity,
            completed: self.completed,
            canceled: self.canceled,
            evicted: self.evicted,
            peak_running: self.peak_running,
        }
    }
}
