// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the loader core.
//!
//! Wiring mistakes and illegal state transitions surface as [`LoaderError`].
//! Failures inside collaborator hooks (decode, network, disk I/O) travel as
//! `anyhow::Error` and are turned into failed task outcomes instead.

use std::fmt;
use std::path::PathBuf;

use crate::task::TaskState;

/// Errors raised by the task, queue, cache and loader layers.
#[derive(Debug)]
pub enum LoaderError {
    /// A task was asked to move between two states that are not connected.
    IllegalState { from: TaskState, to: TaskState },
    /// A queue was created outside of a tokio runtime.
    NoRuntime,
    /// The queue's scheduler has shut down and no longer accepts work.
    QueueClosed,
    /// The loader was destroyed.
    Destroyed,
    /// A required collaborator was not supplied to the builder.
    MissingCollaborator(&'static str),
    /// Another process holds the disk cache directory.
    CacheLocked(PathBuf),
    /// The disk cache was closed.
    CacheClosed,
    /// Cache keys must be short lowercase file-name-safe strings.
    InvalidKey(String),
    /// Invalid configuration value.
    Config(String),
    /// Filesystem error from the disk cache.
    Io(std::io::Error),
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalState { from, to } => {
                write!(f, "Illegal task state transition: {} -> {}", from, to)
            }
            Self::NoRuntime => write!(f, "Task queues must be created inside a tokio runtime"),
            Self::QueueClosed => write!(f, "Task queue is shut down"),
            Self::Destroyed => write!(f, "Resource loader has been destroyed"),
            Self::MissingCollaborator(name) => write!(f, "Missing required collaborator: {}", name),
            Self::CacheLocked(dir) => {
                write!(f, "Disk cache {:?} is locked by another process", dir)
            }
            Self::CacheClosed => write!(f, "Disk cache is closed"),
            Self::InvalidKey(key) => write!(f, "Invalid cache key: {:?}", key),
            Self::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            Self::Io(err) => write!(f, "Disk cache I/O error: {}", err),
        }
    }
}

impl std::error::Error for LoaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LoaderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
