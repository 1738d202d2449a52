// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cooperative cancellation probe handed to background bodies.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Cancellation flag plus an optional deadline.
///
/// Cancellation never interrupts a body. Long-running work polls
/// [`CancelToken::is_canceled`] (or [`CancelToken::check`]) at I/O
/// boundaries and returns early.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// Create a token that is not canceled and never expires.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token sharing this flag that also expires at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            flag: Arc::clone(&self.flag),
            deadline: Some(deadline),
        }
    }

    /// Raise the flag. Every clone observes it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once canceled or past the deadline.
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.is_expired()
    }

    /// True once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Return `Err(Canceled)` when the token is canceled.
    ///
    /// Convenient inside bodies returning `anyhow::Result`:
    /// `token.check()?;`
    pub fn check(&self) -> Result<(), Canceled> {
        if self.is_canceled() {
            Err(Canceled)
        } else {
            Ok(())
        }
    }
}

/// Error returned by [`CancelToken::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation canceled")
    }
}

impl std::error::Error for Canceled {}
