//! A single-assignment cell with asynchronous readers.
//!
//! Per-connection user state has a strict lifecycle: it is produced exactly
//! once by `init_connection_state`, then read by handlers for the remainder
//! of the connection. [`SetOnce`] encodes that lifecycle: a second write is
//! an error, and readers can either observe the current state or suspend
//! until the value arrives.

use std::sync::OnceLock;

use thiserror::Error;
use tokio::sync::Notify;

/// The slot was already populated.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("write-once slot written twice")]
pub struct DoubleSet;

/// A write-once slot whose readers may wait for the value.
pub struct SetOnce<T> {
    cell: OnceLock<T>,
    ready: Notify,
}

impl<T> SetOnce<T> {
    pub fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            ready: Notify::new(),
        }
    }

    /// Populate the slot. Exactly one call may succeed.
    pub fn set(&self, value: T) -> Result<(), DoubleSet> {
        self.cell.set(value).map_err(|_| DoubleSet)?;
        self.ready.notify_waiters();
        Ok(())
    }

    /// The value, if it has been written.
    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    /// Suspend until the value is written.
    pub async fn wait(&self) -> &T {
        loop {
            if let Some(value) = self.cell.get() {
                return value;
            }
            // Register interest before re-checking so a concurrent `set`
            // between the check and the await cannot be missed.
            let notified = self.ready.notified();
            if let Some(value) = self.cell.get() {
                return value;
            }
            notified.await;
        }
    }
}

impl<T> Default for SetOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for SetOnce<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SetOnce").field(&self.cell.get()).finish()
    }
}
