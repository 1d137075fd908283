//! Master-side bookkeeping of spawned workers.
//!
//! Each successfully handshaken worker gets a [`WorkerRecord`]: its address,
//! a one-shot failure callback, the cancellation handles its supervisor
//! listens on, and a watch channel carrying its eventual exit status. The
//! registry is the id → record map a runtime consults for lookups and
//! shutdown sweeps.

use std::{
    fmt,
    sync::{atomic::AtomicBool, Mutex},
};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{env::WorkerId, error::Error};

/// Reachable endpoint of a worker's RPC server. Set once at handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Invoked at most once when a worker fails after its handshake succeeded.
pub type FailureCallback = Box<dyn FnOnce(Error) + Send + Sync + 'static>;

/// Exit status of a worker process: `None` while running, then the exit
/// code (or `None` inside when killed by signal).
pub(crate) type ExitStatus = Option<Option<i32>>;

/// Master-side record of one live worker.
pub(crate) struct WorkerRecord {
    pub(crate) id: WorkerId,
    pub(crate) address: WorkerAddress,
    pub(crate) on_failure: Mutex<Option<FailureCallback>>,
    /// Set by a deliberate `close_server`; suppresses failure callbacks.
    pub(crate) closed: AtomicBool,
    /// Cancelling this closes the heartbeat link deliberately, which tells
    /// the worker to run its shutdown cascade.
    pub(crate) link_cancel: CancellationToken,
    /// Cancelling this hard-kills the worker process.
    pub(crate) kill: CancellationToken,
    pub(crate) exit: watch::Receiver<ExitStatus>,
}

impl WorkerRecord {
    /// Fire the failure callback, if it is still armed.
    pub(crate) fn fire_on_failure(&self, error: Error) {
        let callback = self
            .on_failure
            .lock()
            .expect("failure callback lock poisoned")
            .take();
        if let Some(callback) = callback {
            callback(error);
        }
    }

    /// Wait until the worker's exit status is known.
    pub(crate) async fn wait_exit(&self) -> Option<i32> {
        let mut rx = self.exit.clone();
        loop {
            if let Some(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                // Supervisor gone without publishing; status unknown.
                return None;
            }
        }
    }
}

/// Id → record map, owned by a master (or intermediate worker) runtime.
pub(crate) struct WorkerRegistry {
    workers: DashMap<WorkerId, Arc<WorkerRecord>>,
}

impl WorkerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            workers: DashMap::new(),
        }
    }

    pub(crate) fn insert(&self, record: Arc<WorkerRecord>) {
        self.workers.insert(record.id.clone(), record);
    }

    pub(crate) fn remove(&self, id: &WorkerId) {
        self.workers.remove(id);
    }

    pub(crate) fn records(&self) -> Vec<Arc<WorkerRecord>> {
        self.workers.iter().map(|entry| entry.value().clone()).collect()
    }

    pub(crate) fn ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }
}
