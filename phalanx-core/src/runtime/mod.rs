//! The dual-role runtime: process bootstrap, worker spawning, and the
//! master-side view of the worker tree.
//!
//! The same executable is reused as both master and worker.
//! [`start_app`] inspects the environment before any user logic runs: a
//! master gets a [`Runtime`] back and proceeds into its own `main`; a worker
//! never returns — it finishes bootstrap, serves its RPC functions, and
//! exits the process with a code describing how its life ended.
//!
//! A [`Runtime`] is a cheap handle (clone freely) owning the worker
//! registry and the spawn engine. Workers hold a runtime of their own, so a
//! worker can spawn sub-workers and the tree can grow to any depth; ids
//! stay unique because each runtime prefixes its children with its own id.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tracing::{debug, info};

use crate::{
    config::Config,
    env::{Role, WorkerId},
    error::Result,
    serializer::Serializer,
    service::WorkerService,
};

pub(crate) mod registry;
mod spawn;
pub(crate) mod worker;

pub use registry::{FailureCallback, WorkerAddress};
pub use spawn::{Redirection, SpawnOptions, SpawnTarget, WorkerHandle};
pub use worker::{
    EXIT_BINARY_MISMATCH, EXIT_CLEAN, EXIT_HANDSHAKE_FAILED, EXIT_HEARTBEAT_LOST, EXIT_USER_ERROR,
};

/// Library entry point; call before any user logic.
///
/// Detects the process role from the environment. Masters receive a
/// [`Runtime`] and continue. Workers run their bootstrap and server loop
/// here and **do not return**: the process exits with the worker's exit
/// code when its server life ends.
pub async fn start_app<S: WorkerService>(service: S, config: &Config) -> Result<Runtime<S>> {
    let role = Role::from_process_env()?;
    match role {
        Role::Master => {
            debug!("process classified as master");
            Ok(Runtime::new(service, config.clone(), Role::Master))
        }
        Role::Worker(id) => {
            info!(worker = %id, "process classified as worker");
            let vars: Vec<(String, String)> = std::env::vars().collect();
            let mut config = config.clone();
            // The spawner's serializer wins over however this process built
            // its configuration; the two ends must frame alike.
            if let Some(serializer) =
                crate::env::serializer_from_vars(vars.iter().map(|(k, v)| (k.as_str(), v.clone())))?
            {
                config.serializer = serializer;
            }
            let boot = worker::BootContext::from_vars(id.clone(), &vars, &config)?;
            let runtime = Runtime::new(service, config, Role::Worker(id));
            let code = worker::run(runtime, boot).await;
            std::process::exit(code);
        }
    }
}

struct RuntimeInner<S: WorkerService> {
    role: Role,
    config: Config,
    serializer: Serializer,
    service: Arc<S>,
    workers: registry::WorkerRegistry,
    spawn_seq: AtomicU64,
}

/// Handle to the runtime of this process.
///
/// Owned by masters returned from [`start_app`] and by workers internally;
/// both sides use it to spawn and manage children.
pub struct Runtime<S: WorkerService> {
    inner: Arc<RuntimeInner<S>>,
}

impl<S: WorkerService> Clone for Runtime<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: WorkerService> Runtime<S> {
    pub(crate) fn new(service: S, config: Config, role: Role) -> Self {
        let serializer = Serializer::from(&config);
        Self {
            inner: Arc::new(RuntimeInner {
                role,
                serializer,
                config,
                service: Arc::new(service),
                workers: registry::WorkerRegistry::new(),
                spawn_seq: AtomicU64::new(0),
            }),
        }
    }

    /// The runtime an in-process worker runs under: same service and
    /// configuration, its own role, registry, and id sequence.
    pub(crate) fn child_runtime(&self, id: WorkerId) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                role: Role::Worker(id),
                config: self.inner.config.clone(),
                serializer: self.inner.serializer,
                service: self.inner.service.clone(),
                workers: registry::WorkerRegistry::new(),
                spawn_seq: AtomicU64::new(0),
            }),
        }
    }

    /// The immutable role of this process.
    pub fn role(&self) -> &Role {
        &self.inner.role
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn serializer(&self) -> Serializer {
        self.inner.serializer
    }

    /// Ids of the workers currently registered under this runtime.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.inner.workers.ids()
    }

    /// Number of live workers under this runtime.
    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Close every worker spawned by this runtime.
    ///
    /// Convenience sweep over [`WorkerHandle::close_server`]; failures are
    /// collected per worker but do not stop the sweep.
    pub async fn shutdown(&self) -> Result<()> {
        let records = self.inner.workers.records();
        let closes = records.into_iter().map(|record| {
            let handle = WorkerHandle::from_parts(self.clone(), record);
            async move { handle.close_server().await }
        });
        for result in futures::future::join_all(closes).await {
            result?;
        }
        Ok(())
    }

    pub(crate) fn service(&self) -> Arc<S> {
        self.inner.service.clone()
    }

    pub(crate) fn workers(&self) -> &registry::WorkerRegistry {
        &self.inner.workers
    }

    pub(crate) fn remove_worker(&self, id: &WorkerId) {
        self.inner.workers.remove(id);
    }

    /// Allocate the next child id: monotonic within this runtime, globally
    /// unique through hierarchical prefixing.
    pub(crate) fn next_child_id(&self) -> WorkerId {
        let seq = self.inner.spawn_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.role.child_id(seq)
    }
}
