//! The typed surface a worker exposes: per-worker and per-connection state
//! plus the functions servable against them.
//!
//! A binary hosts exactly one [`WorkerService`] implementation. The service
//! defines what a worker is: the state built once at bootstrap, the state
//! built per connection, the teardown hooks, and — through
//! [`functions`](WorkerService::functions) — the RPC functions registered in
//! the worker's method table.
//!
//! [`RpcFunction`] is a pure signature: a method id plus input and output
//! schemas. Servers bind a handler to a signature at registration time;
//! clients use the same signature to issue typed calls, so both ends agree
//! on the codecs by construction.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use tracing::error;

use crate::{
    registry::FunctionRegistry,
    runtime::Runtime,
    serializer::Serializable,
    set_once::SetOnce,
    supervision::{LateTaskFailure, Scope},
};

/// The signature of a typed RPC: a wire-stable method id and the input and
/// output schemas bound to it.
pub trait RpcFunction: Send + Sync + 'static {
    /// Wire identifier of the method. Must be unique within a service.
    const NAME: &'static str;
    type Input: Serializable + Debug;
    type Output: Serializable + Debug;
}

/// A worker implementation: state lifecycle hooks and the served functions.
#[async_trait]
pub trait WorkerService: Send + Sync + Sized + 'static {
    /// Built exactly once when the worker bootstraps; shared by every
    /// connection and handler on the worker.
    type WorkerState: Send + Sync + 'static;

    /// Built once per accepted connection; owned by that connection's task
    /// chain.
    type ConnectionState: Send + Sync + 'static;

    /// Produce the per-worker state. Runs after the reverse handshake and
    /// before the server accepts any connection. A failure here is fatal to
    /// the worker.
    async fn init_worker_state(&self, runtime: &Runtime<Self>)
        -> anyhow::Result<Self::WorkerState>;

    /// Produce the per-connection state. Completes before the connection is
    /// acknowledged, so every handler on the connection observes it.
    async fn init_connection_state(
        &self,
        worker_state: &Arc<Self::WorkerState>,
    ) -> anyhow::Result<Self::ConnectionState>;

    /// Teardown hook, invoked once per connection when it closes — whether
    /// by the client's goodbye, a transport failure, or the server's
    /// shutdown cascade.
    async fn on_connection_close(
        &self,
        _state: &Self::ConnectionState,
        _worker_state: &Arc<Self::WorkerState>,
    ) {
    }

    /// Receives failures from background tasks that outlived their
    /// handler's result. The default logs them.
    async fn on_late_failure(
        &self,
        _worker_state: &Arc<Self::WorkerState>,
        failure: LateTaskFailure,
    ) {
        error!("{failure}");
    }

    /// Register every function this worker serves.
    fn functions(registry: &mut FunctionRegistry<Self>);
}

/// Server-side record of one live connection.
///
/// The connection-state slot is write-once: populated by
/// `init_connection_state` before the connection is acknowledged, read by
/// handlers for the rest of the connection's life.
pub struct LiveConnection<S: WorkerService> {
    pub(crate) worker_state: Arc<S::WorkerState>,
    pub(crate) state: SetOnce<S::ConnectionState>,
    pub(crate) server_port: u16,
}

impl<S: WorkerService> LiveConnection<S> {
    pub(crate) fn new(worker_state: Arc<S::WorkerState>, server_port: u16) -> Self {
        Self {
            worker_state,
            state: SetOnce::new(),
            server_port,
        }
    }
}

/// What a handler sees: the runtime, both state layers, and a supervision
/// scope for background work.
pub struct CallContext<S: WorkerService> {
    pub(crate) runtime: Runtime<S>,
    pub(crate) conn: Arc<LiveConnection<S>>,
    pub(crate) scope: Scope,
}

impl<S: WorkerService> Clone for CallContext<S> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            conn: self.conn.clone(),
            scope: self.scope.clone(),
        }
    }
}

impl<S: WorkerService> CallContext<S> {
    /// The runtime of the hosting worker. Handlers use this to spawn
    /// sub-workers of their own.
    pub fn runtime(&self) -> &Runtime<S> {
        &self.runtime
    }

    /// The worker-wide state.
    pub fn worker_state(&self) -> &S::WorkerState {
        &self.conn.worker_state
    }

    /// The state of the connection this call arrived on.
    pub fn connection_state(&self) -> &S::ConnectionState {
        self.conn
            .state
            .get()
            .expect("connection state read before initialization")
    }

    /// The port the hosting server listens on.
    pub fn server_port(&self) -> u16 {
        self.conn.server_port
    }

    /// Launch a background task that may outlive this call.
    ///
    /// If the task fails after the call's result is determined, the failure
    /// is delivered to the worker's late-failure monitor instead of the
    /// caller.
    pub fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.scope.spawn(future)
    }
}
