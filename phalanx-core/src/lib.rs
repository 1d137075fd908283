//! Parallel distributed computation across OS processes.
//!
//! Phalanx runs a single program as a tree of cooperating processes. A
//! *master* process spawns *worker* processes — locally via exec, remotely
//! via a remote-shell command, or in-process for tests — and talks to them
//! over a binary RPC protocol. Workers may spawn workers of their own, so
//! the tree grows to whatever shape the computation needs, with every
//! child's liveness tied to its parent by a heartbeat.
//!
//! Parallelism comes from processes, not threads: within each process a
//! single cooperative event loop multiplexes all I/O.
//!
//! # The shape of a program
//!
//! The same executable plays both roles. [`start_app`] inspects the
//! environment before any user logic: masters get a [`Runtime`] back and
//! continue into their own `main`; workers never return — they bootstrap,
//! serve, and exit.
//!
//! A worker's behavior is a [`WorkerService`]: per-worker state built once
//! at bootstrap, per-connection state built for each client, and a set of
//! typed functions registered against a method table.
//!
//! ```no_run
//! use async_trait::async_trait;
//! use phalanx::{
//!     start_app, CallContext, Config, FunctionRegistry, RpcFunction, Runtime, SpawnOptions,
//!     WorkerService,
//! };
//! use std::sync::Arc;
//!
//! struct Ping;
//! impl RpcFunction for Ping {
//!     const NAME: &'static str = "ping";
//!     type Input = ();
//!     type Output = String;
//! }
//!
//! struct App;
//!
//! #[async_trait]
//! impl WorkerService for App {
//!     type WorkerState = ();
//!     type ConnectionState = ();
//!
//!     async fn init_worker_state(&self, _runtime: &Runtime<Self>) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn init_connection_state(&self, _worker: &Arc<()>) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     fn functions(registry: &mut FunctionRegistry<Self>) {
//!         registry.register::<Ping, _, _>(|_ctx: CallContext<Self>, ()| async move {
//!             Ok("pong".to_string())
//!         });
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = start_app(App, &Config::default()).await?;
//!
//!     let worker = runtime.spawn(SpawnOptions::local()).await?;
//!     let conn = worker.client().await?;
//!     assert_eq!(conn.run::<Ping>(()).await?, "pong");
//!
//!     conn.close().await?;
//!     worker.close_server().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Lifecycle guarantees
//!
//! - A spawn that returns a [`WorkerHandle`] received exactly one reverse
//!   handshake, and the worker's executable digest matched the master's
//!   (unless the check is disabled).
//! - `init_worker_state` happens before any `init_connection_state`, which
//!   happens before any handler observes that connection.
//! - Closing a server drains every live connection's state — teardown hooks
//!   included — before the per-worker state is released.
//! - A worker spawned by the framework never outlives its parent's
//!   heartbeat.
//!
//! # Supervision
//!
//! Handlers run under [`try_within`] scopes: errors raised before a result
//! is determined surface to the caller; failures of background tasks a
//! handler spawned arrive at the worker's late-failure hook instead of
//! crashing anything. See the [`supervision`] module.

pub mod binary;
pub mod config;
pub mod connection;
pub mod env;
pub mod error;
pub mod heartbeat;
pub mod registry;
pub mod runtime;
pub mod serializer;
pub mod service;
pub mod set_once;
pub mod supervision;
pub mod wire;

pub use config::Config;
pub use connection::Connection;
pub use env::{Role, WorkerId};
pub use error::{Error, Result, RpcErrorKind, WireFailure};
pub use heartbeat::HeartbeatConfig;
pub use registry::FunctionRegistry;
pub use runtime::{
    start_app, Redirection, Runtime, SpawnOptions, SpawnTarget, WorkerAddress, WorkerHandle,
};
pub use service::{CallContext, RpcFunction, WorkerService};
pub use supervision::{try_within, LateTaskFailure, Monitor, MonitorStream};

pub use async_trait::async_trait;
