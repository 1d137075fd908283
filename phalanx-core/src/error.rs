//! Error taxonomy of the runtime.
//!
//! Expected failures — spawn, connect, user-callback, transport — are
//! packaged into [`Error`] values and surfaced as results. Programming
//! errors (a write-once slot written twice, an unknown method id) are raised
//! to the worker's supervising monitor and normally crash the worker.
//!
//! [`WireFailure`] is the serializable subset that travels in RPC responses:
//! what a server can tell a client about why a call did not produce a value.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{binary::BinaryDigest, env::WorkerId};

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong inside the runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// The role marker is present in the environment but malformed.
    #[error("invalid role marker in environment: {0:?}")]
    EnvInvalid(String),

    /// Extra environment pairs attempted to override a reserved key.
    #[error("extra environment overrides reserved key {0:?}")]
    ReservedEnvKey(String),

    /// The path of the currently running executable could not be resolved.
    #[error("could not locate the current executable")]
    BinaryNotLocatable(#[source] std::io::Error),

    /// The currently running executable could not be read for hashing.
    #[error("could not read the current executable")]
    BinaryReadFailed(#[source] std::io::Error),

    /// Master and worker are not running the same executable.
    #[error("binary mismatch: parent runs {expected}, child runs {actual}")]
    BinaryMismatch {
        expected: BinaryDigest,
        actual: BinaryDigest,
    },

    /// A spawned child never completed its reverse handshake.
    #[error("spawn failed: {reason}")]
    SpawnFailed { reason: String },

    /// Dialing a worker or performing the connection handshake failed.
    #[error("connect failed")]
    ConnectFailed(#[source] anyhow::Error),

    /// The user's `init_connection_state` callback failed on the worker.
    #[error("connection state initialization failed: {0}")]
    InitConnStateFailed(String),

    /// A typed RPC failed.
    #[error("rpc failed: {0}")]
    Rpc(RpcErrorKind),

    /// The liveness link to the remote side went silent.
    #[error("heartbeat lost")]
    HeartbeatLost,

    /// A worker process died after its handshake had succeeded.
    #[error("worker {id} exited unexpectedly (code {code:?})")]
    WorkerDied { id: WorkerId, code: Option<i32> },

    /// No parent endpoint is present in the environment.
    ///
    /// Returned by heartbeat initialization when the process was launched
    /// outside the framework.
    #[error("no parent endpoint in the environment")]
    NoParent,
}

impl Error {
    pub(crate) fn spawn_failed(reason: impl std::fmt::Display) -> Self {
        Self::SpawnFailed {
            reason: reason.to_string(),
        }
    }
}

/// Classifies why an individual RPC did not produce a value.
#[derive(Debug, Error)]
pub enum RpcErrorKind {
    /// The underlying byte stream failed.
    #[error("transport error")]
    Transport(#[source] anyhow::Error),

    /// A request or response failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(String),

    /// The remote side reported a failure.
    #[error("remote failure: {0}")]
    Remote(WireFailure),

    /// The connection was closed while the call was outstanding.
    #[error("connection closed")]
    ConnectionClosed,
}

/// The serializable failure payload of an RPC response.
///
/// `Result` contents have to cross the wire, so this mirrors the remote
/// error cases in a form every peer can decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum WireFailure {
    /// No function with this method id is registered on the server.
    #[error("unknown method {0:?}")]
    UnknownMethod(String),

    /// The request payload did not decode against the registered input
    /// schema, or the output failed to encode.
    #[error("malformed payload: {0}")]
    Codec(String),

    /// The registered handler returned an error.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The user's `init_connection_state` callback failed.
    #[error("connection state initialization failed: {0}")]
    ConnInit(String),

    /// The server is quiescing and no longer accepts work.
    #[error("server is shutting down")]
    Shutdown,
}
