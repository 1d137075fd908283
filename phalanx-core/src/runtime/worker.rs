//! The worker side: bootstrap, server loop, and shutdown cascade.
//!
//! A worker process never returns from `start_app`. Its life is:
//!
//! 1. Bind the RPC server on an ephemeral port.
//! 2. Dial the parent's handshake listener and publish `{id, host, port,
//!    digest, cookie}`; exit non-zero if the parent rejects.
//! 3. Keep the handshake stream as the heartbeat link.
//! 4. Build the per-worker state, exactly once.
//! 5. Serve connections until the heartbeat link ends — deliberately
//!    (shutdown cascade, exit 0) or by loss (exit 2).
//!
//! Within a connection, requests are processed strictly in arrival order: a
//! slow handler blocks its own connection but never another. Handlers run
//! under a supervision scope whose late failures flow to the service's
//! `on_late_failure` hook.

use std::sync::Arc;

use anyhow::anyhow;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    binary,
    config::Config,
    env::{self, ParentContact, WorkerId},
    error::{Result, WireFailure},
    heartbeat::{self, HeartbeatConfig, LinkOutcome},
    registry::FunctionRegistry,
    runtime::Runtime,
    serializer::Serializer,
    service::{CallContext, LiveConnection, WorkerService},
    supervision::{try_within, Monitor},
    wire::{ClientFrame, Handshake, HandshakeReply, HelloOutcome, RejectReason, ServerFrame, Transport},
};

/// Exit code of a worker that shut down cleanly.
pub const EXIT_CLEAN: i32 = 0;
/// Exit code when the reverse handshake could not be completed.
pub const EXIT_HANDSHAKE_FAILED: i32 = 1;
/// Exit code when the parent heartbeat was lost.
pub const EXIT_HEARTBEAT_LOST: i32 = 2;
/// Exit code when the parent rejected the handshake over a binary
/// mismatch.
pub const EXIT_BINARY_MISMATCH: i32 = 3;
/// Exit code for uncaught user errors and invariant violations.
pub const EXIT_USER_ERROR: i32 = 125;

/// Everything a worker bootstrap needs to know, resolved from the
/// environment for real processes and passed directly for in-process
/// workers.
pub(crate) struct BootContext {
    pub(crate) id: WorkerId,
    pub(crate) parent: Option<ParentContact>,
    pub(crate) heartbeat: HeartbeatConfig,
}

impl BootContext {
    pub(crate) fn from_vars(
        id: WorkerId,
        vars: &[(String, String)],
        config: &Config,
    ) -> Result<Self> {
        let parent = env::parent_contact(vars.iter().map(|(k, v)| (k.as_str(), v.clone()))).ok();
        let heartbeat = env::heartbeat_from_vars(
            vars.iter().map(|(k, v)| (k.as_str(), v.clone())),
            config.heartbeat(),
        )?;
        Ok(Self {
            id,
            parent,
            heartbeat,
        })
    }
}

enum ExitReason {
    Clean,
    HeartbeatLost,
    Fatal,
}

/// Run a worker to completion and return its exit code.
pub(crate) async fn run<S: WorkerService>(runtime: Runtime<S>, boot: BootContext) -> i32 {
    let serializer = runtime.serializer();
    let service = runtime.service();

    // The RPC server socket comes first: its port is part of the
    // handshake.
    let listener = match TcpListener::bind(("0.0.0.0", 0)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("could not bind server socket: {err}");
            return EXIT_HANDSHAKE_FAILED;
        }
    };
    let port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(err) => {
            error!("could not resolve server socket: {err}");
            return EXIT_HANDSHAKE_FAILED;
        }
    };

    let link = match &boot.parent {
        Some(parent) => match reverse_handshake(&boot, parent, port, serializer).await {
            Ok(transport) => Some(transport),
            Err(code) => return code,
        },
        None => {
            // Launched outside the framework: no heartbeat, serve until
            // killed.
            info!(worker = %boot.id, port, "no parent endpoint; serving standalone");
            None
        }
    };

    // The heartbeater runs from the moment the handshake is accepted, so a
    // slow worker-state init cannot starve the link.
    let link_cancel = CancellationToken::new();
    let mut link_task: Option<JoinHandle<LinkOutcome>> = link.map(|transport| {
        tokio::spawn(heartbeat::run_link(
            transport,
            boot.heartbeat,
            link_cancel.clone(),
        ))
    });

    // Per-worker state, exactly once, before any connection is accepted.
    // A parent lost mid-init still takes the worker down on time.
    let (monitor, mut failures) = Monitor::channel();
    let init = try_within(&monitor, |_| service.init_worker_state(&runtime));
    tokio::pin!(init);
    let worker_state = tokio::select! {
        result = &mut init => match result {
            Ok(state) => Arc::new(state),
            Err(err) => {
                error!("init_worker_state failed: {err:#}");
                // Drop the link without announcing a shutdown: the parent
                // classifies this death from the exit code.
                if let Some(task) = link_task.take() {
                    task.abort();
                }
                return EXIT_USER_ERROR;
            }
        },
        outcome = wait_link(&mut link_task) => {
            return match outcome {
                LinkOutcome::Shutdown | LinkOutcome::Closed => EXIT_CLEAN,
                LinkOutcome::Lost | LinkOutcome::Ended => {
                    warn!(worker = %boot.id, "parent heartbeat lost during bootstrap");
                    EXIT_HEARTBEAT_LOST
                }
            };
        }
    };

    {
        let service = service.clone();
        let worker_state = worker_state.clone();
        tokio::spawn(async move {
            while let Some(failure) = failures.recv().await {
                service.on_late_failure(&worker_state, failure).await;
            }
        });
    }

    let registry = Arc::new(FunctionRegistry::<S>::collect(serializer));
    info!(worker = %boot.id, port, functions = registry.len(), "worker serving");

    let conn_cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<WireFailure>();

    let reason = loop {
        tokio::select! {
            outcome = wait_link(&mut link_task) => break match outcome {
                LinkOutcome::Shutdown | LinkOutcome::Closed => ExitReason::Clean,
                LinkOutcome::Lost | LinkOutcome::Ended => {
                    warn!(worker = %boot.id, "parent heartbeat lost");
                    ExitReason::HeartbeatLost
                }
            },
            Some(failure) = fatal_rx.recv() => {
                error!(worker = %boot.id, "fatal protocol error: {failure}");
                break ExitReason::Fatal;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    let args = ServeArgs {
                        runtime: runtime.clone(),
                        service: service.clone(),
                        worker_state: worker_state.clone(),
                        registry: registry.clone(),
                        monitor: monitor.clone(),
                        fatal: fatal_tx.clone(),
                        serializer,
                        port,
                        cancel: conn_cancel.child_token(),
                    };
                    tracker.spawn(serve_connection(args, stream));
                }
                Err(err) => warn!("accept failed: {err}"),
            }
        }
    };

    // Shutdown cascade. Failures along the way are logged, never fatal to
    // the remaining steps.
    drop(listener);
    conn_cancel.cancel();
    tracker.close();
    let grace = runtime.config().close_grace();
    if timeout(grace, tracker.wait()).await.is_err() {
        warn!(
            worker = %boot.id,
            "connections did not drain within the close grace period"
        );
    }
    drop(worker_state);
    match reason {
        // A clean exit announces itself on the link so the parent does not
        // classify the silence that follows as a failure.
        ExitReason::Clean => {
            link_cancel.cancel();
            if let Some(task) = link_task.take() {
                let _ = timeout(grace, task).await;
            }
        }
        // Failed exits just drop the link; the parent classifies the death
        // from the process exit code.
        _ => {
            if let Some(task) = link_task.take() {
                task.abort();
            }
        }
    }

    match reason {
        ExitReason::Clean => {
            info!(worker = %boot.id, "worker shut down cleanly");
            EXIT_CLEAN
        }
        ExitReason::HeartbeatLost => EXIT_HEARTBEAT_LOST,
        ExitReason::Fatal => EXIT_USER_ERROR,
    }
}

/// Dial the parent and publish this worker's address and identity.
async fn reverse_handshake(
    boot: &BootContext,
    parent: &ParentContact,
    port: u16,
    serializer: Serializer,
) -> std::result::Result<Transport<TcpStream>, i32> {
    let stream = match TcpStream::connect(&parent.addr).await {
        Ok(stream) => stream,
        Err(err) => {
            error!(parent = %parent.addr, "could not dial parent: {err}");
            return Err(EXIT_HANDSHAKE_FAILED);
        }
    };
    let _ = stream.set_nodelay(true);
    // The address this worker used to reach its parent is the address the
    // parent (and its peers) can reach the worker back on.
    let host = stream
        .local_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string());

    let digest = match binary::digest() {
        Ok(digest) => digest,
        Err(err) => {
            error!("could not hash own executable: {err}");
            return Err(EXIT_HANDSHAKE_FAILED);
        }
    };

    let mut transport = Transport::new(stream, serializer);
    let frame = Handshake {
        worker_id: boot.id.clone(),
        host,
        port,
        binary_md5: digest.0,
        cookie: parent.cookie.clone(),
    };
    if let Err(err) = transport.send(&frame).await {
        error!("could not send handshake: {err:#}");
        return Err(EXIT_HANDSHAKE_FAILED);
    }

    match transport.recv::<HandshakeReply>().await {
        Ok(Some(HandshakeReply::Accepted)) => Ok(transport),
        Ok(Some(HandshakeReply::Rejected {
            reason: RejectReason::BinaryMismatch { .. },
        })) => {
            error!("parent rejected handshake: binary mismatch");
            Err(EXIT_BINARY_MISMATCH)
        }
        Ok(Some(HandshakeReply::Rejected { reason })) => {
            error!("parent rejected handshake: {reason:?}");
            Err(EXIT_HANDSHAKE_FAILED)
        }
        Ok(None) => {
            error!("parent closed the handshake stream");
            Err(EXIT_HANDSHAKE_FAILED)
        }
        Err(err) => {
            error!("handshake reply failed: {err:#}");
            Err(EXIT_HANDSHAKE_FAILED)
        }
    }
}

/// Resolve the heartbeat link outcome; a worker without a parent waits
/// forever.
async fn wait_link(task: &mut Option<JoinHandle<LinkOutcome>>) -> LinkOutcome {
    let outcome = match task.as_mut() {
        Some(handle) => handle.await.unwrap_or(LinkOutcome::Lost),
        None => return std::future::pending().await,
    };
    *task = None;
    outcome
}

struct ServeArgs<S: WorkerService> {
    runtime: Runtime<S>,
    service: Arc<S>,
    worker_state: Arc<S::WorkerState>,
    registry: Arc<FunctionRegistry<S>>,
    monitor: Monitor,
    fatal: mpsc::UnboundedSender<WireFailure>,
    serializer: Serializer,
    port: u16,
    cancel: CancellationToken,
}

/// Serve one connection: hello, per-connection state, then requests in
/// arrival order until goodbye, disconnect, or quiesce.
async fn serve_connection<S: WorkerService>(args: ServeArgs<S>, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    let mut transport = Transport::new(stream, args.serializer);

    match transport.recv::<ClientFrame>().await {
        Ok(Some(ClientFrame::Hello)) => {}
        Ok(other) => {
            debug!(?other, "connection closed before hello");
            return;
        }
        Err(err) => {
            debug!("connection failed before hello: {err:#}");
            return;
        }
    }

    let conn = Arc::new(LiveConnection::<S>::new(args.worker_state.clone(), args.port));
    let init = try_within(&args.monitor, |_| {
        args.service.init_connection_state(&args.worker_state)
    })
    .await;
    match init {
        Ok(state) => {
            conn.state
                .set(state)
                .expect("fresh connection slot already populated");
            if transport
                .send(&ServerFrame::HelloAck(HelloOutcome::Accepted))
                .await
                .is_err()
            {
                // The peer vanished between hello and ack; the state was
                // created, so teardown still owes it a close.
                teardown(&args, &conn).await;
                return;
            }
        }
        Err(err) => {
            let refusal = HelloOutcome::Refused(WireFailure::ConnInit(format!("{err:#}")));
            let _ = transport.send(&ServerFrame::HelloAck(refusal)).await;
            return;
        }
    }

    loop {
        tokio::select! {
            _ = args.cancel.cancelled() => break,
            frame = transport.recv::<ClientFrame>() => match frame {
                Ok(Some(ClientFrame::Request { query_id, method, payload })) => {
                    let outcome = handle_request(&args, &conn, &method, payload).await;
                    if let Err(WireFailure::UnknownMethod(_)) = &outcome {
                        // Programming error: raise to the monitor and crash
                        // the worker once the response is on the wire.
                        let failure = WireFailure::UnknownMethod(method.clone());
                        args.monitor.report(anyhow!(failure.clone()));
                        let _ = args.fatal.send(failure);
                    }
                    let response = ServerFrame::Response { query_id, outcome: outcome.into() };
                    if transport.send(&response).await.is_err() {
                        break;
                    }
                }
                Ok(Some(ClientFrame::Goodbye)) | Ok(None) => break,
                Ok(Some(ClientFrame::Hello)) => {
                    debug!("duplicate hello; closing connection");
                    break;
                }
                Err(err) => {
                    debug!("connection failed: {err:#}");
                    break;
                }
            }
        }
    }

    teardown(&args, &conn).await;
}

async fn handle_request<S: WorkerService>(
    args: &ServeArgs<S>,
    conn: &Arc<LiveConnection<S>>,
    method: &str,
    payload: Vec<u8>,
) -> std::result::Result<Vec<u8>, WireFailure> {
    let handled = try_within(&args.monitor, |scope| {
        let ctx = CallContext {
            runtime: args.runtime.clone(),
            conn: conn.clone(),
            scope,
        };
        let dispatched = args.registry.dispatch(method, ctx, payload);
        async move {
            match dispatched {
                Ok(call) => Ok(call.await),
                Err(failure) => Ok(Err(failure)),
            }
        }
    })
    .await;

    match handled {
        Ok(outcome) => outcome,
        // A supervision-scope failure that beat the handler to the result.
        Err(err) => Err(WireFailure::Handler(format!("{err:#}"))),
    }
}

async fn teardown<S: WorkerService>(args: &ServeArgs<S>, conn: &Arc<LiveConnection<S>>) {
    if let Some(state) = conn.state.get() {
        args.service
            .on_connection_close(state, &args.worker_state)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::{config::Config, env::Role, wire::Heartbeat};

    struct Sleeper;

    #[async_trait]
    impl WorkerService for Sleeper {
        type WorkerState = ();
        type ConnectionState = ();

        async fn init_worker_state(&self, _runtime: &Runtime<Self>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn init_connection_state(&self, _worker_state: &Arc<()>) -> anyhow::Result<()> {
            Ok(())
        }

        fn functions(_registry: &mut FunctionRegistry<Self>) {}
    }

    /// Pose as a parent: accept the reverse handshake and hand the link
    /// back to the test.
    async fn accept_as_parent(
        listener: TcpListener,
        serializer: Serializer,
    ) -> Transport<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = Transport::new(stream, serializer);
        let handshake: Handshake = transport.recv().await.unwrap().unwrap();
        assert_eq!(handshake.cookie, "test-cookie");
        transport.send(&HandshakeReply::Accepted).await.unwrap();
        transport
    }

    fn boot(id: &str, parent_addr: String, heartbeat: HeartbeatConfig) -> BootContext {
        BootContext {
            id: WorkerId::new(id),
            parent: Some(ParentContact {
                addr: parent_addr,
                cookie: "test-cookie".to_string(),
            }),
            heartbeat,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parent_death_shuts_the_worker_down_within_two_timeouts() {
        let config = Config::default();
        let runtime = Runtime::new(Sleeper, config.clone(), Role::Worker(WorkerId::new("w0")));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let parent_addr = listener.local_addr().unwrap().to_string();

        let heartbeat = HeartbeatConfig::from_millis(100, 500);
        let worker = tokio::spawn(run(runtime, boot("w0", parent_addr, heartbeat)));

        let link = accept_as_parent(listener, Serializer::Postcard).await;
        // Parent dies without a word.
        drop(link);

        let code = timeout(Duration::from_millis(1_100), worker)
            .await
            .expect("worker should exit within 2x heartbeat timeout")
            .unwrap();
        assert_eq!(code, EXIT_HEARTBEAT_LOST);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn deliberate_shutdown_exits_clean() {
        let config = Config::default();
        let runtime = Runtime::new(Sleeper, config.clone(), Role::Worker(WorkerId::new("w0")));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let parent_addr = listener.local_addr().unwrap().to_string();

        let heartbeat = HeartbeatConfig::from_millis(50, 2_000);
        let worker = tokio::spawn(run(runtime, boot("w0", parent_addr, heartbeat)));

        let mut link = accept_as_parent(listener, Serializer::Postcard).await;
        link.send(&Heartbeat {
            kind: crate::wire::HeartbeatKind::Shutdown,
            seq: 0,
        })
        .await
        .unwrap();

        let code = timeout(Duration::from_secs(2), worker)
            .await
            .expect("worker should exit promptly")
            .unwrap();
        assert_eq!(code, EXIT_CLEAN);
    }

    #[tokio::test]
    async fn rejected_handshake_maps_to_exit_codes() {
        let config = Config::default();
        let runtime = Runtime::new(Sleeper, config.clone(), Role::Worker(WorkerId::new("w0")));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let parent_addr = listener.local_addr().unwrap().to_string();

        let worker = tokio::spawn(run(
            runtime,
            boot("w0", parent_addr, HeartbeatConfig::from_millis(50, 500)),
        ));

        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = Transport::new(stream, Serializer::Postcard);
        let _: Handshake = transport.recv().await.unwrap().unwrap();
        transport
            .send(&HandshakeReply::Rejected {
                reason: RejectReason::BinaryMismatch {
                    expected: [1; 16],
                    actual: [2; 16],
                },
            })
            .await
            .unwrap();

        let code = timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
        assert_eq!(code, EXIT_BINARY_MISMATCH);
    }
}
