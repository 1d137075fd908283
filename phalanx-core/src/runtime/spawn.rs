//! The spawn engine: launching workers and supervising them.
//!
//! A spawn has three legs:
//!
//! 1. **Launch** — exec this executable locally, run it through a
//!    remote-shell command, or start the worker bootstrap as a task inside
//!    this process (the in-process target, used by tests and single-process
//!    runs).
//! 2. **Reverse handshake** — a one-shot TCP listener, whose address the
//!    child learns from its environment, accepts the child's
//!    `{id, host, port, digest, cookie}` frame. Cookie and binary digest are
//!    verified before the child is acknowledged; any failure kills the
//!    child and surfaces as `SpawnFailed`.
//! 3. **Supervision** — the handshake stream becomes the heartbeat link. A
//!    supervisor task drives the parent end of the link, reaps the process,
//!    and fires the worker's `on_failure` callback exactly once if the
//!    worker dies after its handshake.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    process::{Child, Command},
    sync::watch,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    binary,
    connection::Connection,
    env::{self, ParentContact, WorkerId},
    error::{Error, Result},
    heartbeat::{self, HeartbeatConfig, LinkOutcome},
    runtime::{
        registry::{ExitStatus, FailureCallback, WorkerAddress, WorkerRecord},
        worker::{self, BootContext},
        Runtime,
    },
    service::WorkerService,
    wire::{Handshake, HandshakeReply, RejectReason, Transport},
};

/// Where and how a worker process is launched.
pub enum SpawnTarget {
    /// Exec the current executable on this host.
    Local,
    /// Run the current executable through a remote-shell command such as
    /// `["ssh", "build-07"]`. The environment is passed inline via `env(1)`
    /// on the remote side.
    Remote {
        command: Vec<String>,
        /// Path of the executable on the remote host; defaults to this
        /// process's own path.
        binary_path: Option<PathBuf>,
    },
    /// Run the full worker bootstrap — loopback handshake, heartbeat and
    /// all — as a task inside the current process.
    InProcess,
}

/// Where a worker's stdout or stderr goes.
pub enum Redirection {
    DevNull,
    FileAppend(PathBuf),
    FileTruncate(PathBuf),
}

impl Redirection {
    fn open(&self) -> std::io::Result<Stdio> {
        match self {
            Self::DevNull => Ok(Stdio::null()),
            Self::FileAppend(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                Ok(file.into())
            }
            Self::FileTruncate(path) => Ok(std::fs::File::create(path)?.into()),
        }
    }
}

/// Everything a spawn is parameterized by.
pub struct SpawnOptions {
    pub target: SpawnTarget,
    pub stdout: Redirection,
    pub stderr: Redirection,
    /// Extra environment pairs for the child. May not override reserved
    /// keys.
    pub extra_env: Vec<(String, String)>,
    /// Host the child should dial back to; defaults to loopback. Required
    /// for remote targets where loopback would point at the wrong machine.
    pub advertise_host: Option<String>,
    /// Heartbeat parameterization for this worker's link; defaults to the
    /// runtime configuration.
    pub heartbeat: Option<HeartbeatConfig>,
    /// Invoked exactly once if the worker fails after its handshake
    /// succeeded. Never invoked for spawns that return an error.
    pub on_failure: Option<FailureCallback>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            target: SpawnTarget::Local,
            stdout: Redirection::DevNull,
            stderr: Redirection::DevNull,
            extra_env: Vec::new(),
            advertise_host: None,
            heartbeat: None,
            on_failure: None,
        }
    }
}

impl SpawnOptions {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn in_process() -> Self {
        Self {
            target: SpawnTarget::InProcess,
            ..Self::default()
        }
    }

    pub fn remote(command: Vec<String>) -> Self {
        Self {
            target: SpawnTarget::Remote {
                command,
                binary_path: None,
            },
            ..Self::default()
        }
    }

    pub fn heartbeat(mut self, config: HeartbeatConfig) -> Self {
        self.heartbeat = Some(config);
        self
    }

    pub fn on_failure(mut self, callback: impl FnOnce(Error) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }
}

/// A launched-but-not-yet-handshaken worker.
enum Launched {
    Process(Child),
    InProcess(JoinHandle<i32>),
}

impl Launched {
    /// Wait for the worker to finish; `None` means killed by signal (or
    /// aborted, for in-process workers).
    async fn wait(&mut self) -> Option<i32> {
        match self {
            Self::Process(child) => match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!("could not reap worker process: {err}");
                    None
                }
            },
            Self::InProcess(handle) => match handle.await {
                Ok(code) => Some(code),
                Err(_) => None,
            },
        }
    }

    async fn kill(&mut self) {
        match self {
            Self::Process(child) => {
                if let Err(err) = child.kill().await {
                    debug!("kill failed (worker likely already dead): {err}");
                }
            }
            Self::InProcess(handle) => handle.abort(),
        }
    }
}

impl<S: WorkerService> Runtime<S> {
    /// Launch a worker and wait for its reverse handshake.
    ///
    /// On success the worker is installed in the registry and a handle to
    /// it is returned. On any failure before the handshake completes the
    /// child is killed and `SpawnFailed` is returned; the `on_failure`
    /// callback is not invoked for such spawns.
    #[instrument(skip(self, options), fields(role = %self.role()), level = "debug")]
    pub async fn spawn(&self, options: SpawnOptions) -> Result<WorkerHandle<S>> {
        let id = self.next_child_id();
        let cookie = Uuid::new_v4().to_string();
        let heartbeat = options
            .heartbeat
            .unwrap_or_else(|| self.config().heartbeat());

        let bind_addr = match options.target {
            SpawnTarget::Remote { .. } => "0.0.0.0:0",
            _ => "127.0.0.1:0",
        };
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|err| Error::spawn_failed(format!("handshake listener: {err}")))?;
        let port = listener
            .local_addr()
            .map_err(|err| Error::spawn_failed(format!("handshake listener: {err}")))?
            .port();
        let host = options
            .advertise_host
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let parent_addr = format!("{host}:{port}");

        let child_env = env::child_env(
            &id,
            &parent_addr,
            &cookie,
            heartbeat,
            self.config().serializer,
            &options.extra_env,
        )?;
        let mut launched = self
            .launch(&options, &id, child_env, heartbeat, &parent_addr, &cookie)
            .await?;

        let accepted = tokio::select! {
            accepted = accept_handshake(
                &listener,
                self.serializer(),
                &cookie,
                &id,
                self.config().skip_binary_check,
            ) => accepted,
            code = launched.wait() => Err(Error::spawn_failed(format!(
                "worker exited before handshake (code {code:?})"
            ))),
            _ = tokio::time::sleep(self.config().spawn_timeout()) => {
                Err(Error::spawn_failed("timed out waiting for reverse handshake"))
            }
        };
        let (transport, handshake) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                launched.kill().await;
                return Err(err);
            }
        };

        info!(worker = %id, address = %format!("{}:{}", handshake.host, handshake.port), "worker handshake accepted");

        let (exit_tx, exit_rx) = watch::channel::<ExitStatus>(None);
        let record = Arc::new(WorkerRecord {
            id: id.clone(),
            address: WorkerAddress {
                host: handshake.host,
                port: handshake.port,
            },
            on_failure: Mutex::new(options.on_failure),
            closed: AtomicBool::new(false),
            link_cancel: CancellationToken::new(),
            kill: CancellationToken::new(),
            exit: exit_rx,
        });
        self.workers().insert(record.clone());

        tokio::spawn(supervise(
            self.clone(),
            record.clone(),
            launched,
            transport,
            heartbeat,
            exit_tx,
        ));

        Ok(WorkerHandle {
            runtime: self.clone(),
            record,
        })
    }

    async fn launch(
        &self,
        options: &SpawnOptions,
        id: &WorkerId,
        child_env: Vec<(String, String)>,
        heartbeat: HeartbeatConfig,
        parent_addr: &str,
        cookie: &str,
    ) -> Result<Launched> {
        match &options.target {
            SpawnTarget::Local => {
                let exe = binary::locate()?;
                let mut command = Command::new(exe);
                command
                    .envs(child_env)
                    .stdin(Stdio::null())
                    .stdout(redirection(&options.stdout)?)
                    .stderr(redirection(&options.stderr)?)
                    .kill_on_drop(true);
                let child = command
                    .spawn()
                    .map_err(|err| Error::spawn_failed(format!("exec failed: {err}")))?;
                Ok(Launched::Process(child))
            }
            SpawnTarget::Remote {
                command: remote,
                binary_path,
            } => {
                let program = remote
                    .first()
                    .ok_or_else(|| Error::spawn_failed("empty remote command"))?;
                let binary = match binary_path {
                    Some(path) => path.clone(),
                    None => binary::locate()?,
                };
                let mut command = Command::new(program);
                command.args(&remote[1..]).arg("env");
                for (key, value) in &child_env {
                    command.arg(format!("{key}={value}"));
                }
                command
                    .arg(binary)
                    .stdin(Stdio::null())
                    .stdout(redirection(&options.stdout)?)
                    .stderr(redirection(&options.stderr)?)
                    .kill_on_drop(true);
                let child = command
                    .spawn()
                    .map_err(|err| Error::spawn_failed(format!("remote command failed: {err}")))?;
                Ok(Launched::Process(child))
            }
            SpawnTarget::InProcess => {
                let child_runtime = self.child_runtime(id.clone());
                let boot = BootContext {
                    id: id.clone(),
                    parent: Some(ParentContact {
                        addr: parent_addr.to_string(),
                        cookie: cookie.to_string(),
                    }),
                    heartbeat,
                };
                Ok(Launched::InProcess(tokio::spawn(worker::run(
                    child_runtime,
                    boot,
                ))))
            }
        }
    }
}

fn redirection(redirection: &Redirection) -> Result<Stdio> {
    redirection
        .open()
        .map_err(|err| Error::spawn_failed(format!("redirection failed: {err}")))
}

async fn accept_handshake(
    listener: &TcpListener,
    serializer: crate::serializer::Serializer,
    cookie: &str,
    id: &WorkerId,
    skip_binary_check: bool,
) -> Result<(Transport<TcpStream>, Handshake)> {
    let (stream, peer) = listener
        .accept()
        .await
        .map_err(|err| Error::spawn_failed(format!("handshake accept: {err}")))?;
    debug!(%peer, "reverse handshake connection");
    let transport = Transport::new(stream, serializer);
    complete_handshake(transport, cookie, id, skip_binary_check).await
}

/// Verify a reverse handshake and acknowledge it.
///
/// Rejections are answered on the wire before the error is returned, so the
/// child learns why it is being turned away and can pick its exit code.
async fn complete_handshake<T>(
    mut transport: Transport<T>,
    cookie: &str,
    id: &WorkerId,
    skip_binary_check: bool,
) -> Result<(Transport<T>, Handshake)>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let handshake: Handshake = transport
        .recv()
        .await
        .map_err(|err| Error::spawn_failed(format!("handshake frame: {err:#}")))?
        .ok_or_else(|| Error::spawn_failed("handshake stream ended"))?;

    if handshake.cookie != cookie {
        let reply = HandshakeReply::Rejected {
            reason: RejectReason::BadCookie,
        };
        let _ = transport.send(&reply).await;
        return Err(Error::spawn_failed("handshake cookie mismatch"));
    }

    if handshake.worker_id != *id {
        let reply = HandshakeReply::Rejected {
            reason: RejectReason::Other(format!(
                "expected worker {id}, got {}",
                handshake.worker_id
            )),
        };
        let _ = transport.send(&reply).await;
        return Err(Error::spawn_failed("handshake worker id mismatch"));
    }

    if !skip_binary_check {
        let expected = binary::digest()?;
        if handshake.binary_md5 != expected.0 {
            let reply = HandshakeReply::Rejected {
                reason: RejectReason::BinaryMismatch {
                    expected: expected.0,
                    actual: handshake.binary_md5,
                },
            };
            let _ = transport.send(&reply).await;
            return Err(Error::spawn_failed(Error::BinaryMismatch {
                expected,
                actual: crate::binary::BinaryDigest(handshake.binary_md5),
            }));
        }
    }

    transport
        .send(&HandshakeReply::Accepted)
        .await
        .map_err(|err| Error::spawn_failed(format!("handshake ack: {err:#}")))?;
    Ok((transport, handshake))
}

/// The parent end of one worker's life: heartbeat link, process reaping,
/// failure classification.
async fn supervise<S: WorkerService>(
    runtime: Runtime<S>,
    record: Arc<WorkerRecord>,
    mut launched: Launched,
    transport: Transport<TcpStream>,
    heartbeat: HeartbeatConfig,
    exit_tx: watch::Sender<ExitStatus>,
) {
    enum Event {
        Link(LinkOutcome),
        Exited(Option<i32>),
        Kill,
    }

    let link = heartbeat::run_link(transport, heartbeat, record.link_cancel.clone());
    tokio::pin!(link);

    let event = tokio::select! {
        outcome = &mut link => Event::Link(outcome),
        code = launched.wait() => Event::Exited(code),
        _ = record.kill.cancelled() => Event::Kill,
    };

    let code = match event {
        Event::Exited(code) => {
            if !record.closed.load(Ordering::Acquire) {
                record.fire_on_failure(Error::WorkerDied {
                    id: record.id.clone(),
                    code,
                });
            }
            code
        }
        Event::Link(outcome) => match outcome {
            LinkOutcome::Lost => {
                // The stream is still open but silent: the worker is hung,
                // not dead. Report the loss, then make sure it dies.
                if !record.closed.load(Ordering::Acquire) {
                    warn!(worker = %record.id, "heartbeat lost");
                    record.fire_on_failure(Error::HeartbeatLost);
                }
                reap(&mut launched, runtime.config().close_grace()).await
            }
            LinkOutcome::Ended => {
                // The stream ended without a shutdown announcement: the
                // worker process died. Classify by its exit code.
                let code = reap(&mut launched, runtime.config().close_grace()).await;
                if !record.closed.load(Ordering::Acquire) {
                    record.fire_on_failure(Error::WorkerDied {
                        id: record.id.clone(),
                        code,
                    });
                }
                code
            }
            LinkOutcome::Shutdown => {
                debug!(worker = %record.id, "worker announced shutdown");
                reap(&mut launched, runtime.config().close_grace()).await
            }
            LinkOutcome::Closed => {
                debug!(worker = %record.id, "heartbeat link closed");
                reap(&mut launched, runtime.config().close_grace()).await
            }
        },
        Event::Kill => {
            launched.kill().await;
            launched.wait().await
        }
    };

    let _ = exit_tx.send(Some(code));
    runtime.remove_worker(&record.id);
}

/// Give the worker a grace window to exit on its own, then kill it.
async fn reap(launched: &mut Launched, grace: std::time::Duration) -> Option<i32> {
    match timeout(grace, launched.wait()).await {
        Ok(code) => code,
        Err(_) => {
            warn!("worker did not exit within the grace period; killing");
            launched.kill().await;
            launched.wait().await
        }
    }
}

/// Master-side handle for a spawned worker.
pub struct WorkerHandle<S: WorkerService> {
    runtime: Runtime<S>,
    record: Arc<WorkerRecord>,
}

impl<S: WorkerService> Clone for WorkerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            record: self.record.clone(),
        }
    }
}

impl<S: WorkerService> std::fmt::Debug for WorkerHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.record.id)
            .finish()
    }
}

impl<S: WorkerService> WorkerHandle<S> {
    pub(crate) fn from_parts(runtime: Runtime<S>, record: Arc<WorkerRecord>) -> Self {
        Self { runtime, record }
    }

    pub fn id(&self) -> &WorkerId {
        &self.record.id
    }

    pub fn address(&self) -> &WorkerAddress {
        &self.record.address
    }

    /// Open an RPC connection to this worker.
    ///
    /// The worker runs `init_connection_state` before the connection is
    /// acknowledged.
    pub async fn client(&self) -> Result<Connection> {
        Connection::connect(
            &self.record.address.to_string(),
            self.runtime.serializer(),
            self.runtime.config().close_grace(),
        )
        .await
    }

    /// Tell the worker to run its shutdown cascade and wait for it to
    /// exit.
    ///
    /// Idempotent: a second call is a no-op returning success. A worker
    /// that ignores the request past the grace window is killed.
    pub async fn close_server(&self) -> Result<()> {
        if self.record.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.record.link_cancel.cancel();
        let grace = self.runtime.config().close_grace();
        if timeout(grace * 2, self.record.wait_exit()).await.is_err() {
            warn!(worker = %self.record.id, "worker ignored shutdown; killing");
            self.record.kill.cancel();
            let _ = timeout(grace, self.record.wait_exit()).await;
        }
        self.runtime.remove_worker(&self.record.id);
        Ok(())
    }

    /// Wait for the worker process to finish and return its exit code, if
    /// one is known.
    pub async fn wait_exit(&self) -> Option<i32> {
        self.record.wait_exit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::Serializer;

    fn transports() -> (
        Transport<tokio::io::DuplexStream>,
        Transport<tokio::io::DuplexStream>,
    ) {
        let (left, right) = tokio::io::duplex(4096);
        (
            Transport::new(left, Serializer::Postcard),
            Transport::new(right, Serializer::Postcard),
        )
    }

    fn handshake_frame(cookie: &str) -> Handshake {
        Handshake {
            worker_id: WorkerId::new("w0"),
            host: "127.0.0.1".to_string(),
            port: 9,
            binary_md5: binary::digest().unwrap().0,
            cookie: cookie.to_string(),
        }
    }

    #[tokio::test]
    async fn valid_handshake_is_accepted() {
        let (mut child, parent) = transports();
        let id = WorkerId::new("w0");

        // Stage the frame the way a bootstrapping worker would; the duplex
        // buffer absorbs it before the parent starts reading.
        child.send(&handshake_frame("cookie")).await.unwrap();

        let (_, received) = complete_handshake(parent, "cookie", &id, false)
            .await
            .unwrap();
        assert_eq!(received.worker_id, WorkerId::new("w0"));
        let reply: HandshakeReply = child.recv().await.unwrap().unwrap();
        assert_eq!(reply, HandshakeReply::Accepted);
    }

    #[tokio::test]
    async fn binary_mismatch_is_rejected() {
        let (mut child, parent) = transports();
        let id = WorkerId::new("w0");

        let mut frame = handshake_frame("cookie");
        frame.binary_md5 = [0; 16];
        child.send(&frame).await.unwrap();

        let err = complete_handshake(parent, "cookie", &id, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SpawnFailed { ref reason } if reason.contains("binary mismatch")));
        let reply: HandshakeReply = child.recv().await.unwrap().unwrap();
        assert!(matches!(
            reply,
            HandshakeReply::Rejected {
                reason: RejectReason::BinaryMismatch { .. }
            }
        ));
    }

    #[tokio::test]
    async fn mismatched_binaries_pass_when_check_disabled() {
        let (mut child, parent) = transports();
        let id = WorkerId::new("w0");

        let mut frame = handshake_frame("cookie");
        frame.binary_md5 = [0; 16];
        child.send(&frame).await.unwrap();

        assert!(complete_handshake(parent, "cookie", &id, true).await.is_ok());
    }

    #[tokio::test]
    async fn wrong_cookie_is_rejected() {
        let (mut child, parent) = transports();
        let id = WorkerId::new("w0");

        child.send(&handshake_frame("stolen")).await.unwrap();

        let err = complete_handshake(parent, "cookie", &id, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SpawnFailed { ref reason } if reason.contains("cookie")));
        let reply: HandshakeReply = child.recv().await.unwrap().unwrap();
        assert_eq!(
            reply,
            HandshakeReply::Rejected {
                reason: RejectReason::BadCookie
            }
        );
    }
}
