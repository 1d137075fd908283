//! Client connections to worker servers.
//!
//! A [`Connection`] is the caller's end of the RPC protocol: it dials a
//! worker's address, performs the hello handshake (which runs the worker's
//! `init_connection_state` before acknowledging), and then multiplexes typed
//! calls over the stream.
//!
//! Requests dispatched from the same caller retain their order on the wire:
//! all writes funnel through a single writer task fed by an in-order
//! channel. Responses are demultiplexed by query id, so callers may have any
//! number of calls outstanding.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::anyhow;
use dashmap::DashMap;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex, Notify},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, instrument, warn};

use crate::{
    error::{Error, Result, RpcErrorKind, WireFailure},
    serializer::Serializer,
    service::RpcFunction,
    wire::{ClientFrame, HelloOutcome, ServerFrame, Transport},
};

type PendingMap = Arc<DashMap<u64, oneshot::Sender<std::result::Result<Vec<u8>, RpcErrorKind>>>>;

/// A live RPC connection to a worker server.
///
/// Dropping the connection tears it down immediately; prefer
/// [`close`](Connection::close) to flush outstanding calls and trigger the
/// worker's connection teardown hook.
pub struct Connection {
    serializer: Serializer,
    close_grace: Duration,
    writer_tx: mpsc::UnboundedSender<ClientFrame>,
    pending: PendingMap,
    next_query: AtomicU64,
    closed: Arc<AtomicBool>,
    drained: Arc<Notify>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Dial `addr` and perform the hello handshake.
    ///
    /// By the time this returns, the worker has run
    /// `init_connection_state` for this connection and populated its
    /// write-once state slot.
    #[instrument(skip(serializer, close_grace), level = "debug")]
    pub(crate) async fn connect(
        addr: &str,
        serializer: Serializer,
        close_grace: Duration,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| Error::ConnectFailed(err.into()))?;
        let _ = stream.set_nodelay(true);
        let mut transport = Transport::new(stream, serializer);

        transport
            .send(&ClientFrame::Hello)
            .await
            .map_err(Error::ConnectFailed)?;
        match transport
            .recv::<ServerFrame>()
            .await
            .map_err(Error::ConnectFailed)?
        {
            Some(ServerFrame::HelloAck(HelloOutcome::Accepted)) => {}
            Some(ServerFrame::HelloAck(HelloOutcome::Refused(WireFailure::ConnInit(msg)))) => {
                return Err(Error::InitConnStateFailed(msg));
            }
            Some(ServerFrame::HelloAck(HelloOutcome::Refused(failure))) => {
                return Err(Error::ConnectFailed(anyhow!(failure)));
            }
            other => {
                return Err(Error::ConnectFailed(anyhow!(
                    "unexpected handshake reply: {other:?}"
                )));
            }
        }

        let (mut write_half, mut read_half) = transport.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let pending: PendingMap = Arc::new(DashMap::new());
        let drained = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if let Err(err) = write_half.send(&frame).await {
                    debug!("connection writer stopped: {err:#}");
                    break;
                }
            }
            let _ = write_half.flush().await;
        });

        let reader = {
            let pending = pending.clone();
            let drained = drained.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    match read_half.recv::<ServerFrame>().await {
                        Ok(Some(ServerFrame::Response { query_id, outcome })) => {
                            if let Some((_, waiter)) = pending.remove(&query_id) {
                                let _ =
                                    waiter.send(outcome.into_result().map_err(RpcErrorKind::Remote));
                            } else {
                                warn!(query_id, "response for unknown query");
                            }
                            if pending.is_empty() {
                                drained.notify_waiters();
                            }
                        }
                        Ok(Some(frame)) => {
                            warn!(?frame, "unexpected frame on established connection");
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                // Mark the connection closed before the sweep so a racing
                // `run` either sees the flag or has its entry drained here.
                closed.store(true, Ordering::Release);
                let waiters: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
                for query_id in waiters {
                    if let Some((_, waiter)) = pending.remove(&query_id) {
                        let _ = waiter.send(Err(RpcErrorKind::ConnectionClosed));
                    }
                }
                drained.notify_waiters();
            })
        };

        Ok(Self {
            serializer,
            close_grace,
            writer_tx,
            pending,
            next_query: AtomicU64::new(0),
            closed,
            drained,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Issue a typed call and await its result.
    ///
    /// Calls dispatched sequentially from the same caller reach the server
    /// in dispatch order.
    pub async fn run<F: RpcFunction>(&self, input: F::Input) -> Result<F::Output> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Rpc(RpcErrorKind::ConnectionClosed));
        }

        let payload = self
            .serializer
            .to_bytes(&input)
            .map_err(|err| Error::Rpc(RpcErrorKind::Codec(format!("{err:#}"))))?;
        let query_id = self.next_query.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(query_id, tx);

        let frame = ClientFrame::Request {
            query_id,
            method: F::NAME.to_string(),
            payload,
        };
        if self.writer_tx.send(frame).is_err() {
            self.pending.remove(&query_id);
            return Err(Error::Rpc(RpcErrorKind::ConnectionClosed));
        }
        // The reader may have exited between the entry check and the
        // insert; its drain sweep and this re-check overlap, so one of the
        // two resolves the waiter.
        if self.closed.load(Ordering::Acquire) {
            if let Some((_, waiter)) = self.pending.remove(&query_id) {
                let _ = waiter.send(Err(RpcErrorKind::ConnectionClosed));
            }
        }

        let outcome = rx
            .await
            .map_err(|_| Error::Rpc(RpcErrorKind::ConnectionClosed))?;
        let bytes = outcome.map_err(Error::Rpc)?;
        self.serializer
            .from_bytes(&bytes)
            .map_err(|err| Error::Rpc(RpcErrorKind::Codec(format!("{err:#}"))))
    }

    /// Whether the connection has been closed, locally or by the peer.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flush outstanding calls (bounded by the close grace period), tell
    /// the server to run connection teardown, and release the connection.
    ///
    /// Idempotent: a second close is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let drain = async {
            loop {
                if self.pending.is_empty() {
                    break;
                }
                let notified = self.drained.notified();
                if self.pending.is_empty() {
                    break;
                }
                notified.await;
            }
        };
        if timeout(self.close_grace, drain).await.is_err() {
            warn!(
                outstanding = self.pending.len(),
                "closing connection with calls still outstanding"
            );
        }

        let _ = self.writer_tx.send(ClientFrame::Goodbye);

        // The server closes the stream after processing the goodbye; wait
        // for the reader to observe that, then stop both tasks.
        if let Some(reader) = self.reader.lock().await.take() {
            let abort = reader.abort_handle();
            if timeout(self.close_grace, reader).await.is_err() {
                debug!("reader did not settle within the close grace period");
                abort.abort();
            }
        }
        if let Some(writer) = self.writer.lock().await.take() {
            writer.abort();
        }

        // Anything still unanswered completes as cancelled.
        let waiters: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for query_id in waiters {
            if let Some((_, waiter)) = self.pending.remove(&query_id) {
                let _ = waiter.send(Err(RpcErrorKind::ConnectionClosed));
            }
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.try_lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            if let Some(handle) = writer.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::wire::CallOutcome;

    struct Echo;
    impl RpcFunction for Echo {
        const NAME: &'static str = "echo";
        type Input = String;
        type Output = String;
    }

    struct Stall;
    impl RpcFunction for Stall {
        const NAME: &'static str = "stall";
        type Input = ();
        type Output = ();
    }

    /// A hand-rolled server speaking just enough of the protocol for the
    /// client side to be exercised in isolation.
    async fn echo_server(listener: TcpListener, serializer: Serializer) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = Transport::new(stream, serializer);

        match transport.recv::<ClientFrame>().await.unwrap() {
            Some(ClientFrame::Hello) => {}
            other => panic!("expected hello, got {other:?}"),
        }
        transport
            .send(&ServerFrame::HelloAck(HelloOutcome::Accepted))
            .await
            .unwrap();

        while let Some(frame) = transport.recv::<ClientFrame>().await.unwrap() {
            match frame {
                ClientFrame::Request {
                    query_id,
                    method,
                    payload,
                } => {
                    let outcome = match method.as_str() {
                        "echo" => CallOutcome::Ok(payload),
                        "stall" => continue,
                        _ => CallOutcome::Err(WireFailure::UnknownMethod(method)),
                    };
                    transport
                        .send(&ServerFrame::Response { query_id, outcome })
                        .await
                        .unwrap();
                }
                ClientFrame::Goodbye => break,
                ClientFrame::Hello => panic!("duplicate hello"),
            }
        }
    }

    async fn connected() -> (Connection, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(echo_server(listener, Serializer::Postcard));
        let conn = Connection::connect(
            &addr.to_string(),
            Serializer::Postcard,
            Duration::from_millis(500),
        )
        .await
        .unwrap();
        (conn, server)
    }

    #[tokio::test]
    async fn round_trip_preserves_payload() {
        let (conn, _server) = connected().await;
        let reply = conn.run::<Echo>("hello".to_string()).await.unwrap();
        assert_eq!(reply, "hello");
    }

    #[tokio::test]
    async fn remote_failure_surfaces_as_rpc_error() {
        struct Missing;
        impl RpcFunction for Missing {
            const NAME: &'static str = "missing";
            type Input = ();
            type Output = ();
        }

        let (conn, _server) = connected().await;
        let err = conn.run::<Missing>(()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Rpc(RpcErrorKind::Remote(WireFailure::UnknownMethod(name))) if name == "missing"
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, _server) = connected().await;
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        let err = conn.run::<Echo>("late".to_string()).await.unwrap_err();
        assert!(matches!(err, Error::Rpc(RpcErrorKind::ConnectionClosed)));
    }

    #[tokio::test]
    async fn unanswered_calls_cancel_on_peer_close() {
        let (conn, server) = connected().await;
        let pending = tokio::spawn(async move {
            let err = conn.run::<Stall>(()).await.unwrap_err();
            assert!(matches!(err, Error::Rpc(RpcErrorKind::ConnectionClosed)));
        });

        // Give the request time to reach the server, then kill the server.
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.abort();

        timeout(Duration::from_secs(1), pending)
            .await
            .expect("pending call should cancel")
            .unwrap();
    }
}
