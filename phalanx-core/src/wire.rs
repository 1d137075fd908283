//! Wire frames and the framed typed transport.
//!
//! Three conversations cross process boundaries, all carried as
//! length-delimited [`Serializer`](crate::serializer::Serializer)-encoded
//! messages over a duplex byte stream:
//!
//! - the one-shot **reverse handshake** a freshly spawned worker sends to
//!   its parent ([`Handshake`] / [`HandshakeReply`]);
//! - the **heartbeat** ticks exchanged on that same stream for the rest of
//!   both processes' lives ([`Heartbeat`]);
//! - the **RPC protocol** between a client connection and a worker server
//!   ([`ClientFrame`] / [`ServerFrame`]), where user payloads are opaque
//!   byte strings encoded against the registered function's schema.
//!
//! [`Transport`] wraps any `AsyncRead + AsyncWrite` stream with length
//! delimiting and typed encode/decode, so protocol code never handles raw
//! buffers.

use anyhow::Result;
use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{
    env::WorkerId,
    error::WireFailure,
    serializer::{Serializable, Serializer},
};

/// The one-shot frame a spawned worker sends back to its parent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// The id the spawner assigned, echoed back.
    pub worker_id: WorkerId,
    /// Host on which the worker's RPC server is reachable.
    pub host: String,
    /// Ephemeral port of the worker's RPC server.
    pub port: u16,
    /// Content digest of the worker's executable.
    pub binary_md5: [u8; 16],
    /// Token from the spawn environment, echoed back.
    pub cookie: String,
}

/// The parent's verdict on a reverse handshake.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    Accepted,
    Rejected { reason: RejectReason },
}

/// Why a parent refused a reverse handshake.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The worker's executable digest differs from the parent's.
    BinaryMismatch {
        expected: [u8; 16],
        actual: [u8; 16],
    },
    /// The echoed cookie does not match the spawn that owns this listener.
    BadCookie,
    Other(String),
}

/// A liveness probe on a parent/child link.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub kind: HeartbeatKind,
    pub seq: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatKind {
    /// Periodic liveness tick.
    Tick,
    /// Deliberate close; the receiver should not treat the silence that
    /// follows as a failure.
    Shutdown,
}

/// Frames sent by a client connection to a worker server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Opens the RPC conversation; answered with
    /// [`ServerFrame::HelloAck`] once per-connection state is initialized.
    Hello,
    /// A typed call. `payload` is the input encoded against the method's
    /// input schema.
    Request {
        query_id: u64,
        method: String,
        payload: Vec<u8>,
    },
    /// Graceful close; the server runs connection teardown on receipt.
    Goodbye,
}

/// Frames sent by a worker server to a client connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    HelloAck(HelloOutcome),
    Response { query_id: u64, outcome: CallOutcome },
}

/// Outcome of connection establishment, determined after the worker's
/// `init_connection_state` ran.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum HelloOutcome {
    Accepted,
    Refused(WireFailure),
}

/// A serializable `Result` for RPC responses.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Ok(Vec<u8>),
    Err(WireFailure),
}

impl CallOutcome {
    pub fn into_result(self) -> std::result::Result<Vec<u8>, WireFailure> {
        match self {
            Self::Ok(bytes) => Ok(bytes),
            Self::Err(failure) => Err(failure),
        }
    }
}

impl From<std::result::Result<Vec<u8>, WireFailure>> for CallOutcome {
    fn from(result: std::result::Result<Vec<u8>, WireFailure>) -> Self {
        match result {
            Ok(bytes) => Self::Ok(bytes),
            Err(failure) => Self::Err(failure),
        }
    }
}

/// A typed, length-delimited message transport over a duplex byte stream.
#[derive(Debug)]
pub struct Transport<T> {
    framed: Framed<T, LengthDelimitedCodec>,
    serializer: Serializer,
}

impl<T: AsyncRead + AsyncWrite + Unpin> Transport<T> {
    pub fn new(io: T, serializer: Serializer) -> Self {
        Self {
            framed: Framed::new(io, LengthDelimitedCodec::new()),
            serializer,
        }
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// Encode and send one message.
    pub async fn send<M: Serializable>(&mut self, message: &M) -> Result<()> {
        let bytes = self.serializer.to_bytes(message)?;
        self.framed.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Receive and decode one message. `None` means the stream ended.
    pub async fn recv<M: Serializable>(&mut self) -> Result<Option<M>> {
        match self.framed.next().await {
            None => Ok(None),
            Some(frame) => Ok(Some(self.serializer.from_bytes(&frame?)?)),
        }
    }

    /// Split into independently owned write and read halves.
    ///
    /// Used by client connections, which run a dedicated writer task to
    /// preserve dispatch order while a reader task demultiplexes responses.
    pub fn split(self) -> (TransportWriter<T>, TransportReader<T>) {
        let serializer = self.serializer;
        let (sink, stream) = self.framed.split();
        (
            TransportWriter { sink, serializer },
            TransportReader { stream, serializer },
        )
    }
}

/// The write half of a split [`Transport`].
pub struct TransportWriter<T> {
    sink: SplitSink<Framed<T, LengthDelimitedCodec>, Bytes>,
    serializer: Serializer,
}

impl<T: AsyncRead + AsyncWrite + Unpin> TransportWriter<T> {
    pub async fn send<M: Serializable>(&mut self, message: &M) -> Result<()> {
        let bytes = self.serializer.to_bytes(message)?;
        self.sink.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.sink.flush().await?;
        Ok(())
    }
}

/// The read half of a split [`Transport`].
pub struct TransportReader<T> {
    stream: SplitStream<Framed<T, LengthDelimitedCodec>>,
    serializer: Serializer,
}

impl<T: AsyncRead + AsyncWrite + Unpin> TransportReader<T> {
    pub async fn recv<M: Serializable>(&mut self) -> Result<Option<M>> {
        match self.stream.next().await {
            None => Ok(None),
            Some(frame) => Ok(Some(self.serializer.from_bytes(&frame?)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_a_duplex_stream() {
        let (left, right) = tokio::io::duplex(1024);
        let mut a = Transport::new(left, Serializer::Postcard);
        let mut b = Transport::new(right, Serializer::Postcard);

        let handshake = Handshake {
            worker_id: WorkerId::new("w0"),
            host: "127.0.0.1".to_string(),
            port: 4321,
            binary_md5: [7; 16],
            cookie: "c".to_string(),
        };
        a.send(&handshake).await.unwrap();
        let received: Handshake = b.recv().await.unwrap().unwrap();
        assert_eq!(received, handshake);

        b.send(&HandshakeReply::Accepted).await.unwrap();
        let reply: HandshakeReply = a.recv().await.unwrap().unwrap();
        assert_eq!(reply, HandshakeReply::Accepted);
    }

    #[tokio::test]
    async fn end_of_stream_is_none() {
        let (left, right) = tokio::io::duplex(64);
        let a = Transport::new(left, Serializer::Cbor);
        let mut b = Transport::new(right, Serializer::Cbor);

        drop(a);
        let received: Option<Heartbeat> = b.recv().await.unwrap();
        assert_eq!(received, None);
    }

    #[tokio::test]
    async fn split_halves_interleave() {
        let (left, right) = tokio::io::duplex(1024);
        let (mut writer, _reader) = Transport::new(left, Serializer::Postcard).split();
        let mut peer = Transport::new(right, Serializer::Postcard);

        for seq in 0..3u64 {
            writer
                .send(&Heartbeat {
                    kind: HeartbeatKind::Tick,
                    seq,
                })
                .await
                .unwrap();
        }
        for seq in 0..3u64 {
            let tick: Heartbeat = peer.recv().await.unwrap().unwrap();
            assert_eq!(tick.seq, seq);
        }
    }
}
