//! Bidirectional liveness links between parent and child processes.
//!
//! After a spawn handshake is accepted, the handshake stream stays open and
//! both sides run the same protocol on it: send a tick every `interval`,
//! declare the link dead after `timeout` of silence. A deliberate close is
//! announced with a `Shutdown` frame so the peer can distinguish an orderly
//! exit from a lost process.
//!
//! Policy lives with the callers: a worker under
//! `ConnectAndShutdownOnDisconnect` turns a dead link into a full shutdown
//! cascade, while the parent side marks the worker failed and fires its
//! `on_failure` callback.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::wire::{Heartbeat, HeartbeatKind, Transport};

/// The `(interval, timeout)` parameterization of one link, chosen by the
/// spawner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl HeartbeatConfig {
    pub fn from_millis(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Encoding used in the reserved heartbeat environment variable.
    pub fn env_value(&self) -> String {
        format!(
            "{}/{}",
            self.interval.as_millis(),
            self.timeout.as_millis()
        )
    }

    /// Inverse of [`env_value`](Self::env_value).
    pub fn parse_env(raw: &str) -> Option<Self> {
        let (interval, timeout) = raw.split_once('/')?;
        Some(Self::from_millis(
            interval.parse().ok()?,
            timeout.parse().ok()?,
        ))
    }
}

/// How a heartbeat link ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The peer announced a deliberate shutdown.
    Shutdown,
    /// The peer went silent past the timeout while the stream stayed open.
    Lost,
    /// The stream ended or errored without a shutdown announcement — the
    /// peer process is likely gone.
    Ended,
    /// This side was cancelled; a final `Shutdown` frame was sent
    /// best-effort.
    Closed,
}

/// Drive one end of a heartbeat link until it ends.
///
/// Cancel `cancel` to close the link deliberately: the peer receives a
/// `Shutdown` frame and reports [`LinkOutcome::Shutdown`], while this side
/// reports [`LinkOutcome::Closed`].
pub async fn run_link<T>(
    mut transport: Transport<T>,
    config: HeartbeatConfig,
    cancel: CancellationToken,
) -> LinkOutcome
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let deadline = tokio::time::sleep(config.timeout);
    tokio::pin!(deadline);

    let mut seq: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let frame = Heartbeat { kind: HeartbeatKind::Shutdown, seq };
                let _ = transport.send(&frame).await;
                return LinkOutcome::Closed;
            }
            _ = ticker.tick() => {
                seq += 1;
                let frame = Heartbeat { kind: HeartbeatKind::Tick, seq };
                if transport.send(&frame).await.is_err() {
                    debug!("heartbeat peer unreachable on send");
                    return LinkOutcome::Ended;
                }
            }
            received = transport.recv::<Heartbeat>() => match received {
                Ok(Some(Heartbeat { kind: HeartbeatKind::Shutdown, .. })) => {
                    return LinkOutcome::Shutdown;
                }
                Ok(Some(Heartbeat { kind: HeartbeatKind::Tick, seq })) => {
                    trace!(seq, "heartbeat tick");
                    deadline.as_mut().reset(Instant::now() + config.timeout);
                }
                Ok(None) | Err(_) => {
                    debug!("heartbeat stream ended");
                    return LinkOutcome::Ended;
                }
            },
            _ = &mut deadline => {
                debug!(timeout = ?config.timeout, "heartbeat timed out");
                return LinkOutcome::Lost;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::serializer::Serializer;

    fn pair() -> (
        Transport<tokio::io::DuplexStream>,
        Transport<tokio::io::DuplexStream>,
    ) {
        let (left, right) = tokio::io::duplex(4096);
        (
            Transport::new(left, Serializer::Postcard),
            Transport::new(right, Serializer::Postcard),
        )
    }

    #[tokio::test]
    async fn both_sides_stay_alive_while_ticking() {
        let (a, b) = pair();
        let config = HeartbeatConfig::from_millis(10, 100);

        let cancel_a = CancellationToken::new();
        let side_a = tokio::spawn(run_link(a, config, cancel_a.clone()));
        let side_b = tokio::spawn(run_link(b, config, CancellationToken::new()));

        // Let several intervals elapse, then close deliberately.
        tokio::time::sleep(Duration::from_millis(80)).await;
        cancel_a.cancel();

        assert_eq!(side_a.await.unwrap(), LinkOutcome::Closed);
        assert_eq!(side_b.await.unwrap(), LinkOutcome::Shutdown);
    }

    #[tokio::test]
    async fn silence_is_declared_lost_within_two_timeouts() {
        let (a, b) = pair();
        let config = HeartbeatConfig::from_millis(100, 500);

        // The peer never ticks and never closes: hold its transport open
        // without running the protocol.
        let _held = a;
        let started = tokio::time::Instant::now();
        let outcome = timeout(
            Duration::from_millis(1_000),
            run_link(b, config, CancellationToken::new()),
        )
        .await
        .expect("link should die within 2x timeout");

        assert_eq!(outcome, LinkOutcome::Lost);
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn dropped_peer_ends_the_link_immediately() {
        let (a, b) = pair();
        drop(a);

        let outcome = timeout(
            Duration::from_millis(200),
            run_link(b, HeartbeatConfig::from_millis(50, 1_000), CancellationToken::new()),
        )
        .await
        .unwrap();
        assert_eq!(outcome, LinkOutcome::Ended);
    }

    #[test]
    fn env_encoding_round_trips() {
        let config = HeartbeatConfig::from_millis(100, 500);
        assert_eq!(config.env_value(), "100/500");
        assert_eq!(HeartbeatConfig::parse_env("100/500"), Some(config));
        assert_eq!(HeartbeatConfig::parse_env("nope"), None);
        assert_eq!(HeartbeatConfig::parse_env("5"), None);
    }
}
