//! Supervision scopes for asynchronous computations.
//!
//! [`try_within`] runs a computation under a fresh scope with two error
//! sinks. Failures that surface *before* the computation's result is
//! determined — including failures of tasks the computation spawned through
//! its [`Scope`] — are returned to the caller. Failures that arrive *after*
//! the result is determined are redirected to a caller-specified
//! [`Monitor`] as [`LateTaskFailure`]s instead of crashing anything.
//!
//! This split lets RPC handlers return a clean result while background work
//! they launched keeps running, with any post-hoc failure surfacing on a
//! dedicated channel.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::Future;
use tokio::sync::mpsc;
use tracing::error;

/// A failure from a task that outlived the result of the computation that
/// spawned it.
#[derive(Debug)]
pub struct LateTaskFailure {
    pub error: anyhow::Error,
}

impl std::fmt::Display for LateTaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "late task failure: {:#}", self.error)
    }
}

/// A sink for failures that can no longer be returned to any caller.
#[derive(Clone)]
pub struct Monitor {
    tx: mpsc::UnboundedSender<LateTaskFailure>,
}

impl Monitor {
    /// A monitor paired with the stream of failures it receives.
    pub fn channel() -> (Monitor, MonitorStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Monitor { tx }, MonitorStream { rx })
    }

    /// A monitor that logs every failure and drops it.
    pub fn logging() -> Monitor {
        let (monitor, mut stream) = Monitor::channel();
        tokio::spawn(async move {
            while let Some(failure) = stream.recv().await {
                error!("{failure}");
            }
        });
        monitor
    }

    /// Deliver a failure to the monitor.
    ///
    /// Infallible: if the receiving side is gone the failure is logged.
    pub fn report(&self, error: anyhow::Error) {
        if let Err(mpsc::error::SendError(failure)) = self.tx.send(LateTaskFailure { error }) {
            error!("unmonitored {failure}");
        }
    }
}

/// Receives the failures reported to a [`Monitor`].
pub struct MonitorStream {
    rx: mpsc::UnboundedReceiver<LateTaskFailure>,
}

impl MonitorStream {
    pub async fn recv(&mut self) -> Option<LateTaskFailure> {
        self.rx.recv().await
    }

    /// Non-blocking poll, for tests and teardown sweeps.
    pub fn try_recv(&mut self) -> Option<LateTaskFailure> {
        self.rx.try_recv().ok()
    }
}

/// Handle to the supervision scope of a [`try_within`] call.
///
/// Tasks spawned through the scope have their failures routed according to
/// whether the scope's result has been determined yet.
#[derive(Clone)]
pub struct Scope {
    determined: Arc<AtomicBool>,
    early: mpsc::UnboundedSender<anyhow::Error>,
    late: Monitor,
}

impl Scope {
    /// Launch a background task under this scope.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let scope = self.clone();
        tokio::spawn(async move {
            if let Err(error) = future.await {
                scope.deliver(error);
            }
        });
    }

    fn deliver(&self, error: anyhow::Error) {
        if self.determined.load(Ordering::Acquire) {
            self.late.report(error);
        } else if let Err(mpsc::error::SendError(error)) = self.early.send(error) {
            // The early receiver is gone: the result raced ahead of the
            // determined flag. Late delivery is the correct destination.
            self.late.report(error);
        }
    }
}

/// Run `f` under a fresh supervision scope.
///
/// Errors surfaced before the result is determined — whether returned by
/// the computation itself or raised by a task it spawned through the scope —
/// are propagated to the caller. Failures raised by scope tasks after the
/// result is determined go to `monitor`.
pub async fn try_within<T, F, Fut>(monitor: &Monitor, f: F) -> anyhow::Result<T>
where
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let (early_tx, mut early_rx) = mpsc::unbounded_channel();
    let determined = Arc::new(AtomicBool::new(false));
    let scope = Scope {
        determined: determined.clone(),
        early: early_tx,
        late: monitor.clone(),
    };

    let fut = f(scope);
    tokio::pin!(fut);

    let result = tokio::select! {
        result = &mut fut => result,
        Some(error) = early_rx.recv() => Err(error),
    };
    determined.store(true, Ordering::Release);
    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::anyhow;

    use super::*;

    #[tokio::test]
    async fn result_passes_through() {
        let (monitor, _stream) = Monitor::channel();
        let result = try_within(&monitor, |_| async { Ok(42) }).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn early_scope_failure_propagates_to_caller() {
        let (monitor, mut stream) = Monitor::channel();
        let result: anyhow::Result<()> = try_within(&monitor, |scope| async move {
            scope.spawn(async { Err(anyhow!("boom")) });
            // Never resolves on its own; the scope failure must win.
            futures::future::pending::<()>().await;
            Ok(())
        })
        .await;

        assert_eq!(result.unwrap_err().to_string(), "boom");
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn late_scope_failure_reaches_monitor() {
        let (monitor, mut stream) = Monitor::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let result = try_within(&monitor, |scope| async move {
            scope.spawn(async move {
                release_rx.await.ok();
                Err(anyhow!("after the fact"))
            });
            Ok(7)
        })
        .await
        .unwrap();
        assert_eq!(result, 7);

        release_tx.send(()).unwrap();
        let failure = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.error.to_string(), "after the fact");
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn computation_error_propagates() {
        let (monitor, _stream) = Monitor::channel();
        let result: anyhow::Result<()> =
            try_within(&monitor, |_| async { Err(anyhow!("direct")) }).await;
        assert_eq!(result.unwrap_err().to_string(), "direct");
    }
}
