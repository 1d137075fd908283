//! Shared service used by the integration suites.
//!
//! The in-process spawn target runs the full bootstrap — loopback
//! handshake, heartbeat, server loop — inside the test process, so the
//! counters held by the service are visible to both the workers and the
//! assertions.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use phalanx::{
    CallContext, Config, FunctionRegistry, LateTaskFailure, Runtime, RpcFunction, SpawnOptions,
    WorkerService,
};
use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once per test binary; later calls are
/// no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Ping;
impl RpcFunction for Ping {
    const NAME: &'static str = "ping";
    type Input = ();
    type Output = String;
}

/// Spawns `n` sub-workers, pings them all in parallel, and reports what
/// they said.
pub struct FanOut;
impl RpcFunction for FanOut {
    const NAME: &'static str = "fan_out";
    type Input = usize;
    type Output = Vec<String>;
}

/// Returns an answer immediately, then fails in a background task.
pub struct LateAnswer;
impl RpcFunction for LateAnswer {
    const NAME: &'static str = "late_answer";
    type Input = ();
    type Output = i32;
}

#[derive(Clone, Default)]
pub struct Counters {
    pub conn_inits: Arc<AtomicUsize>,
    pub conn_closes: Arc<AtomicUsize>,
    pub late_failures: Arc<AtomicUsize>,
}

impl Counters {
    pub fn live_connections(&self) -> isize {
        self.conn_inits.load(Ordering::SeqCst) as isize
            - self.conn_closes.load(Ordering::SeqCst) as isize
    }
}

pub struct TestService {
    pub counters: Counters,
}

impl TestService {
    pub fn new() -> (Self, Counters) {
        init_tracing();
        let counters = Counters::default();
        (
            Self {
                counters: counters.clone(),
            },
            counters,
        )
    }
}

pub struct TestWorkerState {
    pub counters: Counters,
}

#[async_trait]
impl WorkerService for TestService {
    type WorkerState = TestWorkerState;
    type ConnectionState = u64;

    async fn init_worker_state(
        &self,
        _runtime: &Runtime<Self>,
    ) -> anyhow::Result<TestWorkerState> {
        Ok(TestWorkerState {
            counters: self.counters.clone(),
        })
    }

    async fn init_connection_state(
        &self,
        worker_state: &Arc<TestWorkerState>,
    ) -> anyhow::Result<u64> {
        let serial = worker_state.counters.conn_inits.fetch_add(1, Ordering::SeqCst);
        Ok(serial as u64)
    }

    async fn on_connection_close(
        &self,
        _state: &u64,
        worker_state: &Arc<TestWorkerState>,
    ) {
        worker_state.counters.conn_closes.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_late_failure(
        &self,
        worker_state: &Arc<TestWorkerState>,
        _failure: LateTaskFailure,
    ) {
        worker_state.counters.late_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn functions(registry: &mut FunctionRegistry<Self>) {
        registry.register::<Ping, _, _>(|_ctx, ()| async move { Ok("pong".to_string()) });

        registry.register::<FanOut, _, _>(|ctx: CallContext<Self>, count: usize| {
            let runtime = ctx.runtime().clone();
            async move {
                let pings = (0..count).map(|index| {
                    let runtime = runtime.clone();
                    async move {
                        let worker = runtime.spawn(SpawnOptions::in_process()).await?;
                        let conn = worker.client().await?;
                        let reply = conn.run::<Ping>(()).await?;
                        conn.close().await?;
                        worker.close_server().await?;
                        anyhow::Ok(format!("Secondary worker #{index}: {reply}"))
                    }
                });
                futures::future::try_join_all(pings).await
            }
        });

        registry.register::<LateAnswer, _, _>(|ctx: CallContext<Self>, ()| async move {
            ctx.spawn(async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Err(anyhow::anyhow!("background task blew up"))
            });
            Ok(42)
        });
    }
}

/// A configuration with test-friendly timing.
pub fn fast_config() -> Config {
    Config {
        heartbeat_interval_ms: 50,
        heartbeat_timeout_ms: 1_000,
        spawn_timeout_ms: 5_000,
        close_grace_ms: 2_000,
        ..Config::default()
    }
}
