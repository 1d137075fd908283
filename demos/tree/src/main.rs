//! A two-level process tree.
//!
//! The master spawns two primary workers. Each primary, when asked to
//! `fan_out`, spawns three secondary workers of its own, pings them all in
//! parallel, and returns what they said. Every process in the tree runs
//! this same binary.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use dotenvy::dotenv;
use phalanx::{
    start_app, CallContext, Config, FunctionRegistry, RpcFunction, Runtime, SpawnOptions,
    WorkerService,
};
use tracing::info;

mod init;

struct Ping;
impl RpcFunction for Ping {
    const NAME: &'static str = "ping";
    type Input = ();
    type Output = String;
}

struct FanOut;
impl RpcFunction for FanOut {
    const NAME: &'static str = "fan_out";
    type Input = usize;
    type Output = Vec<String>;
}

struct TreeApp;

#[async_trait]
impl WorkerService for TreeApp {
    type WorkerState = ();
    type ConnectionState = ();

    async fn init_worker_state(&self, _runtime: &Runtime<Self>) -> Result<()> {
        Ok(())
    }

    async fn init_connection_state(&self, _worker_state: &Arc<()>) -> Result<()> {
        Ok(())
    }

    fn functions(registry: &mut FunctionRegistry<Self>) {
        registry.register::<Ping, _, _>(|_ctx, ()| async move { Ok("pong".to_string()) });

        registry.register::<FanOut, _, _>(|ctx: CallContext<Self>, count: usize| {
            let runtime = ctx.runtime().clone();
            async move {
                let pings = (0..count).map(|index| {
                    let runtime = runtime.clone();
                    async move {
                        let secondary = runtime.spawn(SpawnOptions::local()).await?;
                        let conn = secondary.client().await?;
                        let reply = conn.run::<Ping>(()).await?;
                        conn.close().await?;
                        secondary.close_server().await?;
                        anyhow::Ok(format!("Secondary worker #{index}: {reply}"))
                    }
                });
                futures::future::try_join_all(pings).await
            }
        });
    }
}

#[derive(Parser, Debug)]
pub struct Cli {
    #[command(flatten)]
    pub options: Config,

    /// Number of primary workers to spawn.
    #[arg(long, default_value_t = 2)]
    pub primaries: usize,

    /// Number of secondary workers each primary spawns.
    #[arg(long, default_value_t = 3)]
    pub secondaries: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();
    let args = Cli::parse();

    let runtime = start_app(TreeApp, &args.options).await?;

    let primaries = futures::future::try_join_all(
        (0..args.primaries).map(|_| runtime.spawn(SpawnOptions::local())),
    )
    .await?;
    info!(count = primaries.len(), "primary workers up");

    for primary in &primaries {
        let conn = primary.client().await?;
        let replies = conn.run::<FanOut>(args.secondaries).await?;
        for reply in &replies {
            info!(primary = %primary.id(), "{reply}");
        }
        conn.close().await?;
    }

    runtime.shutdown().await?;
    Ok(())
}
