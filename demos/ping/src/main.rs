use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use dotenvy::dotenv;
use phalanx::{
    start_app, Config, FunctionRegistry, RpcFunction, Runtime, SpawnOptions, WorkerService,
};
use tracing::info;

mod init;

struct Ping;
impl RpcFunction for Ping {
    const NAME: &'static str = "ping";
    type Input = ();
    type Output = String;
}

struct PingApp;

#[async_trait]
impl WorkerService for PingApp {
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
    }
}

#[derive(Parser, Debug)]
pub struct Cli {
    #[command(flatten)]
    pub options: Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();
    let args = Cli::parse();

    // Workers serve inside this call and never reach the code below.
    let runtime = start_app(PingApp, &args.options).await?;

    let worker = runtime.spawn(SpawnOptions::local()).await?;
    info!(worker = %worker.id(), address = %worker.address(), "worker up");

    let conn = worker.client().await?;
    let reply = conn.run::<Ping>(()).await?;
    info!("ping -> {reply}");

    conn.close().await?;
    worker.close_server().await?;
    Ok(())
}
