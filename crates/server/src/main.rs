//! offline-worker entry point.
//!
//! Boots the offline cache manager and hosts it as an MCP server on stdio
//! transport. Logging goes to stderr to avoid interfering with the JSON-RPC
//! protocol on stdout.

use std::sync::Arc;

use anyhow::Result;
use rmcp::service::serve_server;
use rmcp::transport::io::stdio;
use taxi_offline_client::{FetchClient, FetchConfig};
use taxi_offline_core::{CacheDb, OfflineConfig, OfflineWorker};
use tracing_subscriber::EnvFilter;

mod error;
mod handler;
mod tools;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = OfflineConfig::load()?;
    tracing::info!(
        version = %config.version,
        origin = %config.origin,
        db = %config.db_path.display(),
        "Starting offline-worker on stdio transport"
    );

    let db = CacheDb::open(&config.db_path).await?;
    let network = Arc::new(FetchClient::new(FetchConfig::from(&config))?);
    let worker = Arc::new(OfflineWorker::new(config, db, network.clone())?);
    let phase = worker.resume().await?;
    tracing::info!(%phase, "worker state restored");

    let handler = handler::OfflineWorkerServer::new(worker, network);
    let transport = stdio();
    let server = serve_server(handler.clone(), transport).await?;

    server.waiting().await?;

    let drained = handler.drain_revalidations().await;
    tracing::info!(drained, "stdio closed, background refreshes finished");

    Ok(())
}
