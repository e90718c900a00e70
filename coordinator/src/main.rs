use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fabric_coordinator::{Coordinator, MasterConfig};
use fabric_pool::WorkerPool;
use tracing::{error, info};

/// Distributed inference/training fabric coordinator.
#[derive(Parser, Debug)]
#[command(name = "coordinator", about = "Accepts worker connections and partitions model layers across them")]
struct Cli {
    /// Port to listen on.
    #[arg(default_value_t = 5050)]
    port: u16,

    #[arg(long, env = "COORD_BIND_ADDRESS", default_value = "0.0.0.0")]
    bind_address: String,

    #[arg(long, env = "COORD_MAX_NODES", default_value_t = 8)]
    max_nodes: usize,

    #[arg(long, env = "COORD_LISTEN_BACKLOG", default_value_t = 8)]
    listen_backlog: u32,

    #[arg(long, env = "COORD_HEARTBEAT_INTERVAL_MS", default_value_t = 2000)]
    heartbeat_interval_ms: u64,

    #[arg(long, env = "COORD_HEARTBEAT_TIMEOUT_MS", default_value_t = 6000)]
    heartbeat_timeout_ms: u64,

    /// Defaults to `max_nodes` when unset.
    #[arg(long, env = "COORD_EXPECTED_WORKERS")]
    expected_workers: Option<usize>,

    #[arg(long, env = "COORD_TOTAL_LAYERS")]
    total_layers: u32,

    #[arg(long, env = "COORD_BYTES_PER_LAYER")]
    bytes_per_layer: u64,

    #[arg(long, env = "COORD_SAFETY_MEM_PER_THREAD_MB", default_value_t = 128)]
    safety_mem_per_thread_mb: u64,

    /// Size of the worker pool the dispatcher and partitioner run closures on.
    #[arg(long, env = "COORD_POOL_THREADS", default_value_t = 4)]
    pool_threads: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = match MasterConfig::builder()
        .bind_address(cli.bind_address)
        .port(cli.port)
        .max_nodes(cli.max_nodes)
        .listen_backlog(cli.listen_backlog)
        .heartbeat_interval(Duration::from_millis(cli.heartbeat_interval_ms))
        .heartbeat_timeout(Duration::from_millis(cli.heartbeat_timeout_ms))
        .expected_workers(cli.expected_workers)
        .total_layers(cli.total_layers)
        .bytes_per_layer(cli.bytes_per_layer)
        .safety_mem_per_thread_mb(cli.safety_mem_per_thread_mb)
        .build()
    {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid coordinator configuration");
            std::process::exit(1);
        }
    };

    let pool = Arc::new(WorkerPool::new(cli.pool_threads));
    let coordinator = Coordinator::new(config, pool);

    if let Err(err) = coordinator.start().await {
        error!(%err, "failed to start coordinator");
        std::process::exit(1);
    }

    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to install ctrl-c handler, shutting down immediately");
    } else {
        info!("shutdown signal received");
    }

    coordinator.stop().await;
}
