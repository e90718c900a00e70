use std::sync::Arc;

use clap::Parser;
use fabric_system_probe::{OsSystemProbe, SystemProbe};
use fabric_worker_runtime::{WorkerConfig, WorkerError};
use tracing::{error, info};

/// Distributed inference/training fabric worker.
#[derive(Parser, Debug)]
#[command(name = "worker", about = "Connects to a coordinator, reports resources, and serves its assigned layer slice")]
struct Cli {
    master_host: String,
    master_port: u16,

    /// Overrides the reported hardware concurrency; otherwise read from the system probe.
    #[arg(long, env = "WORKER_THREADS")]
    threads: Option<u32>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = match WorkerConfig::builder()
        .master_host(cli.master_host)
        .master_port(cli.master_port)
        .threads_override(cli.threads)
        .build()
    {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid worker configuration");
            std::process::exit(1);
        }
    };

    let probe: Arc<dyn SystemProbe> = Arc::new(OsSystemProbe::new());

    match fabric_worker_runtime::run(config, probe).await {
        Ok(outcome) => {
            info!(assigned = outcome.assignment.is_some(), "worker exiting cleanly");
            std::process::exit(0);
        }
        Err(err @ WorkerError::Socket { .. }) => {
            error!(%err, "socket failure");
            std::process::exit(1);
        }
        Err(err @ WorkerError::Connect { .. }) => {
            error!(%err, "connect failure");
            std::process::exit(2);
        }
        Err(err @ WorkerError::Handshake(_)) => {
            error!(%err, "handshake failure");
            std::process::exit(3);
        }
    }
}
