//! Worker-side process logic: connect, report resources, wait for a `CONFIG` assignment, serve
//! heartbeats.

mod config;

pub use config::{WorkerConfig, WorkerConfigBuilder};

use std::sync::Arc;

use fabric_layers::{Layer, Relu, Sequential};
use fabric_net::{Connection, MsgType, NetError, ResourceReportPayload};
use fabric_partition::{decode_assignment, NodeAssignment};
use fabric_pool::WorkerPool;
use fabric_system_probe::SystemProbe;
use tokio::net::TcpStream;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to resolve {addr}: {source}")]
    Socket {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("handshake failed: {0}")]
    Handshake(#[from] NetError),
}

/// The outcome of a full worker run, for the binary's logging and tests. `assignment` is `None`
/// if the coordinator never sent one before shutdown.
pub struct WorkerOutcome {
    pub assignment: Option<NodeAssignment>,
}

/// Connects to the coordinator, reports resources, and serves the control-plane loop until the
/// coordinator closes the connection or sends `SHUTDOWN`.
pub async fn run(config: WorkerConfig, probe: Arc<dyn SystemProbe>) -> Result<WorkerOutcome, WorkerError> {
    let addr = format!("{}:{}", config.master_host, config.master_port);

    let mut resolved = tokio::net::lookup_host(&addr).await.map_err(|source| WorkerError::Socket { addr: addr.clone(), source })?;
    let target = resolved.next().ok_or_else(|| WorkerError::Socket {
        addr: addr.clone(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"),
    })?;

    let stream = TcpStream::connect(target).await.map_err(|source| WorkerError::Connect { addr: addr.clone(), source })?;
    let _ = stream.set_nodelay(true);
    let mut conn = Connection::new(stream, addr.clone());

    let threads = config.threads_override.unwrap_or_else(|| probe.hardware_threads());
    let report = ResourceReportPayload {
        ram_bytes: probe.free_ram_mb() * 1024 * 1024,
        threads,
    };
    conn.send_message(MsgType::ResourceReport, &report.encode()).await?;
    info!(ram_bytes = report.ram_bytes, threads, "resource report sent");

    let pool = Arc::new(WorkerPool::new(threads.max(1) as usize));
    let mut handshake_acked = false;
    // Built for its layer-shape bookkeeping side effect; nothing downstream reads it yet.
    let mut _sequential: Option<Sequential> = None;
    let mut assignment: Option<NodeAssignment> = None;

    loop {
        match conn.recv_message().await {
            Ok((tag, payload)) => {
                handshake_acked = true;
                match MsgType::from_u8(tag) {
                    Some(MsgType::Config) => match decode_assignment(&payload) {
                        Ok(node_assignment) => {
                            info!(
                                layer_start = node_assignment.layer_start,
                                layer_end = node_assignment.layer_end,
                                is_first = node_assignment.is_first,
                                is_last = node_assignment.is_last,
                                "assignment received"
                            );
                            _sequential = Some(build_placeholder_sequential(&node_assignment, &pool));
                            assignment = Some(node_assignment);
                        }
                        Err(err) => warn!(%err, "malformed config payload, ignoring"),
                    },
                    Some(MsgType::Ping) => {
                        if let Err(err) = conn.send_message(MsgType::Pong, &[]).await {
                            warn!(%err, "failed to reply to ping");
                            break;
                        }
                    }
                    Some(MsgType::Shutdown) => {
                        info!("coordinator requested shutdown");
                        break;
                    }
                    _ => warn!(tag, "unexpected frame type from coordinator, ignoring"),
                }
            }
            Err(err) => {
                if !handshake_acked {
                    return Err(WorkerError::Handshake(err));
                }
                info!(%err, "coordinator connection closed");
                break;
            }
        }
    }

    conn.close().await;
    Ok(WorkerOutcome { assignment })
}

/// Builds a `Sequential` with one placeholder layer per assigned index. Actual per-layer
/// weights are a deployment concern; this only establishes the shape bookkeeping §4.11 asks for.
fn build_placeholder_sequential(assignment: &NodeAssignment, pool: &Arc<WorkerPool>) -> Sequential {
    let mut sequential = Sequential::new();
    sequential.set_pool(Some(Arc::clone(pool)));
    for _ in assignment.layer_start..assignment.layer_end {
        sequential.add(Layer::Relu(Relu::new()));
    }
    sequential
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_net::ResourceReportPayload;
    use fabric_partition::NodeAssignment;
    use fabric_system_probe::FakeSystemProbe;
    use tokio::net::TcpListener;

    #[test_log::test(tokio::test)]
    async fn reports_resources_then_applies_a_config_assignment() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, "worker".to_string());
            let (tag, payload) = conn.recv_message().await.unwrap();
            assert_eq!(MsgType::from_u8(tag), Some(MsgType::ResourceReport));
            let report = ResourceReportPayload::decode(&payload).unwrap();
            assert_eq!(report.threads, 4);

            let assignment = NodeAssignment {
                node_index: 0,
                layer_start: 0,
                layer_end: 3,
                array_bytes: 3 * 1_048_576,
                forward_addr: String::new(),
                is_first: true,
                is_last: true,
            };
            let encoded = fabric_partition::encode_assignment(&assignment).unwrap();
            conn.send_message(MsgType::Config, &encoded).await.unwrap();
            conn.send_message(MsgType::Shutdown, &[]).await.unwrap();
        });

        let config = WorkerConfig::builder()
            .master_host(addr.ip().to_string())
            .master_port(addr.port())
            .threads_override(Some(4))
            .build()
            .unwrap();
        let probe: Arc<dyn SystemProbe> = Arc::new(FakeSystemProbe::new(2048, 4096, 4));
        let outcome = run(config, probe).await.unwrap();

        server.await.unwrap();
        let assignment = outcome.assignment.unwrap();
        assert_eq!(assignment.layer_start, 0);
        assert_eq!(assignment.layer_end, 3);
    }

    #[test_log::test(tokio::test)]
    async fn connection_closed_before_any_reply_is_a_handshake_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let config = WorkerConfig::builder()
            .master_host(addr.ip().to_string())
            .master_port(addr.port())
            .build()
            .unwrap();
        let probe: Arc<dyn SystemProbe> = Arc::new(FakeSystemProbe::new(1024, 2048, 2));
        let result = run(config, probe).await;
        server.await.unwrap();
        assert!(matches!(result, Err(WorkerError::Handshake(_))));
    }
}
