//! Listener, accept loop, per-connection loop, heartbeat loop, and partition dispatch: the
//! coordinator side of the control plane.

mod config;
mod dispatch;
mod error;

pub use config::{MasterConfig, MasterConfigBuilder};
pub use error::CoordinatorError;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dispatch::{dispatch_frame, NodeId, OutboxMap, PartitionState};
use fabric_net::{Connection, MsgType};
use fabric_pool::WorkerPool;
use fabric_registry::{ConnectionRegistry, NodeInfo};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

struct RunningState {
    accept_task: tokio::task::JoinHandle<()>,
    heartbeat_task: tokio::task::JoinHandle<()>,
    signal: drain::Signal,
    local_addr: std::net::SocketAddr,
}

/// Owns the listener, the connection registry, and the worker pool the dispatcher and
/// partitioner run on.
pub struct Coordinator {
    config: Arc<MasterConfig>,
    registry: Arc<ConnectionRegistry<NodeId>>,
    outboxes: Arc<OutboxMap>,
    pool: Arc<WorkerPool>,
    partition_state: Arc<PartitionState>,
    next_id: Arc<AtomicU64>,
    running: Mutex<Option<RunningState>>,
}

impl Coordinator {
    pub fn new(config: MasterConfig, pool: Arc<WorkerPool>) -> Self {
        let max_nodes = config.max_nodes;
        Self {
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new(max_nodes)),
            outboxes: Arc::new(Mutex::new(HashMap::new())),
            pool,
            partition_state: Arc::new(PartitionState::default()),
            next_id: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<NodeId>> {
        &self.registry
    }

    /// The socket actually bound, once running (useful with `port: 0` for tests).
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.running.lock().unwrap().as_ref().map(|s| s.local_addr)
    }

    /// Idempotent: returns immediately if already running.
    pub async fn start(&self) -> Result<(), CoordinatorError> {
        if self.running.lock().unwrap().is_some() {
            return Ok(());
        }

        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let bind_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|source| CoordinatorError::Bind { addr: addr.clone(), source })?
            .next()
            .ok_or_else(|| CoordinatorError::Bind {
                addr: addr.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"),
            })?;

        // `TcpListener::bind` doesn't expose backlog control, so bind and listen through
        // `TcpSocket` instead to honor `listen_backlog`.
        let socket = if bind_addr.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }
            .map_err(|source| CoordinatorError::Bind { addr: addr.clone(), source })?;
        socket.set_reuseaddr(true).map_err(|source| CoordinatorError::Bind { addr: addr.clone(), source })?;
        socket.bind(bind_addr).map_err(|source| CoordinatorError::Bind { addr: addr.clone(), source })?;
        let listener = socket
            .listen(self.config.listen_backlog)
            .map_err(|source| CoordinatorError::Bind { addr: addr.clone(), source })?;
        let local_addr = listener.local_addr().map_err(|source| CoordinatorError::Bind { addr: addr.clone(), source })?;
        info!(%addr, backlog = self.config.listen_backlog, "coordinator listening");

        let (signal, watch) = drain::channel();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.registry),
            Arc::clone(&self.outboxes),
            Arc::clone(&self.pool),
            Arc::clone(&self.config),
            Arc::clone(&self.partition_state),
            Arc::clone(&self.next_id),
            watch.clone(),
        ));
        let heartbeat_task = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.registry),
            Arc::clone(&self.outboxes),
            Arc::clone(&self.config),
            watch,
        ));

        *self.running.lock().unwrap() = Some(RunningState { accept_task, heartbeat_task, signal, local_addr });
        Ok(())
    }

    /// Stops the listener, lets the accept/heartbeat/connection loops observe the drain signal,
    /// and waits for the first two to exit. Per-connection tasks are not joined here: they exit
    /// independently once they notice the signal or their socket closes.
    pub async fn stop(&self) {
        let state = self.running.lock().unwrap().take();
        if let Some(state) = state {
            state.signal.drain().await;
            let _ = state.accept_task.await;
            let _ = state.heartbeat_task.await;
            info!("coordinator stopped");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry<NodeId>>,
    outboxes: Arc<OutboxMap>,
    pool: Arc<WorkerPool>,
    config: Arc<MasterConfig>,
    partition_state: Arc<PartitionState>,
    next_id: Arc<AtomicU64>,
    watch: drain::Watch,
) {
    loop {
        tokio::select! {
            _ = watch.clone().signaled() => {
                info!("accept loop shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        if registry.size() >= config.max_nodes {
                            debug!(%addr, "rejecting connection at capacity");
                            drop(stream);
                            continue;
                        }
                        let _ = stream.set_nodelay(true);

                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        registry.insert(id, NodeInfo::new(addr.to_string()));
                        info!(%addr, id, "accepted worker connection");

                        let (tx, rx) = mpsc::unbounded_channel();
                        outboxes.lock().unwrap().insert(id, tx);

                        let conn = Connection::new(stream, addr.to_string());
                        tokio::spawn(connection_loop(
                            id,
                            conn,
                            rx,
                            Arc::clone(&registry),
                            Arc::clone(&outboxes),
                            Arc::clone(&pool),
                            Arc::clone(&config),
                            Arc::clone(&partition_state),
                            watch.clone(),
                        ));
                    }
                    Err(err) => error!(%err, "accept failed"),
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn connection_loop(
    id: NodeId,
    mut conn: Connection<TcpStream>,
    mut outbound: mpsc::UnboundedReceiver<(MsgType, Vec<u8>)>,
    registry: Arc<ConnectionRegistry<NodeId>>,
    outboxes: Arc<OutboxMap>,
    pool: Arc<WorkerPool>,
    config: Arc<MasterConfig>,
    partition_state: Arc<PartitionState>,
    watch: drain::Watch,
) {
    loop {
        tokio::select! {
            _ = watch.clone().signaled() => {
                debug!(id, "connection loop shutting down");
                break;
            }
            outgoing = outbound.recv() => {
                match outgoing {
                    Some((msg_type, payload)) => {
                        if let Err(err) = conn.send_message(msg_type, &payload).await {
                            warn!(id, %err, "failed to send outgoing frame");
                            break;
                        }
                    }
                    None => {
                        debug!(id, "outbox revoked, tearing down connection");
                        break;
                    }
                }
            }
            received = conn.recv_message() => {
                match received {
                    Ok((tag, payload)) => {
                        let registry = Arc::clone(&registry);
                        let outboxes = Arc::clone(&outboxes);
                        let config = Arc::clone(&config);
                        let partition_state = Arc::clone(&partition_state);
                        let handle = pool.spawn(move || {
                            dispatch_frame(id, tag, payload, &registry, &outboxes, &config, &partition_state);
                        });
                        if let Err(err) = handle.await {
                            warn!(id, %err, "dispatch task failed");
                        }
                    }
                    Err(err) => {
                        debug!(id, %err, "connection closed");
                        break;
                    }
                }
            }
        }
    }

    registry.mark_dead(&id);
    registry.erase(&id);
    outboxes.lock().unwrap().remove(&id);
    conn.close().await;
}

async fn heartbeat_loop(registry: Arc<ConnectionRegistry<NodeId>>, outboxes: Arc<OutboxMap>, config: Arc<MasterConfig>, watch: drain::Watch) {
    let mut interval = tokio::time::interval(config.heartbeat_interval);
    loop {
        tokio::select! {
            _ = watch.clone().signaled() => {
                info!("heartbeat loop shutting down");
                break;
            }
            _ = interval.tick() => {
                let snapshot = registry.snapshot();
                {
                    let outboxes = outboxes.lock().unwrap();
                    for (id, _) in &snapshot {
                        if let Some(tx) = outboxes.get(id) {
                            if tx.send((MsgType::Ping, Vec::new())).is_err() {
                                debug!(id, "heartbeat send failed, connection already gone");
                            }
                        }
                    }
                }
                debug!(nodes = snapshot.len(), "heartbeat cycle sent");

                for (id, info) in &snapshot {
                    if info.last_seen.elapsed() > config.heartbeat_timeout {
                        warn!(id, "heartbeat timeout, dropping node");
                        registry.erase(id);
                        outboxes.lock().unwrap().remove(id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test_log::test(tokio::test)]
    async fn rejects_connections_past_capacity() {
        let pool = Arc::new(WorkerPool::new(2));
        let config = MasterConfig::builder()
            .port(0u16)
            .max_nodes(2usize)
            .total_layers(1u32)
            .bytes_per_layer(1u64)
            .build()
            .unwrap();
        let coordinator = Coordinator::new(config, pool);
        coordinator.start().await.unwrap();
        let addr = coordinator.local_addr().unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        let _second = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.registry().size(), 2);

        let mut third = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.registry().size(), 2);
        // The coordinator drops the socket without replying; the peer observes EOF.
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 1];
        assert_eq!(third.read(&mut buf).await.unwrap(), 0);

        coordinator.stop().await;
    }

    #[test_log::test(tokio::test)]
    async fn start_is_idempotent() {
        let pool = Arc::new(WorkerPool::new(1));
        let config = MasterConfig::builder()
            .port(0u16)
            .total_layers(1u32)
            .bytes_per_layer(1u64)
            .build()
            .unwrap();
        let coordinator = Coordinator::new(config, pool);
        coordinator.start().await.unwrap();
        coordinator.start().await.unwrap();
        coordinator.stop().await;
    }

    #[test_log::test(tokio::test)]
    async fn heartbeat_timeout_drops_a_silent_worker() {
        let registry: Arc<ConnectionRegistry<NodeId>> = Arc::new(ConnectionRegistry::new(4));
        registry.insert(1, {
            let mut info = NodeInfo::new("10.0.0.5");
            info.last_seen = std::time::Instant::now() - Duration::from_secs(60);
            info
        });
        let outboxes: Arc<OutboxMap> = Arc::new(Mutex::new(HashMap::new()));
        let config = Arc::new(
            MasterConfig::builder()
                .port(0u16)
                .total_layers(1u32)
                .bytes_per_layer(1u64)
                .heartbeat_timeout(Duration::from_millis(1))
                .heartbeat_interval(Duration::from_millis(5))
                .build()
                .unwrap(),
        );
        let (_signal, watch) = drain::channel();
        let handle = tokio::spawn(heartbeat_loop(Arc::clone(&registry), outboxes, config, watch));
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.abort();
        assert_eq!(registry.size(), 0);
    }
}
