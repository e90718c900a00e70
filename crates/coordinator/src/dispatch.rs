//! The control-plane frame dispatcher. Runs on a [`fabric_pool::WorkerPool`] thread, never on
//! the async reactor, so a malformed or slow frame can't stall the accept/heartbeat loops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use fabric_net::{MsgType, ResourceReportPayload};
use fabric_partition::{encode_assignment, partition, NodeCompute, PartitionConfig};
use fabric_registry::ConnectionRegistry;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::MasterConfig;

pub type NodeId = u64;
pub type Outbox = mpsc::UnboundedSender<(MsgType, Vec<u8>)>;
pub type OutboxMap = Mutex<HashMap<NodeId, Outbox>>;

/// Whether the one-shot partitioning step has already run. Set once, never reset: this system
/// has no dynamic re-partitioning (see Non-goals).
#[derive(Default)]
pub struct PartitionState {
    done: AtomicBool,
}

/// Decodes and applies one received frame. Mirrors §4.8's per-type dispatch table exactly.
pub fn dispatch_frame(
    id: NodeId,
    tag: u8,
    payload: Vec<u8>,
    registry: &ConnectionRegistry<NodeId>,
    outboxes: &OutboxMap,
    config: &MasterConfig,
    partition_state: &PartitionState,
) {
    match MsgType::from_u8(tag) {
        Some(MsgType::ResourceReport) => match ResourceReportPayload::decode(&payload) {
            Ok(report) => {
                registry.update(&id, |info| {
                    info.ram_bytes = report.ram_bytes;
                    info.threads = report.threads;
                    info.last_seen = Instant::now();
                    info.alive = true;
                });
                info!(id, ram_bytes = report.ram_bytes, threads = report.threads, "resource report applied");
                maybe_trigger_partition(registry, outboxes, config, partition_state);
            }
            Err(err) => warn!(id, %err, "malformed resource report, ignoring"),
        },
        Some(MsgType::Pong) => {
            registry.update(&id, |info| {
                info.last_seen = Instant::now();
                info.alive = true;
            });
            debug!(id, "pong received");
        }
        Some(MsgType::Shutdown) => {
            registry.mark_dead(&id);
            info!(id, "worker announced shutdown");
        }
        Some(MsgType::Ping) | Some(MsgType::Config) => {
            warn!(id, tag, "unexpected frame type from a worker, ignoring");
        }
        None => {
            warn!(id, tag, "unknown frame type, ignoring");
        }
    }
}

/// Once every expected worker has reported nonzero RAM, computes and sends one `CONFIG` frame
/// per worker. Runs at most once per coordinator lifetime.
fn maybe_trigger_partition(
    registry: &ConnectionRegistry<NodeId>,
    outboxes: &OutboxMap,
    config: &MasterConfig,
    partition_state: &PartitionState,
) {
    if partition_state.done.load(Ordering::SeqCst) {
        return;
    }

    let mut snapshot = registry.snapshot();
    snapshot.sort_by_key(|(id, _)| *id);
    let reported = snapshot.iter().filter(|(_, info)| info.ram_bytes > 0).count();
    if reported < config.expected_workers() {
        return;
    }
    if partition_state.done.swap(true, Ordering::SeqCst) {
        return;
    }

    let nodes: Vec<NodeCompute> = snapshot
        .iter()
        .map(|(_, info)| NodeCompute {
            addr: info.peer_addr.clone(),
            ram_mb: info.ram_bytes / (1024 * 1024),
            threads: info.threads,
        })
        .collect();
    let partition_config = PartitionConfig {
        total_layers: config.total_layers,
        bytes_per_layer: config.bytes_per_layer,
        safety_mem_per_thread_mb: config.safety_mem_per_thread_mb,
    };
    let assignments = partition(&nodes, &partition_config);
    info!(workers = assignments.len(), "partition computed");

    let outboxes = outboxes.lock().unwrap();
    for ((id, _), assignment) in snapshot.iter().zip(assignments.iter()) {
        match encode_assignment(assignment) {
            Ok(bytes) => {
                if let Some(tx) = outboxes.get(id) {
                    if tx.send((MsgType::Config, bytes)).is_ok() {
                        info!(id, "partition sent");
                    }
                }
            }
            Err(err) => error!(id, %err, "failed to encode node assignment"),
        }
    }
}
