//! Turns reported worker capacity into a contiguous, capacity-weighted layer assignment per
//! node, and the canonical wire encoding for that assignment.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One node's reported compute, in the order the coordinator observed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCompute {
    pub addr: String,
    pub ram_mb: u64,
    pub threads: u32,
}

/// What a worker is told to do: which layers it owns and who to forward activations to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAssignment {
    pub node_index: u32,
    pub layer_start: u32,
    pub layer_end: u32,
    pub array_bytes: u64,
    pub forward_addr: String,
    pub is_first: bool,
    pub is_last: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionConfig {
    pub total_layers: u32,
    pub bytes_per_layer: u64,
    pub safety_mem_per_thread_mb: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            total_layers: 0,
            bytes_per_layer: 0,
            safety_mem_per_thread_mb: 128,
        }
    }
}

fn usable_ram_mb(ram_mb: u64, threads: u32, safety_mem_per_thread_mb: u64) -> u64 {
    let reserved = safety_mem_per_thread_mb.saturating_mul(threads as u64);
    ram_mb.saturating_sub(reserved)
}

fn layer_capacity(usable_ram_mb: u64, bytes_per_layer: u64) -> u64 {
    if bytes_per_layer == 0 {
        return 0;
    }
    ((usable_ram_mb as u128 * 1_048_576) / bytes_per_layer as u128) as u64
}

/// Produces one [`NodeAssignment`] per input node. Deterministic: identical `nodes`/`config`
/// always produce bitwise-identical output.
pub fn partition(nodes: &[NodeCompute], config: &PartitionConfig) -> Vec<NodeAssignment> {
    if nodes.is_empty() {
        return Vec::new();
    }

    let capacities: Vec<u64> = nodes
        .iter()
        .map(|n| layer_capacity(usable_ram_mb(n.ram_mb, n.threads, config.safety_mem_per_thread_mb), config.bytes_per_layer))
        .collect();
    let total_capacity: u64 = capacities.iter().sum();

    if total_capacity < config.total_layers as u64 {
        warn!(
            total_capacity,
            total_layers = config.total_layers,
            "reported capacity is short of the model's layer count, proceeding with proportional assignment anyway"
        );
    }

    let n = nodes.len();
    let weights: Vec<f64> = if total_capacity == 0 {
        vec![1.0 / n as f64; n]
    } else {
        capacities.iter().map(|&c| c as f64 / total_capacity as f64).collect()
    };

    let mut counts: Vec<i64> = weights
        .iter()
        .map(|&w| (w * config.total_layers as f64).round() as i64)
        .collect();
    let assigned: i64 = counts.iter().sum();
    let remainder = config.total_layers as i64 - assigned;
    if remainder != 0 {
        let (max_idx, _) = weights
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .expect("nodes is non-empty");
        counts[max_idx] += remainder;
    }

    let mut assignments = Vec::with_capacity(n);
    let mut cursor: u32 = 0;
    for (i, node) in nodes.iter().enumerate() {
        let count = counts[i].max(0) as u32;
        let layer_start = cursor;
        let layer_end = cursor + count;
        cursor = layer_end;

        let is_last = i == n - 1;
        let forward_addr = if is_last { String::new() } else { nodes[i + 1].addr.clone() };

        assignments.push(NodeAssignment {
            node_index: i as u32,
            layer_start,
            layer_end,
            array_bytes: count as u64 * config.bytes_per_layer,
            forward_addr,
            is_first: i == 0,
            is_last,
        });
    }
    assignments
}

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("failed to encode node assignment: {0}")]
    Encode(String),
    #[error("failed to decode node assignment: {0}")]
    Decode(String),
}

/// The canonical `CONFIG` payload encoding: bincode over the serde representation above.
pub fn encode_assignment(assignment: &NodeAssignment) -> Result<Vec<u8>, PartitionError> {
    bincode::serde::encode_to_vec(assignment, bincode::config::standard()).map_err(|e| PartitionError::Encode(e.to_string()))
}

pub fn decode_assignment(buf: &[u8]) -> Result<NodeAssignment, PartitionError> {
    bincode::serde::decode_from_slice(buf, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| PartitionError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn node(addr: &str, ram_mb: u64, threads: u32) -> NodeCompute {
        NodeCompute { addr: addr.to_string(), ram_mb, threads }
    }

    #[test]
    fn two_worker_capacity_partition() {
        let nodes = vec![node("A", 4096, 4), node("B", 2048, 2)];
        let config = PartitionConfig {
            total_layers: 6,
            bytes_per_layer: 1_048_576,
            safety_mem_per_thread_mb: 128,
        };
        let result = partition(&nodes, &config);

        assert_eq!(result[0].layer_start, 0);
        assert_eq!(result[0].layer_end, 4);
        assert_eq!(result[1].layer_start, 4);
        assert_eq!(result[1].layer_end, 6);
        assert_eq!(result[0].forward_addr, "B");
        assert_eq!(result[1].forward_addr, "");
        assert_eq!((result[0].is_first, result[0].is_last), (true, false));
        assert_eq!((result[1].is_first, result[1].is_last), (false, true));
    }

    #[test]
    fn capacity_shortfall_still_covers_every_layer() {
        let nodes = vec![node("A", 64, 1), node("B", 64, 1)];
        let config = PartitionConfig {
            total_layers: 10,
            bytes_per_layer: 32 * 1_048_576,
            safety_mem_per_thread_mb: 128,
        };
        let result = partition(&nodes, &config);
        let total: u32 = result.iter().map(|a| a.layer_end - a.layer_start).sum();
        assert_eq!(total, 10);
        assert_eq!(result[0].layer_end - result[0].layer_start, 5);
        assert_eq!(result[1].layer_end - result[1].layer_start, 5);
    }

    #[test]
    fn assignments_are_contiguous_and_nonoverlapping() {
        let nodes = vec![node("A", 8192, 8), node("B", 4096, 4), node("C", 1024, 1)];
        let config = PartitionConfig {
            total_layers: 17,
            bytes_per_layer: 1_048_576,
            safety_mem_per_thread_mb: 64,
        };
        let result = partition(&nodes, &config);
        assert_eq!(result[0].layer_start, 0);
        for pair in result.windows(2) {
            assert_eq!(pair[0].layer_end, pair[1].layer_start);
        }
        assert_eq!(result.last().unwrap().layer_end, 17);
    }

    #[test]
    fn identical_inputs_produce_identical_outputs() {
        let nodes = vec![node("A", 4096, 4), node("B", 2048, 2), node("C", 1024, 1)];
        let config = PartitionConfig {
            total_layers: 13,
            bytes_per_layer: 2_097_152,
            safety_mem_per_thread_mb: 128,
        };
        assert_eq!(partition(&nodes, &config), partition(&nodes, &config));
    }

    #[test]
    fn node_assignment_round_trips_through_config_encoding() {
        let assignment = NodeAssignment {
            node_index: 1,
            layer_start: 4,
            layer_end: 6,
            array_bytes: 2 * 1_048_576,
            forward_addr: String::new(),
            is_first: false,
            is_last: true,
        };
        let encoded = encode_assignment(&assignment).unwrap();
        let decoded = decode_assignment(&encoded).unwrap();
        assert_eq!(assignment, decoded);
    }
}
