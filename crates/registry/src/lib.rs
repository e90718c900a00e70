//! The coordinator's worker bookkeeping: a single mutex guarding a map from node identity to
//! [`NodeInfo`], capped at a configured maximum.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Instant;

use tracing::debug;

/// Per-worker record. RAM and thread count start at zero until the first valid
/// `RESOURCE_REPORT` arrives.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub peer_addr: String,
    pub ram_bytes: u64,
    pub threads: u32,
    pub last_seen: Instant,
    pub alive: bool,
}

impl NodeInfo {
    pub fn new(peer_addr: impl Into<String>) -> Self {
        Self {
            peer_addr: peer_addr.into(),
            ram_bytes: 0,
            threads: 0,
            last_seen: Instant::now(),
            alive: true,
        }
    }
}

/// Mutex-protected `Id -> NodeInfo` map. All operations take and release the lock immediately;
/// none hold it across an await point because the registry itself is never `.await`ed on.
pub struct ConnectionRegistry<Id: Eq + Hash + Clone> {
    inner: Mutex<HashMap<Id, NodeInfo>>,
    max_nodes: usize,
}

impl<Id: Eq + Hash + Clone> ConnectionRegistry<Id> {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            max_nodes,
        }
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    /// Returns `false` without inserting if the registry is already at `max_nodes`.
    pub fn insert(&self, id: Id, info: NodeInfo) -> bool {
        let mut map = self.inner.lock().unwrap();
        if map.len() >= self.max_nodes {
            debug!(max_nodes = self.max_nodes, "registry at capacity, rejecting insert");
            return false;
        }
        map.insert(id, info);
        true
    }

    pub fn erase(&self, id: &Id) {
        self.inner.lock().unwrap().remove(id);
    }

    pub fn mark_dead(&self, id: &Id) {
        if let Some(info) = self.inner.lock().unwrap().get_mut(id) {
            info.alive = false;
        }
    }

    pub fn update(&self, id: &Id, f: impl FnOnce(&mut NodeInfo)) {
        if let Some(info) = self.inner.lock().unwrap().get_mut(id) {
            f(info);
        }
    }

    pub fn get(&self, id: &Id) -> Option<NodeInfo> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    /// An independent copy of the whole map, safe to iterate without holding the lock.
    pub fn snapshot(&self) -> Vec<(Id, NodeInfo)> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|(id, info)| (id.clone(), info.clone()))
            .collect()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use test_log::test;

    #[test]
    fn insert_rejects_past_capacity() {
        let reg = ConnectionRegistry::new(2);
        assert!(reg.insert(1u32, NodeInfo::new("a")));
        assert!(reg.insert(2u32, NodeInfo::new("b")));
        assert!(!reg.insert(3u32, NodeInfo::new("c")));
        assert_eq!(reg.size(), 2);
    }

    #[test]
    fn mark_dead_and_erase_affect_only_the_named_id() {
        let reg = ConnectionRegistry::new(4);
        reg.insert(1u32, NodeInfo::new("a"));
        reg.insert(2u32, NodeInfo::new("b"));
        reg.mark_dead(&1);
        assert!(!reg.get(&1).unwrap().alive);
        assert!(reg.get(&2).unwrap().alive);
        reg.erase(&1);
        assert!(reg.get(&1).is_none());
        assert_eq!(reg.size(), 1);
    }

    #[test]
    fn update_mutates_the_stored_record() {
        let reg = ConnectionRegistry::new(4);
        reg.insert(1u32, NodeInfo::new("a"));
        reg.update(&1, |info| {
            info.ram_bytes = 4096;
            info.threads = 4;
        });
        let info = reg.get(&1).unwrap();
        assert_eq!(info.ram_bytes, 4096);
        assert_eq!(info.threads, 4);
    }

    #[test]
    fn snapshot_is_independent_of_later_mutation() {
        let reg = ConnectionRegistry::new(4);
        reg.insert(1u32, NodeInfo::new("a"));
        let snap = reg.snapshot();
        reg.erase(&1);
        assert_eq!(snap.len(), 1);
        assert_eq!(reg.size(), 0);
    }

    #[test]
    fn concurrent_inserts_and_erases_converge_to_a_consistent_state() {
        let reg = Arc::new(ConnectionRegistry::new(1000));
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let reg = Arc::clone(&reg);
            handles.push(thread::spawn(move || {
                for i in 0..50u32 {
                    let id = t * 50 + i;
                    reg.insert(id, NodeInfo::new(format!("node-{id}")));
                    if i % 2 == 0 {
                        reg.erase(&id);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Every even-offset id was erased after insert, every odd-offset id survives.
        assert_eq!(reg.size(), 200);
    }
}
