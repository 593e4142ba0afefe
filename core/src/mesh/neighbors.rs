use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::mesh::routing::NodeType;

/// Periodic liveness beacon. Carries what route selection needs to know
/// about the sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HelloBeacon {
    pub node_id: String,
    pub public_key: String,
    pub node_type: NodeType,
    pub blockchain_height: u64,
    /// Fraction of the UTXO set this peer holds, [0, 1].
    pub utxo_completeness: f64,
    /// Monotonic per-sender beacon counter.
    pub sequence: u64,
}

/// A directly reachable peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub node_id: String,
    pub public_key: String,
    pub node_type: NodeType,
    pub blockchain_height: u64,
    pub utxo_completeness: f64,
    /// Link quality from RSSI/SNR of recent receptions, [0, 1].
    pub link_quality: f64,
    pub last_seen: u64,
    pub sequence: u64,
}

/// Neighbor liveness table. Beacons refresh entries; silence beyond the
/// timeout evicts them.
pub struct NeighborTable {
    neighbors: RwLock<HashMap<String, Neighbor>>,
    timeout_ms: u64,
    max_neighbors: usize,
}

impl NeighborTable {
    pub fn new(timeout_ms: u64, max_neighbors: usize) -> Self {
        Self {
            neighbors: RwLock::new(HashMap::new()),
            timeout_ms,
            max_neighbors,
        }
    }

    /// Ingest a verified hello. Stale sequences refresh liveness but do
    /// not regress advertised state. At capacity the weakest link is
    /// displaced.
    pub fn observe_hello(&self, beacon: &HelloBeacon, link_quality: f64, now: u64) {
        let mut neighbors = self.neighbors.write();

        if let Some(existing) = neighbors.get_mut(&beacon.node_id) {
            existing.last_seen = now;
            // Smooth link quality so one lucky frame does not dominate.
            existing.link_quality = existing.link_quality * 0.7 + link_quality * 0.3;
            if beacon.sequence >= existing.sequence {
                existing.sequence = beacon.sequence;
                existing.node_type = beacon.node_type;
                existing.blockchain_height = beacon.blockchain_height;
                existing.utxo_completeness = beacon.utxo_completeness;
            }
            return;
        }

        if neighbors.len() >= self.max_neighbors {
            let weakest = neighbors
                .values()
                .min_by(|a, b| a.link_quality.total_cmp(&b.link_quality))
                .map(|n| n.node_id.clone());
            match weakest {
                Some(id) if link_quality > neighbors[&id].link_quality => {
                    neighbors.remove(&id);
                }
                _ => return, // table full of better links
            }
        }

        neighbors.insert(
            beacon.node_id.clone(),
            Neighbor {
                node_id: beacon.node_id.clone(),
                public_key: beacon.public_key.clone(),
                node_type: beacon.node_type,
                blockchain_height: beacon.blockchain_height,
                utxo_completeness: beacon.utxo_completeness,
                link_quality,
                last_seen: now,
                sequence: beacon.sequence,
            },
        );
    }

    /// Evict neighbors silent beyond the timeout; returns their ids so
    /// routes through them can be invalidated.
    pub fn evict_stale(&self, now: u64) -> Vec<String> {
        let mut neighbors = self.neighbors.write();
        let stale: Vec<String> = neighbors
            .values()
            .filter(|n| now.saturating_sub(n.last_seen) > self.timeout_ms)
            .map(|n| n.node_id.clone())
            .collect();
        for id in &stale {
            neighbors.remove(id);
        }
        stale
    }

    pub fn get(&self, node_id: &str) -> Option<Neighbor> {
        self.neighbors.read().get(node_id).cloned()
    }

    pub fn is_neighbor(&self, node_id: &str) -> bool {
        self.neighbors.read().contains_key(node_id)
    }

    pub fn public_key_of(&self, node_id: &str) -> Option<String> {
        self.neighbors.read().get(node_id).map(|n| n.public_key.clone())
    }

    pub fn list(&self) -> Vec<Neighbor> {
        self.neighbors.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.neighbors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon(id: &str, sequence: u64, height: u64) -> HelloBeacon {
        HelloBeacon {
            node_id: id.to_string(),
            public_key: "ab".repeat(32),
            node_type: NodeType::Full,
            blockchain_height: height,
            utxo_completeness: 1.0,
            sequence,
        }
    }

    #[test]
    fn test_hello_inserts_and_refreshes() {
        let table = NeighborTable::new(10_000, 8);
        table.observe_hello(&beacon("lora1a", 1, 5), 0.8, 100);
        assert!(table.is_neighbor("lora1a"));

        table.observe_hello(&beacon("lora1a", 2, 9), 0.8, 200);
        let n = table.get("lora1a").unwrap();
        assert_eq!(n.blockchain_height, 9);
        assert_eq!(n.last_seen, 200);
    }

    #[test]
    fn test_stale_sequence_refreshes_liveness_only() {
        let table = NeighborTable::new(10_000, 8);
        table.observe_hello(&beacon("lora1a", 5, 9), 0.8, 100);
        table.observe_hello(&beacon("lora1a", 3, 2), 0.8, 300);
        let n = table.get("lora1a").unwrap();
        assert_eq!(n.blockchain_height, 9, "stale beacon must not regress state");
        assert_eq!(n.last_seen, 300, "but it proves liveness");
    }

    #[test]
    fn test_eviction_after_timeout() {
        let table = NeighborTable::new(1_000, 8);
        table.observe_hello(&beacon("lora1a", 1, 1), 0.8, 0);
        table.observe_hello(&beacon("lora1b", 1, 1), 0.8, 900);

        let evicted = table.evict_stale(1_500);
        assert_eq!(evicted, vec!["lora1a".to_string()]);
        assert!(!table.is_neighbor("lora1a"));
        assert!(table.is_neighbor("lora1b"));
    }

    #[test]
    fn test_capacity_displaces_weakest_link() {
        let table = NeighborTable::new(10_000, 2);
        table.observe_hello(&beacon("lora1a", 1, 1), 0.9, 0);
        table.observe_hello(&beacon("lora1b", 1, 1), 0.2, 0);
        // Stronger link displaces the weakest.
        table.observe_hello(&beacon("lora1c", 1, 1), 0.5, 0);
        assert!(table.is_neighbor("lora1a"));
        assert!(!table.is_neighbor("lora1b"));
        assert!(table.is_neighbor("lora1c"));
        // Weaker link than anyone present is refused.
        table.observe_hello(&beacon("lora1d", 1, 1), 0.1, 0);
        assert!(!table.is_neighbor("lora1d"));
        assert_eq!(table.len(), 2);
    }
}
