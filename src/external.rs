//! External collaborators (§1): the core only assumes an ownership oracle,
//! a partition map, and a table schema provider. Everything else (RPC/HTTP
//! transport, inter-node routing, durability, trigger dispatch, CLI/admin
//! surfaces) lives outside the core and is not modeled here.

use std::collections::HashSet;
use std::sync::RwLock;

use crate::partition::PartitionId;

/// Answers "does this node own partition P?"
pub trait OwnershipOracle: Send + Sync {
    fn owns(&self, partition: PartitionId) -> bool;
}

/// Yields the set of partition ids assigned to this node.
pub trait PartitionMap: Send + Sync {
    fn assigned_partitions(&self) -> Vec<PartitionId>;
}

/// A single-node, in-memory implementation used by tests and by a
/// non-distributed deployment: this node owns exactly the partitions it has
/// been told about.
#[derive(Default)]
pub struct StaticPartitionMap {
    partitions: RwLock<HashSet<PartitionId>>,
}

impl StaticPartitionMap {
    pub fn new(partitions: impl IntoIterator<Item = PartitionId>) -> StaticPartitionMap {
        StaticPartitionMap { partitions: RwLock::new(partitions.into_iter().collect()) }
    }

    pub fn add(&self, partition: PartitionId) {
        self.partitions.write().unwrap().insert(partition);
    }

    pub fn remove(&self, partition: PartitionId) {
        self.partitions.write().unwrap().remove(&partition);
    }
}

impl OwnershipOracle for StaticPartitionMap {
    fn owns(&self, partition: PartitionId) -> bool {
        self.partitions.read().unwrap().contains(&partition)
    }
}

impl PartitionMap for StaticPartitionMap {
    fn assigned_partitions(&self) -> Vec<PartitionId> {
        let mut ids: Vec<_> = self.partitions.read().unwrap().iter().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// `partition = hash(personId) mod partitionMax` (§5).
pub fn partition_for_id(external_id: &str, partition_max: u64) -> PartitionId {
    use std::hash::{Hash, Hasher};
    let mut hasher = fnv::FnvHasher::default();
    external_id.hash(&mut hasher);
    hasher.finish() % partition_max.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_map_reflects_additions_and_removals() {
        let map = StaticPartitionMap::new([0, 1]);
        assert!(map.owns(0));
        assert!(!map.owns(2));
        map.add(2);
        assert!(map.owns(2));
        map.remove(0);
        assert!(!map.owns(0));
        assert_eq!(map.assigned_partitions(), vec![1, 2]);
    }

    #[test]
    fn partition_assignment_is_stable() {
        let p1 = partition_for_id("alice", 16);
        let p2 = partition_for_id("alice", 16);
        assert_eq!(p1, p2);
        assert!(p1 < 16);
    }
}
