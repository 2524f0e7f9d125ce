//! Consumer group membership and coordinator routing.
//!
//! Group coordination state for a consumer group lives with one partition of
//! the internal coordination topic; [`CoordinatorMapper`] maps a group id to
//! that partition on a consistent-hash ring, and [`GroupRouter`] resolves the
//! partition to its owning shard through the shard table. Routing never
//! caches the owning shard: placement may change between calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use conhash::{ConsistentHash, Node};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{NodeError, NodeResult};
use crate::shard::table::ShardTable;
use crate::types::{Ntp, ResourceId, ShardId};

/// Internal topic whose partitions host group coordination state.
pub const COORDINATE_TOPIC: &str = "coordinate";

/// Membership state of one consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerGroup {
    pub members: Vec<String>,
    pub generation: i32,
}

/// Per-shard consumer group manager.
pub struct GroupManager {
    shard: ShardId,
    groups: DashMap<String, ConsumerGroup>,
    started: AtomicBool,
}

impl GroupManager {
    pub fn new(shard: ShardId) -> Self {
        Self {
            shard,
            groups: DashMap::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!(shard = self.shard, "Group manager started");
    }

    pub fn stop(&self) -> Result<(), NodeError> {
        self.started.store(false, Ordering::SeqCst);
        debug!(shard = self.shard, groups = self.groups.len(), "Group manager stopped");
        Ok(())
    }

    /// Add a member, bumping the group generation.
    pub fn join(&self, group_id: &str, member_id: &str) -> i32 {
        let mut group = self
            .groups
            .entry(group_id.to_string())
            .or_insert(ConsumerGroup {
                members: Vec::new(),
                generation: 0,
            });
        if !group.members.iter().any(|m| m == member_id) {
            group.members.push(member_id.to_string());
        }
        group.generation += 1;
        group.generation
    }

    /// Remove a member, bumping the generation; empty groups are dropped.
    pub fn leave(&self, group_id: &str, member_id: &str) {
        let empty = {
            let Some(mut group) = self.groups.get_mut(group_id) else {
                return;
            };
            group.members.retain(|m| m != member_id);
            group.generation += 1;
            group.members.is_empty()
        };
        if empty {
            self.groups.remove(group_id);
        }
    }

    pub fn describe(&self, group_id: &str) -> Option<ConsumerGroup> {
        self.groups.get(group_id).map(|g| g.clone())
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CoordinatorPartition(i32);

impl Node for CoordinatorPartition {
    fn name(&self) -> String {
        format!("{}/{}", COORDINATE_TOPIC, self.0)
    }
}

/// Maps a group id to the coordination-topic partition hosting its state.
pub struct CoordinatorMapper {
    ring: ConsistentHash<CoordinatorPartition>,
    partition_count: i32,
}

impl CoordinatorMapper {
    pub fn new(partition_count: i32) -> NodeResult<Self> {
        if partition_count <= 0 {
            return Err(NodeError::Config(format!(
                "coordination topic needs at least one partition, got {}",
                partition_count
            )));
        }
        let mut ring = ConsistentHash::new();
        for partition in 0..partition_count {
            ring.add(&CoordinatorPartition(partition), 10);
        }
        Ok(Self {
            ring,
            partition_count,
        })
    }

    pub fn partition_count(&self) -> i32 {
        self.partition_count
    }

    /// The coordination partition for a group. Deterministic for a fixed
    /// partition count.
    pub fn ntp_for(&self, group_id: &str) -> Ntp {
        let partition = self
            .ring
            .get_str(group_id)
            .map(|p| p.0)
            .unwrap_or_default();
        Ntp::internal(COORDINATE_TOPIC, partition)
    }
}

/// Resolves a group id to the shard owning its coordination partition.
pub struct GroupRouter {
    mapper: Arc<CoordinatorMapper>,
    table: Arc<ShardTable>,
}

impl GroupRouter {
    pub fn new(mapper: Arc<CoordinatorMapper>, table: Arc<ShardTable>) -> Self {
        Self { mapper, table }
    }

    pub fn coordinator_ntp(&self, group_id: &str) -> Ntp {
        self.mapper.ntp_for(group_id)
    }

    /// The shard hosting the group's coordinator, if the coordination
    /// partition is placed on this node. Re-resolved on every call.
    pub fn shard_for_group(&self, group_id: &str) -> Option<ShardId> {
        let ntp = self.mapper.ntp_for(group_id);
        self.table.shard_for(&ResourceId::Partition(ntp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_leave() {
        let mgr = GroupManager::new(0);
        assert_eq!(mgr.join("g1", "m1"), 1);
        assert_eq!(mgr.join("g1", "m2"), 2);
        // Rejoining does not duplicate the member but bumps the generation.
        assert_eq!(mgr.join("g1", "m1"), 3);

        let group = mgr.describe("g1").unwrap();
        assert_eq!(group.members, vec!["m1", "m2"]);

        mgr.leave("g1", "m1");
        mgr.leave("g1", "m2");
        assert!(mgr.describe("g1").is_none());
        assert_eq!(mgr.group_count(), 0);
    }

    #[test]
    fn test_mapper_deterministic() {
        let mapper = CoordinatorMapper::new(8).unwrap();
        let a = mapper.ntp_for("my-group");
        let b = mapper.ntp_for("my-group");
        assert_eq!(a, b);
        assert_eq!(a.namespace, crate::types::INTERNAL_NAMESPACE);
        assert_eq!(a.topic, COORDINATE_TOPIC);
        assert!(a.partition >= 0 && a.partition < 8);
    }

    #[test]
    fn test_mapper_rejects_zero_partitions() {
        assert!(CoordinatorMapper::new(0).is_err());
        assert!(CoordinatorMapper::new(-1).is_err());
    }

    #[test]
    fn test_router_resolves_through_shard_table() {
        let mapper = Arc::new(CoordinatorMapper::new(4).unwrap());
        let table = Arc::new(ShardTable::new());
        let router = GroupRouter::new(mapper.clone(), table.clone());

        // Nothing placed yet: absent, not shard zero.
        assert_eq!(router.shard_for_group("g"), None);

        let ntp = router.coordinator_ntp("g");
        table.assign(ResourceId::Partition(ntp), 3);
        assert_eq!(router.shard_for_group("g"), Some(3));
    }

    #[test]
    fn test_router_reresolves_after_move() {
        let mapper = Arc::new(CoordinatorMapper::new(1).unwrap());
        let table = Arc::new(ShardTable::new());
        let router = GroupRouter::new(mapper.clone(), table.clone());

        let ntp = router.coordinator_ntp("g");
        table.assign(ResourceId::Partition(ntp.clone()), 0);
        assert_eq!(router.shard_for_group("g"), Some(0));

        table.assign(ResourceId::Partition(ntp), 2);
        assert_eq!(router.shard_for_group("g"), Some(2));
    }
}
