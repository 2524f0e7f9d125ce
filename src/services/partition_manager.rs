//! Per-shard partition manager.
//!
//! Owns the partition objects hosted on this shard and resolves a
//! topic-partition to its in-memory object. A partition wraps the consensus
//! instance of its backing raft group; leadership operations delegate there.
//!
//! `get` re-resolves on every call: the control dispatcher looks a resource
//! up once in the shard table and a second time here on the owning shard, and
//! treats "vanished in between" as not-found rather than as an inconsistency.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{Errc, NodeError};
use crate::services::raft_manager::{Consensus, RaftGroupManager};
use crate::services::storage::Storage;
use crate::types::{GroupId, NodeId, Ntp, ShardId};

/// One hosted partition: a topic-partition bound to its raft group.
pub struct Partition {
    ntp: Ntp,
    group: GroupId,
    consensus: Arc<Consensus>,
}

impl Partition {
    pub fn ntp(&self) -> &Ntp {
        &self.ntp
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.consensus.leader()
    }

    pub fn term(&self) -> u64 {
        self.consensus.term()
    }

    /// Transfer leadership of the backing raft group.
    pub fn transfer_leadership(&self, target: Option<NodeId>) -> Errc {
        self.consensus.transfer_leadership(target)
    }
}

/// Directory of partitions hosted on one shard.
pub struct PartitionManager {
    shard: ShardId,
    storage: Arc<Storage>,
    raft: Arc<RaftGroupManager>,
    partitions: DashMap<Ntp, Arc<Partition>>,
    started: AtomicBool,
}

impl PartitionManager {
    pub fn new(shard: ShardId, storage: Arc<Storage>, raft: Arc<RaftGroupManager>) -> Self {
        Self {
            shard,
            storage,
            raft,
            partitions: DashMap::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!(shard = self.shard, "Partition manager started");
    }

    pub fn stop(&self) -> Result<(), NodeError> {
        self.started.store(false, Ordering::SeqCst);
        debug!(
            shard = self.shard,
            partitions = self.partitions.len(),
            "Partition manager stopped"
        );
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Begin managing a partition on this shard, creating its raft group.
    pub fn manage(
        &self,
        ntp: Ntp,
        group: GroupId,
        members: Vec<NodeId>,
        leader: Option<NodeId>,
    ) -> Arc<Partition> {
        let consensus = self.raft.register_group(group, members, leader);
        let partition = Arc::new(Partition {
            ntp: ntp.clone(),
            group,
            consensus,
        });
        self.partitions.insert(ntp, partition.clone());
        partition
    }

    /// Resolve the in-memory partition object, if it is (still) hosted here.
    pub fn get(&self, ntp: &Ntp) -> Option<Arc<Partition>> {
        self.partitions.get(ntp).map(|p| p.clone())
    }

    /// Stop hosting a partition and drop its raft group.
    pub fn remove(&self, ntp: &Ntp) -> Option<Arc<Partition>> {
        let removed = self.partitions.remove(ntp).map(|(_, p)| p);
        if let Some(p) = &removed {
            self.raft.remove_group(p.group());
        }
        removed
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainBudgets;
    use crate::node::domains::{RAFT_DOMAIN, SchedulingGroups};

    fn make_manager() -> (PartitionManager, tempfile::TempDir, SchedulingGroups) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(0, dir.path()).unwrap());
        let groups = SchedulingGroups::create(
            &SchedulingGroups::default_specs(&DomainBudgets::default()),
            1,
        )
        .unwrap();
        let raft = Arc::new(RaftGroupManager::new(
            1,
            0,
            groups.group(RAFT_DOMAIN).unwrap(),
            storage.clone(),
        ));
        (PartitionManager::new(0, storage, raft), dir, groups)
    }

    #[test]
    fn test_manage_and_get() {
        let (pm, _dir, _groups) = make_manager();
        let ntp = Ntp::kafka("orders", 0);
        pm.manage(ntp.clone(), 7, vec![1, 2, 3], None);

        let partition = pm.get(&ntp).unwrap();
        assert_eq!(partition.ntp(), &ntp);
        assert_eq!(partition.group(), 7);
        assert_eq!(partition.leader(), Some(1));
        assert!(pm.get(&Ntp::kafka("orders", 1)).is_none());
    }

    #[test]
    fn test_transfer_leadership_via_partition() {
        let (pm, _dir, _groups) = make_manager();
        let ntp = Ntp::kafka("orders", 0);
        let partition = pm.manage(ntp, 7, vec![1, 2], None);
        assert_eq!(partition.transfer_leadership(Some(2)), Errc::Success);
        assert_eq!(partition.leader(), Some(2));
    }

    #[test]
    fn test_remove_drops_partition_and_group() {
        let (pm, _dir, _groups) = make_manager();
        let ntp = Ntp::kafka("orders", 0);
        pm.manage(ntp.clone(), 7, vec![1], None);
        assert_eq!(pm.partition_count(), 1);

        assert!(pm.remove(&ntp).is_some());
        assert!(pm.get(&ntp).is_none());
        assert_eq!(pm.partition_count(), 0);
        assert!(pm.remove(&ntp).is_none());
    }

    #[test]
    fn test_lifecycle() {
        let (pm, _dir, _groups) = make_manager();
        pm.start();
        assert!(pm.is_started());
        pm.stop().unwrap();
        assert!(!pm.is_started());
    }
}
