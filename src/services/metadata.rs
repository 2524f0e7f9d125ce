//! Per-shard metadata cache and leadership dissemination.
//!
//! Every shard keeps its own copy of partition metadata (leader, term,
//! replica set). Leadership changes observed on one shard are fanned out to
//! every shard's cache through the cross-core router, under the cluster
//! admission group. Updates carry the leader's term; a stale update never
//! overwrites a newer one.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::NodeError;
use crate::node::domains::SmpGroup;
use crate::shard::{ShardRequest, ShardRouter};
use crate::types::{BrokerShard, GroupId, NodeId, Ntp, ShardId};

/// How often queued leadership updates are flushed to the other shards.
const DISSEMINATION_INTERVAL: Duration = Duration::from_millis(50);

/// One observed leadership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipUpdate {
    pub ntp: Ntp,
    pub group: GroupId,
    pub leader: Option<NodeId>,
    pub term: u64,
}

/// Cached metadata for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub ntp: Ntp,
    pub group: GroupId,
    pub leader: Option<NodeId>,
    pub term: u64,
    pub replicas: Vec<BrokerShard>,
}

/// Shard-local replica of partition metadata.
#[derive(Default)]
pub struct MetadataCache {
    partitions: DashMap<Ntp, PartitionMetadata>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace the full metadata record for a partition.
    pub fn set_partition(&self, metadata: PartitionMetadata) {
        self.partitions.insert(metadata.ntp.clone(), metadata);
    }

    /// Apply leadership updates, ignoring any that are stale by term.
    pub fn apply_leadership_updates(&self, updates: &[LeadershipUpdate]) {
        for update in updates {
            match self.partitions.get_mut(&update.ntp) {
                Some(mut entry) => {
                    if update.term >= entry.term {
                        entry.leader = update.leader;
                        entry.term = update.term;
                    }
                }
                None => {
                    self.partitions.insert(
                        update.ntp.clone(),
                        PartitionMetadata {
                            ntp: update.ntp.clone(),
                            group: update.group,
                            leader: update.leader,
                            term: update.term,
                            replicas: Vec::new(),
                        },
                    );
                }
            }
        }
    }

    pub fn leader(&self, ntp: &Ntp) -> Option<NodeId> {
        self.partitions.get(ntp).and_then(|p| p.leader)
    }

    pub fn snapshot(&self, ntp: &Ntp) -> Option<PartitionMetadata> {
        self.partitions.get(ntp).map(|p| p.clone())
    }

    pub fn topic_partitions(&self, namespace: &str, topic: &str) -> Vec<PartitionMetadata> {
        let mut out: Vec<PartitionMetadata> = self
            .partitions
            .iter()
            .filter(|p| p.ntp.namespace == namespace && p.ntp.topic == topic)
            .map(|p| p.clone())
            .collect();
        out.sort_by_key(|p| p.ntp.partition);
        out
    }

    pub fn remove(&self, ntp: &Ntp) {
        self.partitions.remove(ntp);
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// Fans leadership updates out to every shard's metadata cache.
pub struct MetadataDissemination {
    shard: ShardId,
    router: ShardRouter,
    smp: SmpGroup,
    pending: Arc<Mutex<Vec<LeadershipUpdate>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MetadataDissemination {
    pub fn new(shard: ShardId, router: ShardRouter, smp: SmpGroup) -> Self {
        Self {
            shard,
            router,
            smp,
            pending: Arc::new(Mutex::new(Vec::new())),
            task: Mutex::new(None),
        }
    }

    /// Queue one update for the next dissemination round.
    pub fn enqueue(&self, update: LeadershipUpdate) {
        self.pending.lock().unwrap().push(update);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Drain and fan out everything queued so far.
    pub async fn flush(&self) {
        flush_pending(self.shard, &self.router, &self.smp, &self.pending).await;
    }

    /// Begin periodic dissemination on the current (shard) runtime.
    pub fn start(&self) {
        let shard = self.shard;
        let router = self.router.clone();
        let smp = self.smp.clone();
        let pending = self.pending.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(DISSEMINATION_INTERVAL);
            loop {
                interval.tick().await;
                flush_pending(shard, &router, &smp, &pending).await;
            }
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Stop periodic dissemination. Queued updates are dropped; on shutdown
    /// the caches are being torn down anyway.
    pub fn stop(&self) -> Result<(), NodeError> {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
        Ok(())
    }
}

async fn flush_pending(
    shard: ShardId,
    router: &ShardRouter,
    smp: &SmpGroup,
    pending: &Mutex<Vec<LeadershipUpdate>>,
) {
    let updates: Vec<LeadershipUpdate> = std::mem::take(&mut *pending.lock().unwrap());
    if updates.is_empty() {
        return;
    }
    debug!(shard, updates = updates.len(), "Disseminating leadership updates");
    let sends = (0..router.shard_count() as ShardId).map(|target| {
        let updates = updates.clone();
        async move {
            let reply = router
                .invoke_on(target, smp, ShardRequest::ApplyLeadershipUpdates { updates })
                .await;
            (target, reply)
        }
    });
    for (target, reply) in join_all(sends).await {
        if let Err(code) = reply {
            warn!(
                shard,
                target,
                code = %code,
                "Leadership dissemination to shard failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(topic: &str, partition: i32, leader: NodeId, term: u64) -> LeadershipUpdate {
        LeadershipUpdate {
            ntp: Ntp::kafka(topic, partition),
            group: 1,
            leader: Some(leader),
            term,
        }
    }

    #[test]
    fn test_apply_creates_and_updates_entries() {
        let cache = MetadataCache::new();
        cache.apply_leadership_updates(&[update("orders", 0, 1, 1)]);
        assert_eq!(cache.leader(&Ntp::kafka("orders", 0)), Some(1));

        cache.apply_leadership_updates(&[update("orders", 0, 2, 2)]);
        assert_eq!(cache.leader(&Ntp::kafka("orders", 0)), Some(2));
    }

    #[test]
    fn test_stale_update_ignored() {
        let cache = MetadataCache::new();
        cache.apply_leadership_updates(&[update("orders", 0, 2, 5)]);
        cache.apply_leadership_updates(&[update("orders", 0, 1, 3)]);
        let meta = cache.snapshot(&Ntp::kafka("orders", 0)).unwrap();
        assert_eq!(meta.leader, Some(2));
        assert_eq!(meta.term, 5);
    }

    #[test]
    fn test_topic_partitions_sorted() {
        let cache = MetadataCache::new();
        cache.apply_leadership_updates(&[
            update("orders", 2, 1, 1),
            update("orders", 0, 1, 1),
            update("other", 0, 1, 1),
        ]);
        let parts = cache.topic_partitions("kafka", "orders");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].ntp.partition, 0);
        assert_eq!(parts[1].ntp.partition, 2);
    }

    #[test]
    fn test_set_partition_seeds_replicas() {
        let cache = MetadataCache::new();
        cache.set_partition(PartitionMetadata {
            ntp: Ntp::kafka("orders", 0),
            group: 7,
            leader: Some(1),
            term: 1,
            replicas: vec![BrokerShard { node_id: 1, shard: 0 }],
        });
        let meta = cache.snapshot(&Ntp::kafka("orders", 0)).unwrap();
        assert_eq!(meta.replicas.len(), 1);
        cache.remove(&Ntp::kafka("orders", 0));
        assert!(cache.is_empty());
    }
}
