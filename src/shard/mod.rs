//! Shard-local execution: the per-core service registry, the cross-core
//! request vocabulary, and the router that delivers an operation to the core
//! owning a resource.
//!
//! A [`ShardServices`] is built once per shard by the construction pipeline
//! and owned by that shard's runtime; every component that depends on another
//! service holds it through this context, with no ambient global lookup.
//! Other shards reach it only through [`ShardRouter::invoke_on`], which
//! acquires an admission permit for the call's tag (backpressure when the
//! budget is exhausted), sends the request into the owning shard's mailbox,
//! and suspends the calling task until the reply arrives.

pub mod mailbox;
pub mod table;

use std::sync::Arc;

use crate::error::Errc;
use crate::metrics;
use crate::node::domains::SmpGroup;
use crate::rpc::RpcServer;
use crate::services::{
    ConnectionCache, Controller, CoordinatorMapper, GroupManager, GroupRouter, LeadershipUpdate,
    MetadataCache, MetadataDissemination, PartitionManager, PartitionMetadata, QuotaManager,
    RaftGroupManager, Storage, TopicTable,
};
use crate::types::{BrokerShard, GroupId, NodeId, Ntp, ResourceId, ShardId};

pub use mailbox::{ShardMailbox, ShardMessage};
pub use table::ShardTable;

/// A validated control operation sent to the shard owning a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardRequest {
    /// Transfer leadership of a raft group to `target` (any member if None).
    TransferGroupLeadership {
        group: GroupId,
        target: Option<NodeId>,
    },
    /// Transfer leadership of the raft group backing a partition.
    TransferPartitionLeadership {
        ntp: Ntp,
        target: Option<NodeId>,
    },
    /// Change the replica placement of a partition. Routed to the controller
    /// shard.
    MovePartitionReplicas {
        ntp: Ntp,
        replicas: Vec<BrokerShard>,
    },
    /// Apply leadership updates to this shard's metadata cache.
    ApplyLeadershipUpdates { updates: Vec<LeadershipUpdate> },
    /// Begin hosting a partition on this shard (placement producer side).
    RegisterPartition {
        ntp: Ntp,
        group: GroupId,
        members: Vec<NodeId>,
        leader: Option<NodeId>,
    },
    /// Stop hosting a partition on this shard.
    RemovePartition { ntp: Ntp },
    /// Read the partition's status from its owning shard.
    PartitionStatus { ntp: Ntp },
}

/// Reply to one cross-core request.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardReply {
    Code(Errc),
    Status(Option<PartitionMetadata>),
}

impl ShardReply {
    /// The domain code of this reply, treating a status reply as success.
    pub fn code(&self) -> Errc {
        match self {
            ShardReply::Code(code) => *code,
            ShardReply::Status(_) => Errc::Success,
        }
    }
}

/// The per-core service registry: one instance of every service, owned by one
/// shard for its entire lifetime.
pub struct ShardServices {
    pub shard: ShardId,
    pub node_id: NodeId,
    pub table: Arc<ShardTable>,
    pub topics: Arc<TopicTable>,
    pub storage: Arc<Storage>,
    pub connections: Arc<ConnectionCache>,
    pub raft_manager: Arc<RaftGroupManager>,
    pub partition_manager: Arc<PartitionManager>,
    /// Activated only on the controller shard.
    pub controller: Option<Arc<Controller>>,
    pub metadata: Arc<MetadataCache>,
    pub dissemination: Arc<MetadataDissemination>,
    pub group_manager: Arc<GroupManager>,
    pub coordinator_mapper: Arc<CoordinatorMapper>,
    pub group_router: Arc<GroupRouter>,
    pub quota: Arc<QuotaManager>,
    pub internal_rpc: Arc<RpcServer>,
    pub kafka_rpc: Arc<RpcServer>,
}

impl std::fmt::Debug for ShardServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardServices")
            .field("shard", &self.shard)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Execute a validated request against this shard's services.
///
/// Used both by the shard's message loop and by the router's same-shard fast
/// path, so local and remote dispatch observe identical semantics: the
/// resource is re-resolved here, and "vanished since routing" (including a
/// detected reassignment in the shard table) is not-found, never a fatal
/// inconsistency.
pub async fn execute(services: &ShardServices, request: ShardRequest) -> ShardReply {
    match request {
        ShardRequest::TransferGroupLeadership { group, target } => {
            if services.table.shard_for(&ResourceId::Group(group)) != Some(services.shard) {
                return ShardReply::Code(Errc::NotFound);
            }
            let Some(consensus) = services.raft_manager.consensus_for(group) else {
                return ShardReply::Code(Errc::NotFound);
            };
            let code = consensus.transfer_leadership(target);
            if code.is_ok() {
                if let Some(ntp) = services.topics.ntp_for_group(group) {
                    services.dissemination.enqueue(LeadershipUpdate {
                        ntp,
                        group,
                        leader: consensus.leader(),
                        term: consensus.term(),
                    });
                }
            }
            ShardReply::Code(code)
        }

        ShardRequest::TransferPartitionLeadership { ntp, target } => {
            let rid = ResourceId::Partition(ntp.clone());
            if services.table.shard_for(&rid) != Some(services.shard) {
                return ShardReply::Code(Errc::NotFound);
            }
            let Some(partition) = services.partition_manager.get(&ntp) else {
                return ShardReply::Code(Errc::NotFound);
            };
            let code = partition.transfer_leadership(target);
            if code.is_ok() {
                services.dissemination.enqueue(LeadershipUpdate {
                    ntp,
                    group: partition.group(),
                    leader: partition.leader(),
                    term: partition.term(),
                });
            }
            ShardReply::Code(code)
        }

        ShardRequest::MovePartitionReplicas { ntp, replicas } => match &services.controller {
            Some(controller) => {
                ShardReply::Code(controller.move_partition_replicas(&ntp, &replicas))
            }
            None => ShardReply::Code(Errc::NotFound),
        },

        ShardRequest::ApplyLeadershipUpdates { updates } => {
            services.metadata.apply_leadership_updates(&updates);
            ShardReply::Code(Errc::Success)
        }

        ShardRequest::RegisterPartition {
            ntp,
            group,
            members,
            leader,
        } => {
            let partition = services
                .partition_manager
                .manage(ntp.clone(), group, members, leader);
            let replicas = services
                .topics
                .replicas_of(&ResourceId::Partition(ntp.clone()))
                .unwrap_or_default();
            services.metadata.set_partition(PartitionMetadata {
                ntp,
                group,
                leader: partition.leader(),
                term: partition.term(),
                replicas,
            });
            ShardReply::Code(Errc::Success)
        }

        ShardRequest::RemovePartition { ntp } => {
            services.partition_manager.remove(&ntp);
            services.metadata.remove(&ntp);
            ShardReply::Code(Errc::Success)
        }

        ShardRequest::PartitionStatus { ntp } => {
            let status = services.partition_manager.get(&ntp).map(|partition| {
                let replicas = services
                    .topics
                    .replicas_of(&ResourceId::Partition(ntp.clone()))
                    .unwrap_or_default();
                PartitionMetadata {
                    ntp,
                    group: partition.group(),
                    leader: partition.leader(),
                    term: partition.term(),
                    replicas,
                }
            });
            ShardReply::Status(status)
        }
    }
}

#[derive(Clone)]
struct LocalShard {
    shard: ShardId,
    services: Arc<ShardServices>,
}

/// Routes a request to the core owning it.
///
/// Cheap to clone. The variant held on a shard carries a same-shard fast
/// path; the control-plane variant always crosses a core boundary.
#[derive(Clone)]
pub struct ShardRouter {
    mailboxes: Arc<Vec<ShardMailbox>>,
    local: Option<LocalShard>,
}

impl ShardRouter {
    pub fn new(mailboxes: Vec<ShardMailbox>) -> Self {
        Self {
            mailboxes: Arc::new(mailboxes),
            local: None,
        }
    }

    /// A router that executes requests for `shard` in-process instead of
    /// through the mailbox.
    pub fn with_local(&self, shard: ShardId, services: Arc<ShardServices>) -> Self {
        Self {
            mailboxes: self.mailboxes.clone(),
            local: Some(LocalShard { shard, services }),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn local_shard(&self) -> Option<ShardId> {
        self.local.as_ref().map(|l| l.shard)
    }

    /// Deliver a request to `shard` and await its reply.
    ///
    /// If `shard` is the local shard, the request executes in-process.
    /// Otherwise an admission permit for `group` is held for the lifetime of
    /// the cross-core call; acquiring it waits when the budget is exhausted.
    /// This is the dispatcher's one suspension point: it yields the calling
    /// task until the owning core replies.
    pub async fn invoke_on(
        &self,
        shard: ShardId,
        group: &SmpGroup,
        request: ShardRequest,
    ) -> Result<ShardReply, Errc> {
        if shard as usize >= self.mailboxes.len() {
            return Err(Errc::NotFound);
        }

        if let Some(local) = &self.local {
            if local.shard == shard {
                return Ok(execute(&local.services, request).await);
            }
        }

        let _permit = group.acquire().await?;
        metrics::record_cross_shard_call(group.name());
        let reply_rx = self.mailboxes[shard as usize].send(request)?;
        reply_rx.await.map_err(|_| Errc::ShuttingDown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainBudgets;
    use crate::node::domains::SmpServiceGroups;

    #[tokio::test]
    async fn test_invoke_on_unknown_shard_is_not_found() {
        let router = ShardRouter::new(vec![]);
        let smp = SmpServiceGroups::create(&DomainBudgets::default()).unwrap();
        let err = router
            .invoke_on(
                3,
                &smp.cluster(),
                ShardRequest::ApplyLeadershipUpdates { updates: vec![] },
            )
            .await
            .unwrap_err();
        assert_eq!(err, Errc::NotFound);
    }

    #[tokio::test]
    async fn test_invoke_on_round_trips_through_mailbox() {
        let (mailbox, mut rx) = ShardMailbox::new(0);
        let router = ShardRouter::new(vec![mailbox]);
        let smp = SmpServiceGroups::create(&DomainBudgets::default()).unwrap();

        let loop_task = tokio::spawn(async move {
            let msg = rx.recv().await.unwrap();
            assert_eq!(
                msg.request,
                ShardRequest::RemovePartition {
                    ntp: Ntp::kafka("t", 0)
                }
            );
            msg.reply.send(ShardReply::Code(Errc::Success)).unwrap();
        });

        let reply = router
            .invoke_on(
                0,
                &smp.cluster(),
                ShardRequest::RemovePartition {
                    ntp: Ntp::kafka("t", 0),
                },
            )
            .await
            .unwrap();
        assert_eq!(reply.code(), Errc::Success);
        loop_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_invoke_on_dead_shard_is_shutting_down() {
        let (mailbox, rx) = ShardMailbox::new(0);
        drop(rx);
        let router = ShardRouter::new(vec![mailbox]);
        let smp = SmpServiceGroups::create(&DomainBudgets::default()).unwrap();

        let err = router
            .invoke_on(
                0,
                &smp.raft(),
                ShardRequest::ApplyLeadershipUpdates { updates: vec![] },
            )
            .await
            .unwrap_err();
        assert_eq!(err, Errc::ShuttingDown);
    }

    #[test]
    fn test_reply_code_helper() {
        assert_eq!(ShardReply::Code(Errc::NotFound).code(), Errc::NotFound);
        assert_eq!(ShardReply::Status(None).code(), Errc::Success);
    }
}
