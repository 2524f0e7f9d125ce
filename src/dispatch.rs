//! Cross-shard control dispatcher.
//!
//! Executes an administrative operation against the core owning the named
//! resource:
//!
//! 1. Validate the resource identifier and arguments; malformed input fails
//!    as a client error and never reaches the shard table.
//! 2. Resolve the owning shard; absence is not-found, never a default shard.
//! 3. Execute in-process when the owner is the current shard, otherwise send
//!    a cross-core message and await the reply (the dispatcher's one
//!    suspension point).
//! 4. The owning shard re-resolves the resource locally; "vanished between
//!    routing and execution" is not-found, not a fatal inconsistency.
//! 5. The domain result is an error code from a closed taxonomy, mapped here
//!    to a protocol-neutral classification.

use std::sync::Arc;

use tracing::info;

use crate::error::{DispatchError, Errc};
use crate::metrics;
use crate::node::domains::{SmpGroup, SmpServiceGroups};
use crate::services::controller::CONTROLLER_SHARD;
use crate::services::{PartitionMetadata, TopicTable};
use crate::shard::{ShardReply, ShardRequest, ShardRouter, ShardTable};
use crate::types::{BrokerShard, GroupId, NodeId, Ntp, ResourceId};

/// Routes validated control operations to owning shards and translates
/// domain error codes into the client-facing classification.
#[derive(Clone)]
pub struct ControlDispatcher {
    table: Arc<ShardTable>,
    topics: Arc<TopicTable>,
    router: ShardRouter,
    smp: SmpServiceGroups,
}

impl ControlDispatcher {
    pub fn new(
        table: Arc<ShardTable>,
        topics: Arc<TopicTable>,
        router: ShardRouter,
        smp: SmpServiceGroups,
    ) -> Self {
        Self {
            table,
            topics,
            router,
            smp,
        }
    }

    /// Transfer leadership of a raft group to `target` (any member if None).
    pub async fn transfer_group_leadership(
        &self,
        group: GroupId,
        target: Option<NodeId>,
    ) -> Result<(), DispatchError> {
        let rid = ResourceId::Group(group);
        let result = self
            .transfer(rid, target, format!("Raft group {} not found", group))
            .await;
        record_outcome(&result);
        result
    }

    /// Transfer leadership of the raft group backing a topic-partition.
    pub async fn transfer_partition_leadership(
        &self,
        ntp: Ntp,
        target: Option<NodeId>,
    ) -> Result<(), DispatchError> {
        if ntp.partition < 0 {
            let result = Err(DispatchError::BadRequest(format!(
                "Invalid partition id {}",
                ntp.partition
            )));
            record_outcome(&result);
            return result;
        }
        let not_found = format!("Topic partition {}:{} not found", ntp.topic, ntp.partition);
        let rid = ResourceId::Partition(ntp);
        let result = self.transfer(rid, target, not_found).await;
        record_outcome(&result);
        result
    }

    async fn transfer(
        &self,
        rid: ResourceId,
        target: Option<NodeId>,
        not_found: String,
    ) -> Result<(), DispatchError> {
        self.validate_target_membership(&rid, target)?;

        let Some(shard) = self.table.shard_for(&rid) else {
            return Err(DispatchError::NotFound(not_found));
        };

        info!(resource = %rid, ?target, shard, "Leadership transfer request");

        let request = match rid {
            ResourceId::Group(group) => ShardRequest::TransferGroupLeadership { group, target },
            ResourceId::Partition(ntp) => {
                ShardRequest::TransferPartitionLeadership { ntp, target }
            }
        };
        self.dispatch(shard, &self.smp.raft(), request, not_found)
            .await
            .map(|_| ())
    }

    /// Change the replica placement of a partition.
    ///
    /// An empty target replica set is rejected as a client error before any
    /// shard-table lookup. The operation is routed to the controller shard,
    /// which owns placement state.
    pub async fn move_partition_replicas(
        &self,
        ntp: Ntp,
        replicas: Vec<BrokerShard>,
    ) -> Result<(), DispatchError> {
        let result = self.move_replicas_inner(ntp, replicas).await;
        record_outcome(&result);
        result
    }

    async fn move_replicas_inner(
        &self,
        ntp: Ntp,
        replicas: Vec<BrokerShard>,
    ) -> Result<(), DispatchError> {
        if ntp.partition < 0 {
            return Err(DispatchError::BadRequest(format!(
                "Invalid partition id {}",
                ntp.partition
            )));
        }
        if replicas.is_empty() {
            return Err(DispatchError::BadRequest(
                "Partition movement requires target replica set".to_string(),
            ));
        }

        info!(ntp = %ntp, ?replicas, "Replica set change request");

        let not_found = format!("Topic partition {}:{} not found", ntp.topic, ntp.partition);
        self.dispatch(
            CONTROLLER_SHARD,
            &self.smp.cluster(),
            ShardRequest::MovePartitionReplicas { ntp, replicas },
            not_found,
        )
        .await
        .map(|_| ())
    }

    /// Read a partition's status from its owning shard.
    pub async fn partition_status(&self, ntp: Ntp) -> Result<PartitionMetadata, DispatchError> {
        let not_found = format!("Topic partition {}:{} not found", ntp.topic, ntp.partition);
        let rid = ResourceId::Partition(ntp.clone());
        let Some(shard) = self.table.shard_for(&rid) else {
            record_outcome::<PartitionMetadata>(&Err(DispatchError::NotFound(not_found.clone())));
            return Err(DispatchError::NotFound(not_found));
        };

        let reply = self
            .dispatch(
                shard,
                &self.smp.kafka(),
                ShardRequest::PartitionStatus { ntp },
                not_found.clone(),
            )
            .await?;
        match reply {
            ShardReply::Status(Some(status)) => {
                metrics::record_dispatch("success");
                Ok(status)
            }
            _ => {
                metrics::record_dispatch("not_found");
                Err(DispatchError::NotFound(not_found))
            }
        }
    }

    /// A leadership-transfer target naming a node outside the replica set is
    /// rejected client-side, before any cross-shard dispatch.
    fn validate_target_membership(
        &self,
        rid: &ResourceId,
        target: Option<NodeId>,
    ) -> Result<(), DispatchError> {
        let Some(target) = target else {
            return Ok(());
        };
        if target < 0 {
            return Err(DispatchError::BadRequest(format!(
                "Invalid target node id {}",
                target
            )));
        }
        if let Some(replicas) = self.topics.replicas_of(rid) {
            if !replicas.iter().any(|b| b.node_id == target) {
                return Err(DispatchError::BadRequest(format!(
                    "Target node {} is not a member of the replica set",
                    target
                )));
            }
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        shard: crate::types::ShardId,
        group: &SmpGroup,
        request: ShardRequest,
        not_found: String,
    ) -> Result<ShardReply, DispatchError> {
        let reply = self
            .router
            .invoke_on(shard, group, request)
            .await
            .map_err(DispatchError::Operation)?;
        match reply.code() {
            Errc::Success => Ok(reply),
            Errc::NotFound => Err(DispatchError::NotFound(not_found)),
            code => Err(DispatchError::Operation(code)),
        }
    }
}

fn record_outcome<T>(result: &Result<T, DispatchError>) {
    let outcome = match result {
        Ok(_) => "success",
        Err(DispatchError::BadRequest(_)) => "bad_request",
        Err(DispatchError::NotFound(_)) => "not_found",
        Err(DispatchError::Operation(_)) => "operation_failed",
    };
    metrics::record_dispatch(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainBudgets;
    use crate::node::domains::SmpServiceGroups;
    use crate::shard::ShardRouter;

    fn dispatcher_without_shards() -> ControlDispatcher {
        ControlDispatcher::new(
            Arc::new(ShardTable::new()),
            Arc::new(TopicTable::new()),
            ShardRouter::new(vec![]),
            SmpServiceGroups::create(&DomainBudgets::default()).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_absent_group_is_not_found_before_any_dispatch() {
        let d = dispatcher_without_shards();
        let err = d.transfer_group_leadership(7, Some(3)).await.unwrap_err();
        assert_eq!(
            err,
            DispatchError::NotFound("Raft group 7 not found".to_string())
        );
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn test_empty_replica_set_rejected_before_table_lookup() {
        let d = dispatcher_without_shards();
        let err = d
            .move_partition_replicas(Ntp::kafka("orders", 0), vec![])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::BadRequest("Partition movement requires target replica set".to_string())
        );
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_negative_partition_rejected() {
        let d = dispatcher_without_shards();
        let err = d
            .transfer_partition_leadership(Ntp::kafka("orders", -1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_target_outside_replica_set_rejected_before_dispatch() {
        let table = Arc::new(ShardTable::new());
        let topics = Arc::new(TopicTable::new());
        topics.set_assignment(
            Ntp::kafka("orders", 0),
            7,
            vec![BrokerShard { node_id: 1, shard: 0 }, BrokerShard { node_id: 2, shard: 1 }],
        );
        // The group is in the table, but no shard exists to serve it; a
        // membership failure must reject before routing is even attempted.
        table.assign(ResourceId::Group(7), 0);

        let d = ControlDispatcher::new(
            table,
            topics,
            ShardRouter::new(vec![]),
            SmpServiceGroups::create(&DomainBudgets::default()).unwrap(),
        );
        let err = d.transfer_group_leadership(7, Some(9)).await.unwrap_err();
        assert_eq!(
            err,
            DispatchError::BadRequest(
                "Target node 9 is not a member of the replica set".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_negative_target_rejected() {
        let d = dispatcher_without_shards();
        let err = d.transfer_group_leadership(7, Some(-2)).await.unwrap_err();
        assert_eq!(
            err,
            DispatchError::BadRequest("Invalid target node id -2".to_string())
        );
    }

    #[tokio::test]
    async fn test_absent_partition_status_is_not_found() {
        let d = dispatcher_without_shards();
        let err = d
            .partition_status(Ntp::kafka("ghost", 3))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 404);
        assert!(err.message().contains("ghost:3"));
    }
}
