//! Cluster metadata authority.
//!
//! The controller is the single writer of placement state: the shard table
//! (resource → owning core) and the topic table (partition → raft group +
//! replica set). It is constructed on every shard but activated only on its
//! home shard (shard 0); replica-set changes are dispatched there.
//!
//! Shutdown closes the controller's input gate as the very first teardown
//! action, so no new placement work races services that are already
//! stopping.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::{Errc, NodeError, NodeResult};
use crate::shard::table::ShardTable;
use crate::types::{BrokerShard, GroupId, Ntp, ResourceId, ShardId};

/// The shard the controller is active on.
pub const CONTROLLER_SHARD: ShardId = 0;

/// Gate over controller input. Cloneable; closing it makes every subsequent
/// mutating operation return `ShuttingDown`.
#[derive(Clone, Default)]
pub struct InputGate {
    closed: Arc<AtomicBool>,
}

impl InputGate {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// Assignment record for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    pub group: GroupId,
    pub replicas: Vec<BrokerShard>,
}

/// Directory from partition to raft group and replica set.
///
/// Like the shard table, written only by the controller and read from every
/// core without blocking.
#[derive(Default)]
pub struct TopicTable {
    assignments: DashMap<Ntp, PartitionAssignment>,
    by_group: DashMap<GroupId, Ntp>,
}

impl TopicTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_assignment(&self, ntp: Ntp, group: GroupId, replicas: Vec<BrokerShard>) {
        self.by_group.insert(group, ntp.clone());
        self.assignments
            .insert(ntp, PartitionAssignment { group, replicas });
    }

    pub fn remove(&self, ntp: &Ntp) -> Option<PartitionAssignment> {
        let removed = self.assignments.remove(ntp).map(|(_, a)| a);
        if let Some(a) = &removed {
            self.by_group.remove(&a.group);
        }
        removed
    }

    pub fn assignment(&self, ntp: &Ntp) -> Option<PartitionAssignment> {
        self.assignments.get(ntp).map(|a| a.clone())
    }

    pub fn ntp_for_group(&self, group: GroupId) -> Option<Ntp> {
        self.by_group.get(&group).map(|n| n.clone())
    }

    /// The replica set of a resource, whichever way it is named.
    pub fn replicas_of(&self, id: &ResourceId) -> Option<Vec<BrokerShard>> {
        let ntp = match id {
            ResourceId::Partition(ntp) => ntp.clone(),
            ResourceId::Group(group) => self.ntp_for_group(*group)?,
        };
        self.assignment(&ntp).map(|a| a.replicas)
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// The placement authority service instance.
pub struct Controller {
    shard_count: u32,
    table: Arc<ShardTable>,
    topics: Arc<TopicTable>,
    gate: InputGate,
    moves_in_flight: DashMap<Ntp, ()>,
    started: AtomicBool,
}

impl Controller {
    pub fn new(shard_count: u32, table: Arc<ShardTable>, topics: Arc<TopicTable>) -> Self {
        Self {
            shard_count,
            table,
            topics,
            gate: InputGate::default(),
            moves_in_flight: DashMap::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn input_gate(&self) -> InputGate {
        self.gate.clone()
    }

    /// Stop accepting new controller input. Idempotent; run as the first
    /// teardown action so in-flight teardown never races new placement work.
    pub fn shutdown_input(&self) {
        self.gate.close();
        info!("Controller input closed");
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!(shard_count = self.shard_count, "Controller started");
    }

    pub fn stop(&self) -> Result<(), NodeError> {
        if self.gate.is_open() {
            warn!("Controller stopped without closing input first");
            self.gate.close();
        }
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Record placement of a partition (and its raft group) on a shard.
    pub fn assign_partition(
        &self,
        ntp: Ntp,
        group: GroupId,
        owner_shard: ShardId,
        replicas: Vec<BrokerShard>,
    ) -> NodeResult<()> {
        if !self.gate.is_open() {
            return Err(NodeError::Config(
                "controller input is closed".to_string(),
            ));
        }
        if owner_shard >= self.shard_count {
            return Err(NodeError::Config(format!(
                "owner shard {} out of range (shard count {})",
                owner_shard, self.shard_count
            )));
        }
        self.topics
            .set_assignment(ntp.clone(), group, replicas);
        self.table.assign(ResourceId::Group(group), owner_shard);
        self.table
            .assign(ResourceId::Partition(ntp.clone()), owner_shard);
        debug!(ntp = %ntp, group, owner_shard, "Partition assigned");
        Ok(())
    }

    /// Remove placement of a partition and its raft group.
    pub fn unassign_partition(&self, ntp: &Ntp) {
        if let Some(assignment) = self.topics.remove(ntp) {
            self.table.unassign(&ResourceId::Group(assignment.group));
        }
        self.table.unassign(&ResourceId::Partition(ntp.clone()));
        debug!(ntp = %ntp, "Partition unassigned");
    }

    /// Change the replica placement of a partition.
    ///
    /// Returns a domain error code; the dispatcher classifies it for the
    /// caller.
    pub fn move_partition_replicas(&self, ntp: &Ntp, replicas: &[BrokerShard]) -> Errc {
        if !self.gate.is_open() {
            return Errc::ShuttingDown;
        }
        if replicas.is_empty() {
            return Errc::InvalidArgument;
        }
        let Some(assignment) = self.topics.assignment(ntp) else {
            return Errc::NotFound;
        };
        if self.moves_in_flight.insert(ntp.clone(), ()).is_some() {
            return Errc::UpdateInProgress;
        }

        self.topics
            .set_assignment(ntp.clone(), assignment.group, replicas.to_vec());
        self.moves_in_flight.remove(ntp);
        debug!(ntp = %ntp, replicas = ?replicas, "Replica set changed");
        Errc::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bs(node_id: i32, shard: u32) -> BrokerShard {
        BrokerShard { node_id, shard }
    }

    fn controller() -> Controller {
        Controller::new(
            4,
            Arc::new(ShardTable::new()),
            Arc::new(TopicTable::new()),
        )
    }

    #[test]
    fn test_assign_writes_both_table_keys() {
        let c = controller();
        let ntp = Ntp::kafka("orders", 0);
        c.assign_partition(ntp.clone(), 7, 2, vec![bs(1, 2)]).unwrap();

        assert_eq!(c.table.shard_for(&ResourceId::Group(7)), Some(2));
        assert_eq!(
            c.table.shard_for(&ResourceId::Partition(ntp.clone())),
            Some(2)
        );
        assert_eq!(
            c.topics.replicas_of(&ResourceId::Group(7)),
            Some(vec![bs(1, 2)])
        );
        assert_eq!(
            c.topics.replicas_of(&ResourceId::Partition(ntp)),
            Some(vec![bs(1, 2)])
        );
    }

    #[test]
    fn test_assign_rejects_out_of_range_shard() {
        let c = controller();
        let err = c
            .assign_partition(Ntp::kafka("t", 0), 1, 9, vec![bs(1, 0)])
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_unassign_removes_both_table_keys() {
        let c = controller();
        let ntp = Ntp::kafka("orders", 0);
        c.assign_partition(ntp.clone(), 7, 1, vec![bs(1, 1)]).unwrap();
        c.unassign_partition(&ntp);

        assert!(c.table.shard_for(&ResourceId::Group(7)).is_none());
        assert!(c.table.shard_for(&ResourceId::Partition(ntp)).is_none());
        assert!(c.topics.is_empty());
    }

    #[test]
    fn test_move_replicas_success() {
        let c = controller();
        let ntp = Ntp::kafka("orders", 0);
        c.assign_partition(ntp.clone(), 7, 0, vec![bs(1, 0)]).unwrap();

        let code = c.move_partition_replicas(&ntp, &[bs(2, 1), bs(3, 0)]);
        assert_eq!(code, Errc::Success);
        assert_eq!(
            c.topics.replicas_of(&ResourceId::Partition(ntp)),
            Some(vec![bs(2, 1), bs(3, 0)])
        );
    }

    #[test]
    fn test_move_replicas_unknown_partition_not_found() {
        let c = controller();
        assert_eq!(
            c.move_partition_replicas(&Ntp::kafka("ghost", 0), &[bs(1, 0)]),
            Errc::NotFound
        );
    }

    #[test]
    fn test_move_replicas_empty_set_invalid() {
        let c = controller();
        let ntp = Ntp::kafka("orders", 0);
        c.assign_partition(ntp.clone(), 7, 0, vec![bs(1, 0)]).unwrap();
        assert_eq!(c.move_partition_replicas(&ntp, &[]), Errc::InvalidArgument);
    }

    #[test]
    fn test_input_gate_blocks_new_work() {
        let c = controller();
        let ntp = Ntp::kafka("orders", 0);
        c.assign_partition(ntp.clone(), 7, 0, vec![bs(1, 0)]).unwrap();

        c.shutdown_input();
        assert!(!c.input_gate().is_open());
        assert_eq!(
            c.move_partition_replicas(&ntp, &[bs(2, 0)]),
            Errc::ShuttingDown
        );
        assert!(c.assign_partition(Ntp::kafka("late", 0), 8, 0, vec![bs(1, 0)]).is_err());
    }

    #[test]
    fn test_gate_clones_share_state() {
        let c = controller();
        let gate = c.input_gate();
        assert!(gate.is_open());
        c.shutdown_input();
        assert!(!gate.is_open());
    }

    #[test]
    fn test_lifecycle_stop_closes_gate() {
        let c = controller();
        c.start();
        assert!(c.is_started());
        c.stop().unwrap();
        assert!(!c.is_started());
        assert!(!c.input_gate().is_open());
    }
}
