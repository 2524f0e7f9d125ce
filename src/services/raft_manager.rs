//! Per-shard raft group manager.
//!
//! Owns the consensus instances for every raft group pinned to this shard.
//! The replication algorithm itself is an external collaborator; what this
//! module owns is the group directory and the leadership-transfer surface the
//! control plane dispatches against. Operations return domain error codes,
//! never errors that carry control flow across the shard boundary.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{Errc, NodeError};
use crate::node::domains::DomainHandle;
use crate::services::storage::Storage;
use crate::types::{GroupId, NodeId, ShardId};

struct ConsensusState {
    leader: Option<NodeId>,
    term: u64,
    members: Vec<NodeId>,
    transfer_in_flight: bool,
}

/// One raft group's consensus handle, pinned to this shard.
pub struct Consensus {
    group: GroupId,
    node_id: NodeId,
    state: RwLock<ConsensusState>,
}

impl Consensus {
    fn new(group: GroupId, node_id: NodeId, members: Vec<NodeId>, leader: Option<NodeId>) -> Self {
        Self {
            group,
            node_id,
            state: RwLock::new(ConsensusState {
                leader,
                term: 0,
                members,
                transfer_in_flight: false,
            }),
        }
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.state.read().unwrap().leader
    }

    pub fn term(&self) -> u64 {
        self.state.read().unwrap().term
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.state.read().unwrap().members.clone()
    }

    /// Transfer leadership of this group to `target`.
    ///
    /// With no target, any other member is chosen. Transferring to the node
    /// that is already the leader is a no-op success, which keeps repeated
    /// transfer requests idempotent.
    pub fn transfer_leadership(&self, target: Option<NodeId>) -> Errc {
        let mut state = self.state.write().unwrap();

        let target = match target {
            Some(t) => {
                if !state.members.contains(&t) {
                    return Errc::InvalidArgument;
                }
                t
            }
            None => {
                let current = state.leader;
                match state.members.iter().find(|m| Some(**m) != current) {
                    Some(t) => *t,
                    None => return Errc::LeadershipTransferError,
                }
            }
        };

        if state.transfer_in_flight {
            return Errc::UpdateInProgress;
        }
        if state.leader == Some(target) {
            return Errc::Success;
        }
        if state.leader != Some(self.node_id) {
            return Errc::NotLeader;
        }

        state.transfer_in_flight = true;
        state.leader = Some(target);
        state.term += 1;
        state.transfer_in_flight = false;

        debug!(
            group = self.group,
            target, term = state.term,
            "Leadership transferred"
        );
        Errc::Success
    }
}

/// Directory of consensus instances on one shard.
pub struct RaftGroupManager {
    node_id: NodeId,
    shard: ShardId,
    domain: DomainHandle,
    storage: Arc<Storage>,
    groups: DashMap<GroupId, Arc<Consensus>>,
    started: AtomicBool,
}

impl RaftGroupManager {
    pub fn new(
        node_id: NodeId,
        shard: ShardId,
        domain: DomainHandle,
        storage: Arc<Storage>,
    ) -> Self {
        Self {
            node_id,
            shard,
            domain,
            storage,
            groups: DashMap::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!(
            shard = self.shard,
            domain = self.domain.name(),
            "Raft group manager started"
        );
    }

    pub fn stop(&self) -> Result<(), NodeError> {
        self.started.store(false, Ordering::SeqCst);
        debug!(shard = self.shard, groups = self.groups.len(), "Raft group manager stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Create the consensus instance for a group placed on this shard.
    ///
    /// The local node starts as leader unless a leader is given; placement
    /// hands groups to their initial leader's shard.
    pub fn register_group(
        &self,
        group: GroupId,
        members: Vec<NodeId>,
        leader: Option<NodeId>,
    ) -> Arc<Consensus> {
        let leader = leader.or(Some(self.node_id));
        let consensus = Arc::new(Consensus::new(group, self.node_id, members, leader));
        self.storage.kv().put(
            format!("raft/{}/members", group),
            Bytes::from(
                serde_json::to_vec(&consensus.members()).unwrap_or_default(),
            ),
        );
        self.groups.insert(group, consensus.clone());
        consensus
    }

    /// The local consensus instance for `group`, if the group is (still)
    /// hosted on this shard.
    pub fn consensus_for(&self, group: GroupId) -> Option<Arc<Consensus>> {
        self.groups.get(&group).map(|c| c.clone())
    }

    pub fn remove_group(&self, group: GroupId) -> Option<Arc<Consensus>> {
        self.storage.kv().remove(&format!("raft/{}/members", group));
        self.groups.remove(&group).map(|(_, c)| c)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }
}
