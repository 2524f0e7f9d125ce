//! The shard-ownership directory.
//!
//! Maps each resource identifier (raft group or topic-partition) to the index
//! of the core that owns it. The table is written only by the placement
//! authority (the controller) and read from every core; lookups never block
//! and never require a cross-core message.
//!
//! An identifier absent from the table means "not hosted on this node."
//! Callers must translate absence into a not-found condition — never into a
//! default shard. Placement can change between two lookups, so consumers must
//! not cache an owner across a membership-affecting operation without
//! re-resolving.

use dashmap::DashMap;

use crate::types::{ResourceId, ShardId};

/// Directory from resource identifier to owning shard.
#[derive(Default)]
pub struct ShardTable {
    entries: DashMap<ResourceId, ShardId>,
}

impl ShardTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the owning shard. Pure, non-blocking, callable from any core.
    pub fn shard_for(&self, id: &ResourceId) -> Option<ShardId> {
        self.entries.get(id).map(|entry| *entry)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.entries.contains_key(id)
    }

    /// Record ownership. Returns the previous owner when the entry is being
    /// replaced, which callers treat as a placement change.
    pub fn assign(&self, id: ResourceId, shard: ShardId) -> Option<ShardId> {
        self.entries.insert(id, shard)
    }

    /// Remove ownership. Returns the owner the entry had, if any.
    pub fn unassign(&self, id: &ResourceId) -> Option<ShardId> {
        self.entries.remove(id).map(|(_, shard)| shard)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
