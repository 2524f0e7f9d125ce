//! Scheduling domains and cross-core admission groups.
//!
//! A scheduling domain is a named CPU-share budget (with a plane designation:
//! control or data) that isolates one class of work from another on a shared
//! core. An admission group is a named budget capping the number of
//! concurrently outstanding cross-core calls carrying its tag; when the
//! budget is exhausted, new calls wait (backpressure) until an in-flight call
//! completes.
//!
//! Both sets are created once during node start-up, before any service that
//! references them, and destroyed only after every referencing service has
//! stopped. Creation is all-or-nothing: a failure leaves no partial set.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::DomainBudgets;
use crate::error::{Errc, NodeError, NodeResult};

/// Standard scheduling domain names.
pub const RAFT_DOMAIN: &str = "raft";
pub const CLUSTER_DOMAIN: &str = "cluster";
pub const KAFKA_DOMAIN: &str = "kafka";
pub const ADMIN_DOMAIN: &str = "admin";

/// Which runtime plane a domain's work is scheduled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    /// Consensus, coordination, admin: latency-sensitive, low throughput.
    Control,
    /// Client traffic: throughput-heavy.
    Data,
}

/// Specification of one scheduling domain.
#[derive(Debug, Clone)]
pub struct DomainSpec {
    pub name: String,
    pub shares: u32,
    pub plane: Plane,
}

struct GroupState {
    name: String,
    shares: u32,
    plane: Plane,
    users: AtomicUsize,
}

struct SchedulingGroupsInner {
    groups: HashMap<String, Arc<GroupState>>,
    shard_count: u32,
    destroyed: AtomicBool,
}

/// The full set of scheduling domains for a node.
///
/// Cloneable handle; the underlying set is shared across shards. Handles to
/// individual domains are attachments counted against destruction.
#[derive(Clone)]
pub struct SchedulingGroups {
    inner: Arc<SchedulingGroupsInner>,
}

impl SchedulingGroups {
    /// The default domain set, with CPU shares taken from configuration.
    pub fn default_specs(budgets: &DomainBudgets) -> Vec<DomainSpec> {
        vec![
            DomainSpec {
                name: RAFT_DOMAIN.to_string(),
                shares: budgets.raft_shares,
                plane: Plane::Control,
            },
            DomainSpec {
                name: CLUSTER_DOMAIN.to_string(),
                shares: budgets.cluster_shares,
                plane: Plane::Control,
            },
            DomainSpec {
                name: KAFKA_DOMAIN.to_string(),
                shares: budgets.kafka_shares,
                plane: Plane::Data,
            },
            DomainSpec {
                name: ADMIN_DOMAIN.to_string(),
                shares: budgets.admin_shares,
                plane: Plane::Control,
            },
        ]
    }

    /// Create the domain set for every shard, or fail with no partial set.
    ///
    /// Creation must complete identically on every shard before any dependent
    /// service starts; a failure for any shard aborts the whole creation.
    pub fn create(specs: &[DomainSpec], shard_count: u32) -> NodeResult<Self> {
        if shard_count == 0 {
            return Err(NodeError::Config(
                "cannot create scheduling domains for zero shards".into(),
            ));
        }

        let mut groups = HashMap::with_capacity(specs.len());
        for spec in specs {
            if spec.name.is_empty() {
                return Err(NodeError::Config(
                    "scheduling domain name must not be empty".into(),
                ));
            }
            if spec.shares == 0 {
                return Err(NodeError::Config(format!(
                    "scheduling domain '{}' must have non-zero cpu shares",
                    spec.name
                )));
            }
            let state = Arc::new(GroupState {
                name: spec.name.clone(),
                shares: spec.shares,
                plane: spec.plane,
                users: AtomicUsize::new(0),
            });
            if groups.insert(spec.name.clone(), state).is_some() {
                return Err(NodeError::Config(format!(
                    "duplicate scheduling domain '{}'",
                    spec.name
                )));
            }
        }

        Ok(Self {
            inner: Arc::new(SchedulingGroupsInner {
                groups,
                shard_count,
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn shard_count(&self) -> u32 {
        self.inner.shard_count
    }

    /// Attach to a domain by name. The returned handle counts as a user until
    /// dropped; destruction is rejected while users remain.
    pub fn group(&self, name: &str) -> NodeResult<DomainHandle> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(NodeError::Config(format!(
                "scheduling domain '{}' requested after destruction",
                name
            )));
        }
        let state = self
            .inner
            .groups
            .get(name)
            .ok_or_else(|| NodeError::Config(format!("unknown scheduling domain '{}'", name)))?
            .clone();
        state.users.fetch_add(1, Ordering::SeqCst);
        Ok(DomainHandle { state })
    }

    /// Destroy the domain set. Rejected while any domain still has attached
    /// users: a service must never execute under a destroyed domain.
    pub fn destroy(&self) -> NodeResult<()> {
        for state in self.inner.groups.values() {
            let users = state.users.load(Ordering::SeqCst);
            if users > 0 {
                return Err(NodeError::DomainsInUse {
                    name: state.name.clone(),
                    users,
                });
            }
        }
        self.inner.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

/// A live attachment to one scheduling domain.
pub struct DomainHandle {
    state: Arc<GroupState>,
}

impl DomainHandle {
    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn shares(&self) -> u32 {
        self.state.shares
    }

    pub fn plane(&self) -> Plane {
        self.state.plane
    }
}

impl Clone for DomainHandle {
    fn clone(&self) -> Self {
        self.state.users.fetch_add(1, Ordering::SeqCst);
        Self {
            state: self.state.clone(),
        }
    }
}

impl Drop for DomainHandle {
    fn drop(&mut self) {
        self.state.users.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for DomainHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainHandle")
            .field("name", &self.state.name)
            .field("shares", &self.state.shares)
            .finish()
    }
}

/// A named admission budget for cross-core calls.
///
/// Acquiring a permit waits when the budget is exhausted; the permit is
/// released when dropped, normally after the cross-core reply arrives.
#[derive(Clone)]
pub struct SmpGroup {
    name: Arc<str>,
    permits: Arc<Semaphore>,
    budget: usize,
}

impl SmpGroup {
    fn new(name: &str, budget: usize) -> Self {
        Self {
            name: Arc::from(name),
            permits: Arc::new(Semaphore::new(budget)),
            budget,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Currently available in-flight slots.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Acquire one in-flight slot, waiting if the budget is exhausted.
    ///
    /// Fails with `ShuttingDown` once the group set has been destroyed.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, Errc> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Errc::ShuttingDown)
    }
}

impl std::fmt::Debug for SmpGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmpGroup")
            .field("name", &self.name)
            .field("budget", &self.budget)
            .field("available", &self.available())
            .finish()
    }
}

/// The full set of admission groups for a node.
#[derive(Clone)]
pub struct SmpServiceGroups {
    raft: SmpGroup,
    cluster: SmpGroup,
    kafka: SmpGroup,
}

impl SmpServiceGroups {
    /// Create all admission groups, or fail with no partial set.
    pub fn create(budgets: &DomainBudgets) -> NodeResult<Self> {
        for (name, budget) in [
            (RAFT_DOMAIN, budgets.raft_inflight),
            (CLUSTER_DOMAIN, budgets.cluster_inflight),
            (KAFKA_DOMAIN, budgets.kafka_inflight),
        ] {
            if budget == 0 {
                return Err(NodeError::Config(format!(
                    "admission group '{}' must have a non-zero in-flight budget",
                    name
                )));
            }
        }
        Ok(Self {
            raft: SmpGroup::new(RAFT_DOMAIN, budgets.raft_inflight),
            cluster: SmpGroup::new(CLUSTER_DOMAIN, budgets.cluster_inflight),
            kafka: SmpGroup::new(KAFKA_DOMAIN, budgets.kafka_inflight),
        })
    }

    pub fn raft(&self) -> SmpGroup {
        self.raft.clone()
    }

    pub fn cluster(&self) -> SmpGroup {
        self.cluster.clone()
    }

    pub fn kafka(&self) -> SmpGroup {
        self.kafka.clone()
    }

    /// Close every group; in-flight permits drain, new acquisitions fail with
    /// `ShuttingDown`.
    pub fn destroy(&self) {
        self.raft.permits.close();
        self.cluster.permits.close();
        self.kafka.permits.close();
    }
}
