//! Node lifecycle: ordered per-core construction, explicit start, and strict
//! reverse-order teardown.
//!
//! Bootstrap builds the node-wide pieces first (admission groups, scheduling
//! domains, the shard and topic tables, one mailbox per shard), then runs the
//! per-core construction pipeline on every shard. Construction allocates and
//! wires services but performs no externally observable I/O; only after every
//! shard has finished constructing does `start` bind listeners and begin
//! emitting to peers, so a partially wired service set is never exposed.
//!
//! Every successful step pushes its stop action onto a deferred stack before
//! the next step begins. A failure mid-pipeline unwinds everything built so
//! far, in reverse order, before the error reaches the caller; the error
//! names the failing step. At shutdown the controller's input is closed
//! first (it was pushed last, during start), then services stop in reverse
//! construction order, and the scheduling domains are destroyed only after
//! every service referencing them is gone.

pub mod domains;
pub mod teardown;

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::dispatch::ControlDispatcher;
use crate::error::{Errc, NodeError, NodeResult};
use crate::metrics;
use crate::rpc::builtin::{
    ClusterControlService, IdAllocatorService, KafkaApiService, MetadataDisseminationService,
    RaftReplicationService,
};
use crate::rpc::{
    CLUSTER_SERVICE_TAG, ID_ALLOCATOR_SERVICE_TAG, KAFKA_API_SERVICE_TAG, METADATA_SERVICE_TAG,
    RAFT_SERVICE_TAG, RpcServer,
};
use crate::runtime::{ControlRuntime, RuntimeConfig, ShardRuntime};
use crate::services::controller::CONTROLLER_SHARD;
use crate::services::{
    ConnectionCache, Controller, CoordinatorMapper, GroupManager, GroupRouter, InputGate,
    MetadataCache, MetadataDissemination, PartitionManager, QuotaManager, RaftGroupManager,
    Storage, TopicTable,
};
use crate::shard::{
    ShardMailbox, ShardMessage, ShardRequest, ShardRouter, ShardServices, ShardTable, execute,
};
use crate::types::{BrokerShard, GroupId, NodeId, Ntp, ResourceId, ShardId};

use domains::{
    CLUSTER_DOMAIN, KAFKA_DOMAIN, RAFT_DOMAIN, SchedulingGroups, SmpServiceGroups,
};
use teardown::DeferredStack;

#[cfg(feature = "tls")]
use crate::rpc::tls::{ReloadableTls, log_reload_event};

/// Partition count of the internal group-coordination topic.
const COORDINATE_PARTITION_COUNT: i32 = 8;

/// Default per-client byte-rate budget enforced by the quota manager.
const CLIENT_QUOTA_BYTES_PER_SEC: u64 = 8 * 1024 * 1024;

/// Listener address for one shard.
///
/// Each shard binds its own socket at `port + shard`, which keeps connection
/// shard assignment deterministic. Port 0 (ephemeral, used by tests) is
/// passed through unchanged.
pub fn shard_listen_addr(addr: &str, shard: ShardId) -> NodeResult<String> {
    let addr: std::net::SocketAddr = addr
        .parse()
        .map_err(|_| NodeError::Config(format!("Invalid listener address: {}", addr)))?;
    if addr.port() == 0 {
        return Ok(addr.to_string());
    }
    let port = addr
        .port()
        .checked_add(shard as u16)
        .ok_or_else(|| {
            NodeError::Config(format!(
                "listener port {} overflows with shard offset {}",
                addr.port(),
                shard
            ))
        })?;
    Ok(std::net::SocketAddr::new(addr.ip(), port).to_string())
}

/// Everything a shard needs to construct its service instances.
pub struct ShardSeed {
    pub shard: ShardId,
    pub config: Arc<NodeConfig>,
    pub table: Arc<ShardTable>,
    pub topics: Arc<TopicTable>,
    pub scheduling: SchedulingGroups,
    pub smp: SmpServiceGroups,
    pub router: ShardRouter,
}

/// What a shard reports back after constructing its services.
pub struct ConstructAck {
    pub controller_gate: Option<InputGate>,
}

enum StartCommand {
    Start,
    Abort,
}

struct ShardControl {
    shard: ShardId,
    start_tx: Option<oneshot::Sender<StartCommand>>,
    started_rx: Option<oneshot::Receiver<NodeResult<()>>>,
    stop_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

/// Run the ordered construction pipeline for one shard.
///
/// Each step pushes its stop action before the next step begins; on failure
/// the caller unwinds `stack`, which runs the stop actions of every step that
/// completed, newest first.
pub fn construct_shard_services(
    seed: &ShardSeed,
    stack: &mut DeferredStack,
) -> NodeResult<Arc<ShardServices>> {
    let shard = seed.shard;
    let node_id = seed.config.node_id;
    let shard_count = seed.scheduling.shard_count();

    let storage = Arc::new(
        Storage::new(shard, &seed.config.data_directory)
            .map_err(|e| NodeError::at_step("storage", e))?,
    );
    {
        let s = storage.clone();
        stack.push("storage", move || s.stop());
    }

    let connections = Arc::new(
        ConnectionCache::new(&seed.config.seed_brokers)
            .map_err(|e| NodeError::at_step("raft-connection-cache", e))?,
    );
    {
        let c = connections.clone();
        stack.push_ok("raft-connection-cache", move || drop(c));
    }

    let table = seed.table.clone();
    {
        let t = table.clone();
        stack.push_ok("shard-table", move || drop(t));
    }

    let raft_domain = seed
        .scheduling
        .group(RAFT_DOMAIN)
        .map_err(|e| NodeError::at_step("raft-group-manager", e))?;
    let raft_manager = Arc::new(RaftGroupManager::new(
        node_id,
        shard,
        raft_domain,
        storage.clone(),
    ));
    {
        let m = raft_manager.clone();
        stack.push("raft-group-manager", move || m.stop());
    }

    let partition_manager = Arc::new(PartitionManager::new(
        shard,
        storage.clone(),
        raft_manager.clone(),
    ));
    {
        let m = partition_manager.clone();
        stack.push("partition-manager", move || m.stop());
    }

    let controller = if shard == CONTROLLER_SHARD {
        let controller = Arc::new(Controller::new(
            shard_count,
            table.clone(),
            seed.topics.clone(),
        ));
        {
            let c = controller.clone();
            stack.push("controller", move || c.stop());
        }
        Some(controller)
    } else {
        None
    };

    let metadata = Arc::new(MetadataCache::new());
    {
        let m = metadata.clone();
        stack.push_ok("metadata-cache", move || drop(m));
    }

    let dissemination = Arc::new(MetadataDissemination::new(
        shard,
        seed.router.clone(),
        seed.smp.cluster(),
    ));
    {
        let d = dissemination.clone();
        stack.push("metadata-dissemination", move || d.stop());
    }

    let group_manager = Arc::new(GroupManager::new(shard));
    {
        let m = group_manager.clone();
        stack.push("group-manager", move || m.stop());
    }

    let coordinator_mapper = Arc::new(
        CoordinatorMapper::new(COORDINATE_PARTITION_COUNT)
            .map_err(|e| NodeError::at_step("group-router", e))?,
    );
    let group_router = Arc::new(GroupRouter::new(coordinator_mapper.clone(), table.clone()));
    {
        let r = group_router.clone();
        stack.push_ok("group-router", move || drop(r));
    }

    let quota = Arc::new(QuotaManager::new(shard, CLIENT_QUOTA_BYTES_PER_SEC));
    {
        let q = quota.clone();
        stack.push("quota-manager", move || q.stop());
    }

    let internal_addr = shard_listen_addr(&seed.config.internal_rpc_addr, shard)
        .map_err(|e| NodeError::at_step("internal-rpc", e))?;
    #[allow(unused_mut)]
    let mut internal_rpc = RpcServer::new("internal_rpc", &internal_addr)
        .map_err(|e| NodeError::at_step("internal-rpc", e))?;
    #[cfg(feature = "tls")]
    {
        if let Some(settings) = &seed.config.internal_rpc_tls {
            let tls = ReloadableTls::build(settings, log_reload_event("internal_rpc"))
                .map_err(|e| NodeError::at_step("internal-rpc", e))?;
            internal_rpc = internal_rpc.with_tls(Arc::new(tls));
        }
    }
    let internal_rpc = Arc::new(internal_rpc);
    {
        let s = internal_rpc.clone();
        stack.push("internal-rpc", move || s.shutdown());
    }

    let kafka_addr = shard_listen_addr(&seed.config.kafka_addr, shard)
        .map_err(|e| NodeError::at_step("kafka-rpc", e))?;
    #[allow(unused_mut)]
    let mut kafka_rpc = RpcServer::new("kafka_rpc", &kafka_addr)
        .map_err(|e| NodeError::at_step("kafka-rpc", e))?;
    #[cfg(feature = "tls")]
    {
        if let Some(settings) = &seed.config.kafka_tls {
            let tls = ReloadableTls::build(settings, log_reload_event("kafka_rpc"))
                .map_err(|e| NodeError::at_step("kafka-rpc", e))?;
            kafka_rpc = kafka_rpc.with_tls(Arc::new(tls));
        }
    }
    let kafka_rpc = Arc::new(kafka_rpc);
    {
        let s = kafka_rpc.clone();
        stack.push("kafka-rpc", move || s.shutdown());
    }

    debug!(shard, "Shard services constructed");

    Ok(Arc::new(ShardServices {
        shard,
        node_id,
        table,
        topics: seed.topics.clone(),
        storage,
        connections,
        raft_manager,
        partition_manager,
        controller,
        metadata,
        dissemination,
        group_manager,
        coordinator_mapper,
        group_router,
        quota,
        internal_rpc,
        kafka_rpc,
    }))
}

/// Start the constructed services: begin serving, register protocol handlers
/// and bind the listeners. Runs only after every shard finished constructing.
async fn start_shard_services(seed: &ShardSeed, services: &Arc<ShardServices>) -> NodeResult<()> {
    services.storage.start();
    services.raft_manager.start();
    services.partition_manager.start();
    services.group_manager.start();
    if let Some(controller) = &services.controller {
        controller.start();
    }
    services.quota.start();
    services.dissemination.start();

    let local_router = seed.router.with_local(seed.shard, services.clone());
    let dispatcher = ControlDispatcher::new(
        seed.table.clone(),
        seed.topics.clone(),
        local_router,
        seed.smp.clone(),
    );

    let step = |e| NodeError::at_step("internal-rpc", e);
    services
        .internal_rpc
        .register(
            RAFT_SERVICE_TAG,
            seed.scheduling.group(RAFT_DOMAIN).map_err(step)?,
            seed.smp.raft(),
            Arc::new(RaftReplicationService::new(services.raft_manager.clone())),
        )
        .map_err(step)?;
    services
        .internal_rpc
        .register(
            CLUSTER_SERVICE_TAG,
            seed.scheduling.group(CLUSTER_DOMAIN).map_err(step)?,
            seed.smp.cluster(),
            Arc::new(ClusterControlService::new(dispatcher)),
        )
        .map_err(step)?;
    services
        .internal_rpc
        .register(
            ID_ALLOCATOR_SERVICE_TAG,
            seed.scheduling.group(RAFT_DOMAIN).map_err(step)?,
            seed.smp.raft(),
            Arc::new(IdAllocatorService::new(services.node_id)),
        )
        .map_err(step)?;
    services
        .internal_rpc
        .register(
            METADATA_SERVICE_TAG,
            seed.scheduling.group(CLUSTER_DOMAIN).map_err(step)?,
            seed.smp.cluster(),
            Arc::new(MetadataDisseminationService::new(services.metadata.clone())),
        )
        .map_err(step)?;
    services.internal_rpc.start().await.map_err(step)?;

    let step = |e| NodeError::at_step("kafka-rpc", e);
    services
        .kafka_rpc
        .register(
            KAFKA_API_SERVICE_TAG,
            seed.scheduling.group(KAFKA_DOMAIN).map_err(step)?,
            seed.smp.kafka(),
            Arc::new(KafkaApiService::new(
                services.node_id,
                services.metadata.clone(),
                services.quota.clone(),
            )),
        )
        .map_err(step)?;
    services.kafka_rpc.start().await.map_err(step)?;

    info!(shard = seed.shard, "Shard started");
    Ok(())
}

async fn shard_main(
    seed: ShardSeed,
    mut mailbox_rx: mpsc::UnboundedReceiver<ShardMessage>,
    construct_tx: oneshot::Sender<NodeResult<ConstructAck>>,
    start_rx: oneshot::Receiver<StartCommand>,
    started_tx: oneshot::Sender<NodeResult<()>>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut stack = DeferredStack::new();

    let services = match construct_shard_services(&seed, &mut stack) {
        Ok(services) => services,
        Err(e) => {
            stack.unwind();
            let _ = construct_tx.send(Err(e));
            return;
        }
    };

    let ack = ConstructAck {
        controller_gate: services.controller.as_ref().map(|c| c.input_gate()),
    };
    if construct_tx.send(Ok(ack)).is_err() {
        stack.unwind();
        return;
    }

    // Barrier: every shard must finish constructing before any shard starts.
    match start_rx.await {
        Ok(StartCommand::Start) => {}
        Ok(StartCommand::Abort) | Err(_) => {
            stack.unwind();
            return;
        }
    }

    if let Err(e) = start_shard_services(&seed, &services).await {
        let _ = started_tx.send(Err(e));
        stack.unwind();
        return;
    }
    if started_tx.send(Ok(())).is_err() {
        stack.unwind();
        return;
    }

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            msg = mailbox_rx.recv() => match msg {
                Some(msg) => {
                    let reply = execute(&services, msg.request).await;
                    let _ = msg.reply.send(reply);
                }
                None => break,
            }
        }
    }

    mailbox_rx.close();
    stack.unwind();
    debug!(shard = seed.shard, "Shard stopped");
}

/// A running (or constructed-but-not-started) broker node.
pub struct Node {
    config: Arc<NodeConfig>,
    control: ControlRuntime,
    table: Arc<ShardTable>,
    topics: Arc<TopicTable>,
    router: ShardRouter,
    smp: SmpServiceGroups,
    scheduling: SchedulingGroups,
    stack: DeferredStack,
    shards: Arc<Mutex<Vec<ShardControl>>>,
    controller_gate: Option<InputGate>,
    started: bool,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Construct every shard's services in dependency order.
    ///
    /// Returns with all services constructed but nothing started: no socket
    /// is bound and no traffic is emitted. A failure on any shard or in any
    /// node-wide step unwinds everything already built, in reverse order,
    /// and the error names the failing step.
    pub fn bootstrap(config: NodeConfig) -> NodeResult<Self> {
        config.validate()?;
        let shard_count = config.effective_shard_count();
        let config = Arc::new(config);
        let mut stack = DeferredStack::new();

        info!(
            node_id = config.node_id,
            shard_count, "Bootstrapping castle node"
        );

        let control = ControlRuntime::new(&RuntimeConfig::default())
            .map_err(|e| NodeError::at_step("control-runtime", e.into()))?;

        let smp = SmpServiceGroups::create(&config.domains)
            .map_err(|e| NodeError::at_step("smp-service-groups", e))?;
        {
            let s = smp.clone();
            stack.push_ok("smp-service-groups", move || s.destroy());
        }

        let scheduling = SchedulingGroups::create(
            &SchedulingGroups::default_specs(&config.domains),
            shard_count,
        )
        .map_err(|e| NodeError::at_step("scheduling-groups", e))?;
        {
            let s = scheduling.clone();
            stack.push("scheduling-groups", move || s.destroy());
        }

        let table = Arc::new(ShardTable::new());
        let topics = Arc::new(TopicTable::new());

        let mut mailboxes = Vec::with_capacity(shard_count as usize);
        let mut mailbox_rxs = Vec::with_capacity(shard_count as usize);
        for shard in 0..shard_count {
            let (mailbox, rx) = ShardMailbox::new(shard);
            mailboxes.push(mailbox);
            mailbox_rxs.push(rx);
        }
        let router = ShardRouter::new(mailboxes);

        let mut runtimes = Vec::with_capacity(shard_count as usize);
        for shard in 0..shard_count {
            runtimes.push(
                ShardRuntime::new(shard)
                    .map_err(|e| NodeError::at_step("shard-runtimes", e.into()))?,
            );
        }

        let prefix = RuntimeConfig::default().shard_thread_prefix;
        let mut controls = Vec::with_capacity(shard_count as usize);
        let mut construct_rxs = Vec::with_capacity(shard_count as usize);
        for (runtime, mailbox_rx) in runtimes.into_iter().zip(mailbox_rxs) {
            let shard = runtime.shard();
            let (construct_tx, construct_rx) = oneshot::channel();
            let (start_tx, start_rx) = oneshot::channel();
            let (started_tx, started_rx) = oneshot::channel();
            let (stop_tx, stop_rx) = oneshot::channel();

            let seed = ShardSeed {
                shard,
                config: config.clone(),
                table: table.clone(),
                topics: topics.clone(),
                scheduling: scheduling.clone(),
                smp: smp.clone(),
                router: router.clone(),
            };

            let thread = runtime
                .run(
                    &prefix,
                    shard_main(seed, mailbox_rx, construct_tx, start_rx, started_tx, stop_rx),
                )
                .map_err(|e| NodeError::at_step("shard-runtimes", e.into()))?;

            construct_rxs.push(construct_rx);
            controls.push(ShardControl {
                shard,
                start_tx: Some(start_tx),
                started_rx: Some(started_rx),
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            });
        }

        // Barrier: collect every shard's construction outcome before any
        // start command is sent. The first failure wins; the rest abort.
        let mut acks = Vec::with_capacity(construct_rxs.len());
        let mut failure: Option<NodeError> = None;
        for (control, rx) in controls.iter().zip(construct_rxs) {
            match rx.blocking_recv() {
                Ok(Ok(ack)) => acks.push(ack),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(_) => {
                    failure.get_or_insert(NodeError::ShardUnavailable(control.shard));
                }
            }
        }
        if let Some(e) = failure {
            for control in &mut controls {
                if let Some(tx) = control.start_tx.take() {
                    let _ = tx.send(StartCommand::Abort);
                }
            }
            for control in &mut controls {
                if let Some(thread) = control.thread.take() {
                    let _ = thread.join();
                }
            }
            return Err(e);
        }

        let controller_gate = acks.first().and_then(|a| a.controller_gate.clone());

        let shards = Arc::new(Mutex::new(controls));
        {
            let shards = shards.clone();
            stack.push_ok("stop-shards", move || {
                let mut controls = shards.lock().unwrap();
                for control in controls.iter_mut().rev() {
                    if let Some(tx) = control.start_tx.take() {
                        let _ = tx.send(StartCommand::Abort);
                    }
                    if let Some(tx) = control.stop_tx.take() {
                        let _ = tx.send(());
                    }
                    if let Some(thread) = control.thread.take() {
                        let _ = thread.join();
                    }
                }
                metrics::set_shards_running(0);
            });
        }

        Ok(Self {
            config,
            control,
            table,
            topics,
            router,
            smp,
            scheduling,
            stack,
            shards,
            controller_gate,
            started: false,
        })
    }

    /// Start every shard: bind listeners, begin accepting traffic.
    pub fn start(&mut self) -> NodeResult<()> {
        if self.started {
            return Ok(());
        }

        {
            let mut controls = self.shards.lock().unwrap();
            for control in controls.iter_mut() {
                if let Some(tx) = control.start_tx.take() {
                    tx.send(StartCommand::Start)
                        .map_err(|_| NodeError::ShardUnavailable(control.shard))?;
                }
            }
            for control in controls.iter_mut() {
                if let Some(rx) = control.started_rx.take() {
                    match rx.blocking_recv() {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return Err(e),
                        Err(_) => return Err(NodeError::ShardUnavailable(control.shard)),
                    }
                }
            }
        }

        // Closing controller input is scheduled as the first shutdown step,
        // so long-running placement work stops before the RPC servers do.
        if let Some(gate) = self.controller_gate.clone() {
            self.stack
                .push_ok("controller-shutdown-input", move || gate.close());
        }

        metrics::set_shards_running(self.shard_count() as i64);
        self.started = true;
        info!(node_id = self.config.node_id, "Successfully started castle node");
        Ok(())
    }

    pub fn shard_count(&self) -> u32 {
        self.config.effective_shard_count()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<ShardTable> {
        &self.table
    }

    pub fn topics(&self) -> &Arc<TopicTable> {
        &self.topics
    }

    /// A control-plane dispatcher for this node. Operations originating here
    /// always cross a core boundary; shard-local dispatchers (held by the
    /// RPC handlers) execute same-shard operations in-process.
    pub fn dispatcher(&self) -> ControlDispatcher {
        ControlDispatcher::new(
            self.table.clone(),
            self.topics.clone(),
            self.router.clone(),
            self.smp.clone(),
        )
    }

    /// Block the calling thread on a control-plane future.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.control.block_on(future)
    }

    /// Placement producer surface: pin a partition (and its raft group) to a
    /// shard and activate it there.
    pub fn assign_partition(
        &self,
        ntp: Ntp,
        group: GroupId,
        owner_shard: ShardId,
        replicas: Vec<BrokerShard>,
    ) -> NodeResult<()> {
        if owner_shard >= self.shard_count() {
            return Err(NodeError::Config(format!(
                "owner shard {} out of range (shard count {})",
                owner_shard,
                self.shard_count()
            )));
        }
        self.topics
            .set_assignment(ntp.clone(), group, replicas.clone());
        self.table.assign(ResourceId::Group(group), owner_shard);
        self.table
            .assign(ResourceId::Partition(ntp.clone()), owner_shard);

        let members: Vec<NodeId> = replicas.iter().map(|b| b.node_id).collect();
        let reply = self.block_on(self.router.invoke_on(
            owner_shard,
            &self.smp.cluster(),
            ShardRequest::RegisterPartition {
                ntp,
                group,
                members,
                leader: None,
            },
        ));
        match reply {
            Ok(reply) if reply.code() == Errc::Success => Ok(()),
            Ok(reply) => Err(NodeError::Config(format!(
                "failed to activate partition: {}",
                reply.code()
            ))),
            Err(code) => Err(NodeError::Config(format!(
                "failed to activate partition: {}",
                code
            ))),
        }
    }

    /// Placement producer surface: remove a partition from this node.
    pub fn unassign_partition(&self, ntp: &Ntp) -> NodeResult<()> {
        let owner = self
            .table
            .unassign(&ResourceId::Partition(ntp.clone()));
        if let Some(assignment) = self.topics.remove(ntp) {
            self.table.unassign(&ResourceId::Group(assignment.group));
        }
        let Some(owner) = owner else {
            return Ok(());
        };

        let reply = self.block_on(self.router.invoke_on(
            owner,
            &self.smp.cluster(),
            ShardRequest::RemovePartition { ntp: ntp.clone() },
        ));
        match reply {
            Ok(_) => Ok(()),
            Err(code) => Err(NodeError::Config(format!(
                "failed to deactivate partition: {}",
                code
            ))),
        }
    }

    /// Stop the node: close controller input, stop shards in reverse
    /// construction order, then destroy the scheduling domains.
    pub fn shutdown(mut self) {
        info!(node_id = self.config.node_id, "Stopping...");
        let executed = self.stack.unwind();
        debug!(steps = ?executed, "Node teardown complete");
    }

    /// Whether the scheduling domains are still live (destroyed only during
    /// the final unwind, after every dependent service stopped).
    pub fn domains_live(&self) -> bool {
        !self.scheduling.is_destroyed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_for(shard: ShardId, config: NodeConfig) -> (ShardSeed, SchedulingGroups) {
        let shard_count = config.effective_shard_count();
        let scheduling = SchedulingGroups::create(
            &SchedulingGroups::default_specs(&config.domains),
            shard_count,
        )
        .unwrap();
        let smp = SmpServiceGroups::create(&config.domains).unwrap();
        let mailboxes = (0..shard_count).map(|s| ShardMailbox::new(s).0).collect();
        let seed = ShardSeed {
            shard,
            config: Arc::new(config),
            table: Arc::new(ShardTable::new()),
            topics: Arc::new(TopicTable::new()),
            scheduling: scheduling.clone(),
            smp,
            router: ShardRouter::new(mailboxes),
        };
        (seed, scheduling)
    }

    #[test]
    fn test_construction_pushes_steps_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::for_tests(1, 2, dir.path().to_path_buf());
        let (seed, _scheduling) = seed_for(0, config);
        let mut stack = DeferredStack::new();

        let services = construct_shard_services(&seed, &mut stack).unwrap();
        assert!(services.controller.is_some());

        drop(services);
        let executed = stack.unwind();
        assert_eq!(
            executed,
            vec![
                "kafka-rpc",
                "internal-rpc",
                "quota-manager",
                "group-router",
                "group-manager",
                "metadata-dissemination",
                "metadata-cache",
                "controller",
                "partition-manager",
                "raft-group-manager",
                "shard-table",
                "raft-connection-cache",
                "storage",
            ]
        );
    }

    #[test]
    fn test_shard_listen_addr_offsets_by_shard() {
        assert_eq!(
            shard_listen_addr("127.0.0.1:9092", 0).unwrap(),
            "127.0.0.1:9092"
        );
        assert_eq!(
            shard_listen_addr("127.0.0.1:9092", 3).unwrap(),
            "127.0.0.1:9095"
        );
        // Ephemeral ports are passed through for every shard.
        assert_eq!(shard_listen_addr("127.0.0.1:0", 5).unwrap(), "127.0.0.1:0");
        assert!(shard_listen_addr("127.0.0.1:65535", 1).is_err());
        assert!(shard_listen_addr("garbage", 0).is_err());
    }

    #[test]
    fn test_controller_only_on_shard_zero() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::for_tests(1, 2, dir.path().to_path_buf());
        let (seed, _scheduling) = seed_for(1, config);
        let mut stack = DeferredStack::new();
        let services = construct_shard_services(&seed, &mut stack).unwrap();
        assert!(services.controller.is_none());
    }

    #[test]
    fn test_step_failure_unwinds_prior_steps_in_reverse() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::for_tests(1, 1, dir.path().to_path_buf());
        // An unparseable seed address fails the connection-cache step, after
        // storage has already been constructed.
        config.seed_brokers.push(crate::config::SeedBroker {
            node_id: 2,
            addr: "bogus".to_string(),
        });
        let (seed, _scheduling) = seed_for(0, config);
        let mut stack = DeferredStack::new();

        let err = construct_shard_services(&seed, &mut stack).unwrap_err();
        assert_eq!(err.step(), Some("raft-connection-cache"));

        let executed = stack.unwind();
        assert_eq!(executed, vec!["storage"]);
    }

    #[test]
    fn test_first_step_failure_unwinds_nothing() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = NodeConfig::for_tests(1, 1, file.path().to_path_buf());
        let (seed, _scheduling) = seed_for(0, config);
        let mut stack = DeferredStack::new();

        let err = construct_shard_services(&seed, &mut stack).unwrap_err();
        assert_eq!(err.step(), Some("storage"));
        assert!(stack.is_empty());
    }
}
