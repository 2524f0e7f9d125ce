//! Services registered on the node's RPC listeners.
//!
//! The internal cluster listener multiplexes raft replication, cluster
//! control, id allocation and metadata dissemination; the client-facing
//! listener carries the protocol surface. Payloads are JSON; the wire codec
//! of the full client protocol is an external collaborator.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::dispatch::ControlDispatcher;
use crate::error::{DispatchError, Errc};
use crate::rpc::RpcService;
use crate::services::{LeadershipUpdate, MetadataCache, QuotaManager, RaftGroupManager};
use crate::types::{BrokerShard, GroupId, NodeId, Ntp};

fn decode<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, Errc> {
    serde_json::from_slice(body).map_err(|_| Errc::InvalidArgument)
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, Errc> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|_| Errc::InvalidArgument)
}

fn classify(result: Result<(), DispatchError>) -> Result<Bytes, Errc> {
    match result {
        Ok(()) => Ok(Bytes::new()),
        Err(DispatchError::BadRequest(_)) => Err(Errc::InvalidArgument),
        Err(DispatchError::NotFound(_)) => Err(Errc::NotFound),
        Err(DispatchError::Operation(code)) => Err(code),
    }
}

/// Raft replication surface (heartbeat probing of locally hosted groups).
pub struct RaftReplicationService {
    raft: Arc<RaftGroupManager>,
}

#[derive(Deserialize)]
struct HeartbeatRequest {
    group: GroupId,
}

#[derive(Serialize)]
struct HeartbeatResponse {
    group: GroupId,
    leader: Option<NodeId>,
    term: u64,
}

impl RaftReplicationService {
    pub fn new(raft: Arc<RaftGroupManager>) -> Self {
        Self { raft }
    }
}

#[async_trait]
impl RpcService for RaftReplicationService {
    fn name(&self) -> &'static str {
        "raft"
    }

    async fn handle(&self, method: u8, body: Bytes) -> Result<Bytes, Errc> {
        match method {
            0 => {
                let request: HeartbeatRequest = decode(&body)?;
                let Some(consensus) = self.raft.consensus_for(request.group) else {
                    return Err(Errc::NotFound);
                };
                encode(&HeartbeatResponse {
                    group: request.group,
                    leader: consensus.leader(),
                    term: consensus.term(),
                })
            }
            _ => Err(Errc::InvalidArgument),
        }
    }
}

/// Cluster control surface: leadership transfers and replica moves arriving
/// from peer nodes, executed through the local dispatcher.
pub struct ClusterControlService {
    dispatcher: ControlDispatcher,
}

#[derive(Deserialize)]
struct TransferLeadershipRequest {
    group: GroupId,
    target: Option<NodeId>,
}

#[derive(Deserialize)]
struct MoveReplicasRequest {
    ntp: Ntp,
    replicas: Vec<BrokerShard>,
}

impl ClusterControlService {
    pub fn new(dispatcher: ControlDispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl RpcService for ClusterControlService {
    fn name(&self) -> &'static str {
        "cluster"
    }

    async fn handle(&self, method: u8, body: Bytes) -> Result<Bytes, Errc> {
        match method {
            0 => {
                let request: TransferLeadershipRequest = decode(&body)?;
                classify(
                    self.dispatcher
                        .transfer_group_leadership(request.group, request.target)
                        .await,
                )
            }
            1 => {
                let request: MoveReplicasRequest = decode(&body)?;
                classify(
                    self.dispatcher
                        .move_partition_replicas(request.ntp, request.replicas)
                        .await,
                )
            }
            _ => Err(Errc::InvalidArgument),
        }
    }
}

/// Monotonic id allocation.
pub struct IdAllocatorService {
    next: AtomicI64,
}

#[derive(Deserialize)]
struct AllocateRequest {
    count: u32,
}

#[derive(Serialize, Deserialize)]
pub struct AllocateResponse {
    pub start: i64,
    pub count: u32,
}

impl IdAllocatorService {
    pub fn new(node_id: NodeId) -> Self {
        // Partition the id space by node so allocators on different nodes
        // never hand out overlapping ranges.
        Self {
            next: AtomicI64::new((node_id as i64) << 48),
        }
    }
}

#[async_trait]
impl RpcService for IdAllocatorService {
    fn name(&self) -> &'static str {
        "id_allocator"
    }

    async fn handle(&self, method: u8, body: Bytes) -> Result<Bytes, Errc> {
        match method {
            0 => {
                let request: AllocateRequest = decode(&body)?;
                if request.count == 0 {
                    return Err(Errc::InvalidArgument);
                }
                let start = self.next.fetch_add(request.count as i64, Ordering::SeqCst);
                encode(&AllocateResponse {
                    start,
                    count: request.count,
                })
            }
            _ => Err(Errc::InvalidArgument),
        }
    }
}

/// Leadership updates pushed by peer nodes into this shard's cache.
pub struct MetadataDisseminationService {
    metadata: Arc<MetadataCache>,
}

#[derive(Deserialize)]
struct UpdateLeadershipRequest {
    updates: Vec<LeadershipUpdate>,
}

impl MetadataDisseminationService {
    pub fn new(metadata: Arc<MetadataCache>) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl RpcService for MetadataDisseminationService {
    fn name(&self) -> &'static str {
        "metadata"
    }

    async fn handle(&self, method: u8, body: Bytes) -> Result<Bytes, Errc> {
        match method {
            0 => {
                let request: UpdateLeadershipRequest = decode(&body)?;
                self.metadata.apply_leadership_updates(&request.updates);
                Ok(Bytes::new())
            }
            _ => Err(Errc::InvalidArgument),
        }
    }
}

/// Client-facing protocol surface, throttled by the quota manager.
pub struct KafkaApiService {
    node_id: NodeId,
    metadata: Arc<MetadataCache>,
    quota: Arc<QuotaManager>,
}

#[derive(Serialize)]
struct ApiVersionsResponse {
    node_id: NodeId,
}

#[derive(Deserialize)]
struct TopicMetadataRequest {
    namespace: String,
    topic: String,
    #[serde(default)]
    client_id: String,
}

impl KafkaApiService {
    pub fn new(node_id: NodeId, metadata: Arc<MetadataCache>, quota: Arc<QuotaManager>) -> Self {
        Self {
            node_id,
            metadata,
            quota,
        }
    }
}

#[async_trait]
impl RpcService for KafkaApiService {
    fn name(&self) -> &'static str {
        "kafka_api"
    }

    async fn handle(&self, method: u8, body: Bytes) -> Result<Bytes, Errc> {
        match method {
            0 => encode(&ApiVersionsResponse {
                node_id: self.node_id,
            }),
            1 => {
                let request: TopicMetadataRequest = decode(&body)?;
                let throttle = self
                    .quota
                    .record_and_throttle(&request.client_id, body.len() as u64);
                if !throttle.is_zero() {
                    tokio::time::sleep(throttle).await;
                }
                let partitions = self
                    .metadata
                    .topic_partitions(&request.namespace, &request.topic);
                encode(&partitions)
            }
            _ => Err(Errc::InvalidArgument),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::PartitionMetadata;

    #[tokio::test]
    async fn test_id_allocator_partitions_space_by_node() {
        let svc = IdAllocatorService::new(2);
        let body = Bytes::from_static(br#"{"count": 10}"#);
        let reply = svc.handle(0, body.clone()).await.unwrap();
        let first: AllocateResponse = serde_json::from_slice(&reply).unwrap();
        assert_eq!(first.start, 2i64 << 48);
        assert_eq!(first.count, 10);

        let reply = svc.handle(0, body).await.unwrap();
        let second: AllocateResponse = serde_json::from_slice(&reply).unwrap();
        assert_eq!(second.start, (2i64 << 48) + 10);
    }

    #[tokio::test]
    async fn test_id_allocator_rejects_zero_count() {
        let svc = IdAllocatorService::new(0);
        let err = svc
            .handle(0, Bytes::from_static(br#"{"count": 0}"#))
            .await
            .unwrap_err();
        assert_eq!(err, Errc::InvalidArgument);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_invalid_argument() {
        let svc = IdAllocatorService::new(0);
        let err = svc
            .handle(0, Bytes::from_static(b"not json"))
            .await
            .unwrap_err();
        assert_eq!(err, Errc::InvalidArgument);
    }

    #[tokio::test]
    async fn test_metadata_service_applies_updates() {
        let metadata = Arc::new(MetadataCache::new());
        let svc = MetadataDisseminationService::new(metadata.clone());

        let update = LeadershipUpdate {
            ntp: Ntp::kafka("orders", 0),
            group: 7,
            leader: Some(3),
            term: 2,
        };
        let body = serde_json::to_vec(&serde_json::json!({ "updates": [update] })).unwrap();
        svc.handle(0, Bytes::from(body)).await.unwrap();
        assert_eq!(metadata.leader(&Ntp::kafka("orders", 0)), Some(3));
    }

    #[tokio::test]
    async fn test_kafka_api_metadata_snapshot() {
        let metadata = Arc::new(MetadataCache::new());
        metadata.set_partition(PartitionMetadata {
            ntp: Ntp::kafka("orders", 0),
            group: 7,
            leader: Some(1),
            term: 1,
            replicas: vec![],
        });
        let quota = Arc::new(QuotaManager::new(0, 0));
        let svc = KafkaApiService::new(1, metadata, quota);

        let reply = svc
            .handle(
                1,
                Bytes::from_static(br#"{"namespace": "kafka", "topic": "orders"}"#),
            )
            .await
            .unwrap();
        let partitions: Vec<PartitionMetadata> = serde_json::from_slice(&reply).unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].leader, Some(1));
    }

    #[tokio::test]
    async fn test_unknown_method_rejected() {
        let svc = KafkaApiService::new(
            1,
            Arc::new(MetadataCache::new()),
            Arc::new(QuotaManager::new(0, 0)),
        );
        assert_eq!(
            svc.handle(99, Bytes::new()).await.unwrap_err(),
            Errc::InvalidArgument
        );
    }
}
