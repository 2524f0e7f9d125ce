//! Cross-node RPC client pool.
//!
//! A directory of peer broker endpoints with per-peer failure accounting.
//! Actual connection establishment belongs to the transport collaborator;
//! consumers take an endpoint and a retry policy and drive their own sends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use dashmap::DashMap;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::SeedBroker;
use crate::error::{NodeError, NodeResult};
use crate::types::NodeId;

struct Peer {
    addr: SocketAddr,
    failures: AtomicU32,
}

/// Per-shard cache of peer broker endpoints.
pub struct ConnectionCache {
    peers: DashMap<NodeId, Peer>,
}

impl std::fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl ConnectionCache {
    /// Construct the cache from the configured seed brokers.
    pub fn new(seeds: &[SeedBroker]) -> NodeResult<Self> {
        let peers = DashMap::new();
        for seed in seeds {
            let addr: SocketAddr = seed.addr.parse().map_err(|_| {
                NodeError::Config(format!(
                    "Invalid seed broker address for node {}: {}",
                    seed.node_id, seed.addr
                ))
            })?;
            peers.insert(
                seed.node_id,
                Peer {
                    addr,
                    failures: AtomicU32::new(0),
                },
            );
        }
        Ok(Self { peers })
    }

    pub fn register(&self, node_id: NodeId, addr: SocketAddr) {
        self.peers.insert(
            node_id,
            Peer {
                addr,
                failures: AtomicU32::new(0),
            },
        );
    }

    pub fn remove(&self, node_id: NodeId) {
        self.peers.remove(&node_id);
    }

    pub fn peer_addr(&self, node_id: NodeId) -> Option<SocketAddr> {
        self.peers.get(&node_id).map(|p| p.addr)
    }

    /// Record a send failure; returns the consecutive failure count.
    pub fn record_failure(&self, node_id: NodeId) -> u32 {
        self.peers
            .get(&node_id)
            .map(|p| p.failures.fetch_add(1, Ordering::SeqCst) + 1)
            .unwrap_or(0)
    }

    /// Clear failure accounting after a successful send.
    pub fn record_success(&self, node_id: NodeId) {
        if let Some(p) = self.peers.get(&node_id) {
            p.failures.store(0, Ordering::SeqCst);
        }
    }

    pub fn failures(&self, node_id: NodeId) -> u32 {
        self.peers
            .get(&node_id)
            .map(|p| p.failures.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Backoff policy consumers use when retrying sends to a peer.
    pub fn retry_policy(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(50))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(5)
    }

    /// Open a connection to a peer, retrying transient failures with the
    /// cache's backoff policy.
    pub async fn connect(&self, node_id: NodeId) -> NodeResult<TcpStream> {
        let Some(addr) = self.peer_addr(node_id) else {
            return Err(NodeError::Config(format!(
                "no known address for peer node {}",
                node_id
            )));
        };

        let attempt = || async move { TcpStream::connect(addr).await };
        match attempt.retry(self.retry_policy()).await {
            Ok(stream) => {
                self.record_success(node_id);
                Ok(stream)
            }
            Err(e) => {
                let failures = self.record_failure(node_id);
                debug!(node_id, failures, error = %e, "Peer connection failed");
                Err(e.into())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
