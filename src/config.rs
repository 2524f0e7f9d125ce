//! Node configuration.
//!
//! A node is configured from a single required JSON file (the `--config`
//! start-up parameter; its absence is a fatal error before anything is
//! constructed), with selected environment-variable overrides for
//! deployment-time tuning:
//!
//! - `CASTLE_NODE_ID`: override the node id
//! - `CASTLE_SHARD_COUNT`: override the number of shards (0 = all cores)
//!
//! Validation runs once at start-up; a validation failure aborts bootstrap
//! before any scheduling domain or service is created.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};
use crate::types::NodeId;

/// Upper bound on configured shards; placement encodes shard ids as small
/// unsigned integers.
pub const MAX_SHARDS: u32 = 256;

fn default_shard_count() -> u32 {
    0
}

fn default_internal_rpc_addr() -> String {
    "127.0.0.1:33145".to_string()
}

fn default_kafka_addr() -> String {
    "127.0.0.1:9092".to_string()
}

fn default_admin_addr() -> String {
    "127.0.0.1:9644".to_string()
}

/// A peer broker this node may open cross-node connections to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedBroker {
    pub node_id: NodeId,
    pub addr: String,
}

/// CPU-share and admission budgets for the named scheduling domains.
///
/// Shares are relative weights; admission budgets cap the number of
/// concurrently outstanding cross-core calls carrying the domain's tag.
/// A zero share or a zero budget fails validation, which keeps the
/// "no partial domain set" start-up contract trivially enforceable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainBudgets {
    pub raft_shares: u32,
    pub cluster_shares: u32,
    pub kafka_shares: u32,
    pub admin_shares: u32,
    /// Max in-flight cross-core calls for raft replication traffic.
    pub raft_inflight: usize,
    /// Max in-flight cross-core calls for cluster metadata traffic.
    pub cluster_inflight: usize,
    /// Max in-flight cross-core calls for client-protocol traffic.
    pub kafka_inflight: usize,
}

impl Default for DomainBudgets {
    fn default() -> Self {
        Self {
            raft_shares: 400,
            cluster_shares: 200,
            kafka_shares: 1000,
            admin_shares: 100,
            raft_inflight: 512,
            cluster_inflight: 128,
            kafka_inflight: 1024,
        }
    }
}

/// TLS listener settings for an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Endpoint name reported to the credential reload observer.
    pub name: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,

    /// Number of shards to run. 0 means one per available core.
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,

    /// Directory for per-shard storage state.
    pub data_directory: PathBuf,

    /// Base address of the internal cluster RPC listener. Each shard binds
    /// its own socket at `port + shard_index`.
    #[serde(default = "default_internal_rpc_addr")]
    pub internal_rpc_addr: String,

    /// Base address of the client-facing protocol listener, offset per shard
    /// like `internal_rpc_addr`.
    #[serde(default = "default_kafka_addr")]
    pub kafka_addr: String,

    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,

    #[serde(default)]
    pub seed_brokers: Vec<SeedBroker>,

    #[serde(default)]
    pub domains: DomainBudgets,

    #[serde(default)]
    pub internal_rpc_tls: Option<TlsSettings>,

    #[serde(default)]
    pub kafka_tls: Option<TlsSettings>,
}

impl NodeConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> NodeResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            NodeError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        let mut config: NodeConfig = serde_json::from_str(&raw)
            .map_err(|e| NodeError::Config(format!("Failed to parse config file: {}", e)))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-variable overrides on top of the file contents.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CASTLE_NODE_ID") {
            if let Ok(id) = v.parse() {
                self.node_id = id;
            }
        }
        if let Ok(v) = std::env::var("CASTLE_SHARD_COUNT") {
            if let Ok(n) = v.parse() {
                self.shard_count = n;
            }
        }
    }

    /// Number of shards this node will actually run.
    pub fn effective_shard_count(&self) -> u32 {
        if self.shard_count != 0 {
            return self.shard_count;
        }
        std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(1)
    }

    /// Validate the configuration; failure aborts bootstrap.
    pub fn validate(&self) -> NodeResult<()> {
        if self.node_id < 0 {
            return Err(NodeError::Config(format!(
                "node_id must be non-negative, got {}",
                self.node_id
            )));
        }
        if self.shard_count > MAX_SHARDS {
            return Err(NodeError::Config(format!(
                "shard_count {} exceeds maximum {}",
                self.shard_count, MAX_SHARDS
            )));
        }
        for addr in [&self.internal_rpc_addr, &self.kafka_addr, &self.admin_addr] {
            addr.parse::<SocketAddr>().map_err(|_| {
                NodeError::Config(format!("Invalid listener address: {}", addr))
            })?;
        }
        for seed in &self.seed_brokers {
            if seed.node_id < 0 {
                return Err(NodeError::Config(format!(
                    "seed broker node_id must be non-negative, got {}",
                    seed.node_id
                )));
            }
            seed.addr.parse::<SocketAddr>().map_err(|_| {
                NodeError::Config(format!(
                    "Invalid seed broker address for node {}: {}",
                    seed.node_id, seed.addr
                ))
            })?;
        }
        let d = &self.domains;
        for (name, shares) in [
            ("raft", d.raft_shares),
            ("cluster", d.cluster_shares),
            ("kafka", d.kafka_shares),
            ("admin", d.admin_shares),
        ] {
            if shares == 0 {
                return Err(NodeError::Config(format!(
                    "scheduling domain '{}' must have non-zero cpu shares",
                    name
                )));
            }
        }
        for (name, budget) in [
            ("raft", d.raft_inflight),
            ("cluster", d.cluster_inflight),
            ("kafka", d.kafka_inflight),
        ] {
            if budget == 0 {
                return Err(NodeError::Config(format!(
                    "admission group '{}' must have a non-zero in-flight budget",
                    name
                )));
            }
        }
        Ok(())
    }

    /// A config suitable for tests: ephemeral ports, small budgets.
    pub fn for_tests(node_id: NodeId, shard_count: u32, data_directory: PathBuf) -> Self {
        Self {
            node_id,
            shard_count,
            data_directory,
            internal_rpc_addr: "127.0.0.1:0".to_string(),
            kafka_addr: "127.0.0.1:0".to_string(),
            admin_addr: "127.0.0.1:0".to_string(),
            seed_brokers: Vec::new(),
            domains: DomainBudgets::default(),
            internal_rpc_tls: None,
            kafka_tls: None,
        }
    }
}
