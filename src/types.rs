//! Core identifier types shared across the node.
//!
//! Every replicated resource hosted by a node is named by a [`ResourceId`]:
//! either a raft group id or a namespaced topic-partition ([`Ntp`]). Resource
//! identifiers are immutable once assigned and are the key into the shard
//! table, which maps each resource to the core that owns it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a broker node in the cluster.
pub type NodeId = i32;

/// Index of a core-pinned execution context on a node (`0..shard_count`).
pub type ShardId = u32;

/// Identifier of a raft consensus group.
pub type GroupId = u64;

/// The namespace all client-visible topics live in.
pub const KAFKA_NAMESPACE: &str = "kafka";

/// Namespace reserved for internal coordination topics.
pub const INTERNAL_NAMESPACE: &str = "castle";

/// A namespaced topic-partition.
///
/// This is the canonical name of one partition of one topic, qualified by a
/// namespace so that internal coordination topics can never collide with
/// client topics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ntp {
    pub namespace: String,
    pub topic: String,
    pub partition: i32,
}

impl Ntp {
    pub fn new(namespace: impl Into<String>, topic: impl Into<String>, partition: i32) -> Self {
        Self {
            namespace: namespace.into(),
            topic: topic.into(),
            partition,
        }
    }

    /// A partition in the client-visible Kafka namespace.
    pub fn kafka(topic: impl Into<String>, partition: i32) -> Self {
        Self::new(KAFKA_NAMESPACE, topic, partition)
    }

    /// A partition of an internal coordination topic.
    pub fn internal(topic: impl Into<String>, partition: i32) -> Self {
        Self::new(INTERNAL_NAMESPACE, topic, partition)
    }
}

impl fmt::Display for Ntp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.topic, self.partition)
    }
}

/// Discriminated identifier of a replicated resource pinned to one shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    /// A raft consensus group, named by its numeric group id.
    Group(GroupId),
    /// A topic-partition, named by its namespaced topic-partition key.
    Partition(Ntp),
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Group(g) => write!(f, "group/{}", g),
            ResourceId::Partition(ntp) => write!(f, "{}", ntp),
        }
    }
}

impl From<GroupId> for ResourceId {
    fn from(g: GroupId) -> Self {
        ResourceId::Group(g)
    }
}

impl From<Ntp> for ResourceId {
    fn from(ntp: Ntp) -> Self {
        ResourceId::Partition(ntp)
    }
}

/// One replica placement: a broker node and the shard on that node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerShard {
    pub node_id: NodeId,
    pub shard: ShardId,
}

impl fmt::Display for BrokerShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node_id, self.shard)
    }
}

/// Parse integer pairs from a `target` parameter of the form `n,s,n,s,...`
/// where each pair is a node id and a shard id respectively.
///
/// An odd number of elements, a non-integer element, or a negative value are
/// all rejected; the caller surfaces the message as a client error.
pub fn parse_target_broker_shards(param: &str) -> Result<Vec<BrokerShard>, String> {
    let parts: Vec<&str> = param.split(',').collect();

    if parts.len() % 2 != 0 {
        return Err(format!("Invalid target parameter format: {}", param));
    }

    let mut replicas = Vec::with_capacity(parts.len() / 2);
    for pair in parts.chunks(2) {
        let node: i64 = pair[0]
            .trim()
            .parse()
            .map_err(|_| format!("Target node id must be an integer: {}", pair[0]))?;
        let shard: i64 = pair[1]
            .trim()
            .parse()
            .map_err(|_| format!("Target shard id must be an integer: {}", pair[1]))?;

        if node < 0 || shard < 0 {
            return Err(format!("Invalid target {}:{}", node, shard));
        }

        replicas.push(BrokerShard {
            node_id: node as NodeId,
            shard: shard as ShardId,
        });
    }

    Ok(replicas)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntp_display() {
        let ntp = Ntp::kafka("orders", 3);
        assert_eq!(ntp.to_string(), "kafka/orders/3");
    }

    #[test]
    fn test_ntp_namespaces_do_not_collide() {
        let client = Ntp::kafka("coordinate", 0);
        let internal = Ntp::internal("coordinate", 0);
        assert_ne!(client, internal);
    }

    #[test]
    fn test_resource_id_display() {
        assert_eq!(ResourceId::Group(7).to_string(), "group/7");
        assert_eq!(ResourceId::from(Ntp::kafka("t", 0)).to_string(), "kafka/t/0");
    }

    #[test]
    fn test_parse_target_broker_shards_pairs() {
        let replicas = parse_target_broker_shards("1,0,2,1").unwrap();
        assert_eq!(
            replicas,
            vec![
                BrokerShard { node_id: 1, shard: 0 },
                BrokerShard { node_id: 2, shard: 1 },
            ]
        );
    }

    #[test]
    fn test_parse_target_broker_shards_odd_count_rejected() {
        let err = parse_target_broker_shards("1,0,2").unwrap_err();
        assert!(err.contains("Invalid target parameter format"));
    }

    #[test]
    fn test_parse_target_broker_shards_negative_rejected() {
        assert!(parse_target_broker_shards("-1,0").is_err());
        assert!(parse_target_broker_shards("1,-2").is_err());
    }

    #[test]
    fn test_parse_target_broker_shards_non_integer_rejected() {
        let err = parse_target_broker_shards("one,0").unwrap_err();
        assert!(err.contains("must be an integer"));
    }

    #[test]
    fn test_parse_target_broker_shards_single_pair() {
        let replicas = parse_target_broker_shards("3,2").unwrap();
        assert_eq!(replicas, vec![BrokerShard { node_id: 3, shard: 2 }]);
    }
}
