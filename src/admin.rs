//! Transport-neutral admin operations.
//!
//! The admin HTTP transport is an external collaborator: it delivers parsed
//! path segments and query parameters here and sends back the status code and
//! JSON body of the returned [`AdminResponse`]. Parameter parsing failures
//! are client errors and never reach the shard table; dispatch failures are
//! classified by [`DispatchError::status`]: malformed input is 400, a missing
//! resource is 404, an operation failure is 400 or 500 depending on whether
//! the code is client-correctable.

use serde_json::{Value, json};
use tracing::info;

use crate::dispatch::ControlDispatcher;
use crate::error::DispatchError;
use crate::types::{GroupId, NodeId, Ntp, parse_target_broker_shards};

/// Status code and JSON body handed back to the admin transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminResponse {
    pub status: u16,
    pub body: Value,
}

impl AdminResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "message": message.into() }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

impl From<DispatchError> for AdminResponse {
    fn from(error: DispatchError) -> Self {
        AdminResponse::error(error.status(), error.message())
    }
}

fn parse_group_id(raw: &str) -> Result<GroupId, AdminResponse> {
    let id: i64 = raw.parse().map_err(|_| {
        AdminResponse::error(400, format!("Raft group id must be an integer: {}", raw))
    })?;
    if id < 0 {
        return Err(AdminResponse::error(
            400,
            format!("Invalid raft group id {}", id),
        ));
    }
    Ok(id as GroupId)
}

fn parse_partition_id(raw: &str) -> Result<i32, AdminResponse> {
    let id: i64 = raw.parse().map_err(|_| {
        AdminResponse::error(400, format!("Partition id must be an integer: {}", raw))
    })?;
    if id < 0 || id > i32::MAX as i64 {
        return Err(AdminResponse::error(
            400,
            format!("Invalid partition id {}", id),
        ));
    }
    Ok(id as i32)
}

fn parse_target_node(raw: Option<&str>) -> Result<Option<NodeId>, AdminResponse> {
    let Some(raw) = raw.filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let id: i64 = raw.parse().map_err(|_| {
        AdminResponse::error(400, format!("Target node id must be an integer: {}", raw))
    })?;
    if id < 0 {
        return Err(AdminResponse::error(
            400,
            format!("Invalid target node id {}", id),
        ));
    }
    Ok(Some(id as NodeId))
}

/// `POST /v1/raft/{group_id}/transfer_leadership?target={node}`
pub async fn raft_transfer_leadership(
    dispatcher: &ControlDispatcher,
    group_id: &str,
    target: Option<&str>,
) -> AdminResponse {
    let group = match parse_group_id(group_id) {
        Ok(group) => group,
        Err(response) => return response,
    };
    let target = match parse_target_node(target) {
        Ok(target) => target,
        Err(response) => return response,
    };

    info!(group, ?target, "Leadership transfer request for raft group");

    match dispatcher.transfer_group_leadership(group, target).await {
        Ok(()) => AdminResponse::ok(Value::Null),
        Err(e) => e.into(),
    }
}

/// `POST /v1/kafka/{topic}/{partition}/transfer_leadership?target={node}`
pub async fn kafka_transfer_leadership(
    dispatcher: &ControlDispatcher,
    topic: &str,
    partition: &str,
    target: Option<&str>,
) -> AdminResponse {
    let partition = match parse_partition_id(partition) {
        Ok(partition) => partition,
        Err(response) => return response,
    };
    let target = match parse_target_node(target) {
        Ok(target) => target,
        Err(response) => return response,
    };

    info!(
        topic,
        partition,
        ?target,
        "Leadership transfer request for leader of topic-partition"
    );

    match dispatcher
        .transfer_partition_leadership(Ntp::kafka(topic, partition), target)
        .await
    {
        Ok(()) => AdminResponse::ok(Value::Null),
        Err(e) => e.into(),
    }
}

/// `POST /v1/kafka/{topic}/{partition}/move?target={n,s,n,s,...}`
///
/// Each pair in `target` is a node id and a shard id respectively.
pub async fn kafka_move_partition(
    dispatcher: &ControlDispatcher,
    topic: &str,
    partition: &str,
    target: Option<&str>,
) -> AdminResponse {
    let partition = match parse_partition_id(partition) {
        Ok(partition) => partition,
        Err(response) => return response,
    };

    let replicas = match target.filter(|s| !s.is_empty()) {
        Some(raw) => match parse_target_broker_shards(raw) {
            Ok(replicas) => replicas,
            Err(message) => return AdminResponse::error(400, message),
        },
        None => Vec::new(),
    };
    if replicas.is_empty() {
        return AdminResponse::error(400, "Partition movement requires target replica set");
    }

    match dispatcher
        .move_partition_replicas(Ntp::kafka(topic, partition), replicas)
        .await
    {
        Ok(()) => AdminResponse::ok(Value::Null),
        Err(e) => e.into(),
    }
}

/// `GET /v1/kafka/{topic}/{partition}`
pub async fn get_partition(
    dispatcher: &ControlDispatcher,
    topic: &str,
    partition: &str,
) -> AdminResponse {
    let partition = match parse_partition_id(partition) {
        Ok(partition) => partition,
        Err(response) => return response,
    };

    match dispatcher
        .partition_status(Ntp::kafka(topic, partition))
        .await
    {
        Ok(status) => match serde_json::to_value(&status) {
            Ok(body) => AdminResponse::ok(body),
            Err(e) => AdminResponse::error(500, e.to_string()),
        },
        Err(e) => e.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainBudgets;
    use crate::node::domains::SmpServiceGroups;
    use crate::services::TopicTable;
    use crate::shard::{ShardRouter, ShardTable};
    use std::sync::Arc;

    fn dispatcher() -> ControlDispatcher {
        ControlDispatcher::new(
            Arc::new(ShardTable::new()),
            Arc::new(TopicTable::new()),
            ShardRouter::new(vec![]),
            SmpServiceGroups::create(&DomainBudgets::default()).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_non_integer_group_id_is_400() {
        let response = raft_transfer_leadership(&dispatcher(), "seven", Some("3")).await;
        assert_eq!(response.status, 400);
        assert!(
            response.body["message"]
                .as_str()
                .unwrap()
                .contains("must be an integer")
        );
    }

    #[tokio::test]
    async fn test_negative_group_id_is_400() {
        let response = raft_transfer_leadership(&dispatcher(), "-4", None).await;
        assert_eq!(response.status, 400);
        assert!(
            response.body["message"]
                .as_str()
                .unwrap()
                .contains("Invalid raft group id")
        );
    }

    #[tokio::test]
    async fn test_absent_group_is_404() {
        let response = raft_transfer_leadership(&dispatcher(), "7", Some("3")).await;
        assert_eq!(response.status, 404);
        assert!(
            response.body["message"]
                .as_str()
                .unwrap()
                .contains("Raft group 7 not found")
        );
    }

    #[tokio::test]
    async fn test_bad_target_node_is_400() {
        let response = raft_transfer_leadership(&dispatcher(), "7", Some("abc")).await;
        assert_eq!(response.status, 400);
        assert!(
            response.body["message"]
                .as_str()
                .unwrap()
                .contains("Target node id must be an integer")
        );
    }

    #[tokio::test]
    async fn test_move_partition_parses_broker_shard_pairs() {
        // "1,0,2,1" is two pairs; the request reaches dispatch and fails with
        // not-found because nothing is placed, which proves parsing passed.
        let response = kafka_move_partition(&dispatcher(), "orders", "0", Some("1,0,2,1")).await;
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_move_partition_odd_pair_count_is_400() {
        let response = kafka_move_partition(&dispatcher(), "orders", "0", Some("1,0,2")).await;
        assert_eq!(response.status, 400);
        assert!(
            response.body["message"]
                .as_str()
                .unwrap()
                .contains("Invalid target parameter format")
        );
    }

    #[tokio::test]
    async fn test_move_partition_missing_target_is_400() {
        let response = kafka_move_partition(&dispatcher(), "orders", "0", None).await;
        assert_eq!(response.status, 400);
        assert!(
            response.body["message"]
                .as_str()
                .unwrap()
                .contains("requires target replica set")
        );

        let response = kafka_move_partition(&dispatcher(), "orders", "0", Some("")).await;
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn test_bad_partition_id_is_400() {
        let response = kafka_transfer_leadership(&dispatcher(), "orders", "x", None).await;
        assert_eq!(response.status, 400);
        assert!(
            response.body["message"]
                .as_str()
                .unwrap()
                .contains("Partition id must be an integer")
        );

        let response = kafka_transfer_leadership(&dispatcher(), "orders", "-1", None).await;
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn test_get_partition_absent_is_404() {
        let response = get_partition(&dispatcher(), "orders", "0").await;
        assert_eq!(response.status, 404);
    }
}
