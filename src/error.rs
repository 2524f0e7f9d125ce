//! Error types for the node kernel.
//!
//! # Error Handling Patterns
//!
//! Two patterns are used, chosen by where the error crosses a boundary:
//!
//! ## Domain error codes (`Errc`)
//!
//! Operations executed on an owning shard return an [`Errc`] from a closed
//! taxonomy, never an error type that carries control flow across the shard
//! boundary. The dispatcher translates codes into a client-facing
//! classification at the edge.
//!
//! ## Fail-fast startup errors (`NodeError`)
//!
//! Any construction-pipeline step that fails aborts start-up. The deferred
//! teardown stack unwinds everything built so far and the error names the
//! failing step so the operator can diagnose it from a single log line.
//!
//! Teardown-time errors are logged and swallowed; a failed stop action must
//! never prevent the remaining unwind steps from running.

use thiserror::Error;

use crate::types::ShardId;

/// Result type for fallible node operations.
pub type NodeResult<T> = Result<T, NodeError>;

/// Domain-level error codes returned by shard-local operations.
///
/// This is a closed taxonomy: every operation executed against a per-core
/// service instance reports its outcome as one of these codes, and the
/// dispatcher maps each code to a protocol-neutral outcome before replying to
/// the external caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errc {
    Success,
    /// The resource is not hosted here (absent from the shard table, or it
    /// vanished from the owning shard between routing and execution).
    NotFound,
    /// The request named an invalid argument (e.g. a transfer target that is
    /// not a member of the replica set).
    InvalidArgument,
    /// A conflicting reconfiguration is already in flight for the resource.
    UpdateInProgress,
    /// The consensus layer rejected the leadership transfer.
    LeadershipTransferError,
    /// The operation requires the local replica to be the leader.
    NotLeader,
    /// The operation did not complete within its deadline.
    TimedOut,
    /// The destination service is shutting down and no longer accepts input.
    ShuttingDown,
}

impl Errc {
    /// Whether the code signals success.
    pub fn is_ok(&self) -> bool {
        matches!(self, Errc::Success)
    }

    /// Whether the failure is client-correctable.
    ///
    /// Client-correctable codes surface as 400-class outcomes; the rest are
    /// server-side failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Errc::InvalidArgument | Errc::UpdateInProgress | Errc::NotLeader
        )
    }

    /// Wire representation of the code, used by the RPC frame status byte.
    pub fn code(&self) -> u8 {
        match self {
            Errc::Success => 0,
            Errc::NotFound => 1,
            Errc::InvalidArgument => 2,
            Errc::UpdateInProgress => 3,
            Errc::LeadershipTransferError => 4,
            Errc::NotLeader => 5,
            Errc::TimedOut => 6,
            Errc::ShuttingDown => 7,
        }
    }

    /// Decode a wire status byte.
    pub fn from_code(code: u8) -> Option<Errc> {
        Some(match code {
            0 => Errc::Success,
            1 => Errc::NotFound,
            2 => Errc::InvalidArgument,
            3 => Errc::UpdateInProgress,
            4 => Errc::LeadershipTransferError,
            5 => Errc::NotLeader,
            6 => Errc::TimedOut,
            7 => Errc::ShuttingDown,
            _ => return None,
        })
    }

    /// Human-readable message for the code.
    pub fn message(&self) -> &'static str {
        match self {
            Errc::Success => "success",
            Errc::NotFound => "resource not found on this node",
            Errc::InvalidArgument => "invalid argument",
            Errc::UpdateInProgress => "conflicting update already in progress",
            Errc::LeadershipTransferError => "leadership transfer failed",
            Errc::NotLeader => "local replica is not the leader",
            Errc::TimedOut => "operation timed out",
            Errc::ShuttingDown => "service is shutting down",
        }
    }
}

impl std::fmt::Display for Errc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Errors that abort node start-up or configuration.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration error (missing file, invalid field, failed validation).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A construction-pipeline step failed.
    ///
    /// All steps built before it have already been unwound in reverse order
    /// when this error reaches the caller.
    #[error("Startup step '{step}' failed: {source}")]
    StartupStep {
        step: &'static str,
        #[source]
        source: Box<NodeError>,
    },

    /// A service tag was registered twice on one RPC listener.
    #[error("Service tag {tag} already registered on listener '{listener}'")]
    DuplicateServiceTag { listener: String, tag: u8 },

    /// Scheduling domains were asked to shut down while services still
    /// reference them.
    #[error("Scheduling domain '{name}' still has {users} attached users")]
    DomainsInUse { name: String, users: usize },

    /// A cross-shard destination is gone (its mailbox closed).
    #[error("Shard {0} is unavailable")]
    ShardUnavailable(ShardId),

    /// TLS credential material could not be loaded or built.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Wrap an error as a named startup-step failure.
    pub fn at_step(step: &'static str, source: NodeError) -> Self {
        NodeError::StartupStep {
            step,
            source: Box::new(source),
        }
    }

    /// The failing step name, if this is a startup failure.
    pub fn step(&self) -> Option<&'static str> {
        match self {
            NodeError::StartupStep { step, .. } => Some(step),
            _ => None,
        }
    }
}

/// Classification of a dispatched control-plane operation's failure.
///
/// This is the translation boundary between internal error codes and the
/// external protocol's status vocabulary. The admin transport maps:
/// `BadRequest` to 400, `NotFound` to 404, and `Operation` to 400 or 500
/// depending on whether the code is client-correctable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Malformed input; rejected before any shard-table lookup.
    BadRequest(String),
    /// The resource is absent from the shard table, or vanished from the
    /// owning shard before execution.
    NotFound(String),
    /// The owning shard executed the operation and it returned a non-success
    /// code.
    Operation(Errc),
}

impl DispatchError {
    /// The protocol status code class this failure maps to.
    pub fn status(&self) -> u16 {
        match self {
            DispatchError::BadRequest(_) => 400,
            DispatchError::NotFound(_) => 404,
            DispatchError::Operation(code) => {
                if code.is_client_error() {
                    400
                } else {
                    500
                }
            }
        }
    }

    /// Human-readable message for the failure.
    pub fn message(&self) -> String {
        match self {
            DispatchError::BadRequest(msg) | DispatchError::NotFound(msg) => msg.clone(),
            DispatchError::Operation(code) => code.message().to_string(),
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for DispatchError {}
