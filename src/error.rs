//! Error types for the data grid.

use crate::types::NodeId;
use thiserror::Error;

/// Result type alias for data grid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the data grid.
#[derive(Error, Debug)]
pub enum Error {
    /// Topology protocol errors.
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Cross-site replication errors.
    #[error("irac error: {0}")]
    Irac(#[from] IracError),

    /// Transport errors.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid configuration (bad replication factor, empty membership).
    /// Raised before anything is partially constructed.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Topology protocol errors.
#[derive(Error, Debug)]
pub enum TopologyError {
    /// A topology with `pending_ch` and `phase` that contradict each other.
    ///
    /// This indicates a protocol bug; topology processing for the cache is
    /// aborted rather than propagating corrupted state.
    #[error("inconsistent topology: phase {phase} with pending_ch={has_pending}")]
    InconsistentTopology { phase: &'static str, has_pending: bool },

    /// The cache is not registered with the coordinator.
    #[error("cache not found: {0}")]
    CacheNotFound(String),

    /// A member not part of the cache tried to interact with its topology.
    #[error("node {node} is not a member of cache {cache}")]
    NotAMember { cache: String, node: NodeId },
}

/// Cross-site replication errors.
#[derive(Error, Debug)]
pub enum IracError {
    /// The manager was shut down while an operation was in flight.
    #[error("irac manager is shut down")]
    ShutDown,

    /// State transfer to a remote site failed.
    #[error("cross-site state transfer failed: {0}")]
    StateTransferFailed(String),
}

/// Transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The destination member could not be reached.
    #[error("node unreachable: {0}")]
    NodeUnreachable(NodeId),

    /// The remote site could not be reached.
    #[error("site unreachable: {0}")]
    SiteUnreachable(String),

    /// Sending the message failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The peer answered with an unexpected response variant.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Transport(TransportError::Serialization(e.to_string()))
    }
}
