//! Core types used throughout the data grid.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Segment identifier: an integer in `[0, num_segments)`.
pub type SegmentId = u32;

/// Cache name. Each cache has its own topology and replication state.
pub type CacheName = String;

/// Identifier of the request (or transaction) that last updated a key.
///
/// Used to detect superseded writes: when a key is tracked again before its
/// previous update was confirmed by all backup sites, the owner changes and
/// acknowledgments for the older update become no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId {
    /// Node that originated the request.
    pub node: NodeId,
    /// Per-node monotonic sequence number.
    pub seq: u64,
}

impl RequestId {
    /// Create a new request id.
    pub fn new(node: NodeId, seq: u64) -> Self {
        Self { node, seq }
    }

    /// Request id used when no originating request is known (e.g. entries
    /// received through state transfer before their history is re-tracked).
    pub fn no_request(node: NodeId) -> Self {
        Self { node, seq: 0 }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node, self.seq)
    }
}

/// Generator for [`RequestId`]s local to one node.
#[derive(Debug)]
pub struct RequestIdGenerator {
    node: NodeId,
    next: AtomicU64,
}

impl RequestIdGenerator {
    /// Create a generator for the given node.
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            next: AtomicU64::new(1),
        }
    }

    /// Produce the next request id.
    pub fn next_id(&self) -> RequestId {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        RequestId::new(self.node, seq)
    }
}
