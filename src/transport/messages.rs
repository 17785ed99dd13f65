//! Wire message types for member-to-member and site-to-site communication.

use crate::irac::{IracKeyInfo, IracTombstone};
use crate::topology::{TopologyAck, TopologyUpdateCommand};
use crate::types::{CacheName, NodeId, RequestId, SegmentId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Messages exchanged between members of the local cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterMessage {
    /// Coordinator to member: install a topology update.
    TopologyUpdate(TopologyUpdateCommand),

    /// New segment owner to previous owner: send me the pending
    /// replication state for these segments.
    IracStateRequest {
        /// The cache the request refers to.
        cache_name: CacheName,
        /// Node that wants the state.
        requestor: NodeId,
        /// Segments whose ownership moved to the requestor.
        segments: Vec<SegmentId>,
    },

    /// Previous owner to new owner: pending replication state for
    /// segments that changed hands.
    IracStateResponse {
        /// The cache the state belongs to.
        cache_name: CacheName,
        /// One entry per pending key.
        entries: Vec<IracStateEntry>,
    },

    /// Remote-driven scavenging: the origin believes it must still send
    /// these keys; the receiver replies with a cleanup for the stale ones.
    IracStaleCheck {
        /// The cache the keys belong to.
        cache_name: CacheName,
        /// Node performing the check.
        origin: NodeId,
        /// Keys the origin still tracks.
        keys: Vec<IracKeyInfo>,
    },

    /// Instruct a member to drop tracked keys confirmed stale.
    IracCleanup {
        /// The cache the keys belong to.
        cache_name: CacheName,
        /// Keys to drop (matched by owner).
        keys: Vec<IracKeyInfo>,
    },
}

/// Responses to [`ClusterMessage`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterResponse {
    /// The topology update was installed (or discarded as stale).
    TopologyInstalled(TopologyAck),
    /// Generic success.
    Ok,
}

/// Pending-key state moved between members when segment ownership changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IracStateEntry {
    /// The key's segment.
    pub segment: SegmentId,
    /// The raw storage key.
    pub key: Bytes,
    /// Request that produced the update.
    pub owner: RequestId,
    /// Version metadata, if any.
    pub tombstone: Option<IracTombstone>,
    /// Whether the tracked change is an expiration.
    pub expiration: bool,
}

/// One key update shipped to a backup site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IracUpdate {
    /// The key's segment.
    pub segment: SegmentId,
    /// The raw storage key.
    pub key: Bytes,
    /// New value; absent for removals and expirations.
    pub value: Option<Bytes>,
    /// Version metadata used for conflict resolution.
    pub tombstone: Option<IracTombstone>,
    /// Whether this update is an expiration. Expirations never win a
    /// conflict against a concurrent remote write.
    pub expiration: bool,
    /// Request that produced the update.
    pub owner: RequestId,
}

/// A batch of updates for one backup site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IracUpdateBatch {
    /// The cache the updates belong to.
    pub cache_name: CacheName,
    /// Site that produced the updates.
    pub origin_site: String,
    /// The updates, oldest first.
    pub updates: Vec<IracUpdate>,
}

impl IracUpdateBatch {
    /// Number of updates in the batch.
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Site to site: discard all tracked keys for a cache.
///
/// Sent when a cluster-wide clear also clears the backup sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IracClearKeysRequest {
    /// The cache to clear.
    pub cache_name: CacheName,
    /// Site requesting the clear.
    pub origin_site: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_message_round_trip() {
        let msg = ClusterMessage::IracStateRequest {
            cache_name: "users".into(),
            requestor: 3,
            segments: vec![1, 5, 9],
        };
        let bytes = bincode::serialize(&msg).unwrap();
        match bincode::deserialize::<ClusterMessage>(&bytes).unwrap() {
            ClusterMessage::IracStateRequest {
                cache_name,
                requestor,
                segments,
            } => {
                assert_eq!(cache_name, "users");
                assert_eq!(requestor, 3);
                assert_eq!(segments, vec![1, 5, 9]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_update_batch_round_trip() {
        let batch = IracUpdateBatch {
            cache_name: "users".into(),
            origin_site: "LON".into(),
            updates: vec![IracUpdate {
                segment: 4,
                key: Bytes::from_static(b"k"),
                value: Some(Bytes::from_static(b"v")),
                tombstone: None,
                expiration: false,
                owner: RequestId::new(1, 9),
            }],
        };
        let bytes = bincode::serialize(&batch).unwrap();
        let decoded: IracUpdateBatch = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.updates[0].key, Bytes::from_static(b"k"));
        assert_eq!(decoded.updates[0].owner, RequestId::new(1, 9));
    }
}
