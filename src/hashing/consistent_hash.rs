//! Immutable segment-to-owner mapping.

use crate::types::{NodeId, SegmentId};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Ownership mode of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMode {
    /// Each segment is owned by `num_owners` members.
    Distributed,
    /// Every member owns every segment; only the primary role is balanced.
    Replicated,
}

/// Immutable mapping of segments to their ordered owner lists.
///
/// The first owner of each segment is the primary; the rest are backups.
/// Instances are created by the factory and never mutated afterwards;
/// topology transitions publish a new instance instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistentHash {
    mode: CacheMode,
    num_owners: usize,
    /// Members in ascending order.
    members: Vec<NodeId>,
    /// One ordered owner list per segment, primary first.
    segment_owners: Vec<Vec<NodeId>>,
}

impl ConsistentHash {
    /// Build a hash from an explicit assignment.
    ///
    /// The factory is the only production caller and guarantees the
    /// ownership invariants (every segment has at least one owner, owners
    /// are members, no duplicates within a segment).
    pub fn new(
        mode: CacheMode,
        num_owners: usize,
        members: Vec<NodeId>,
        segment_owners: Vec<Vec<NodeId>>,
    ) -> Self {
        debug_assert!(segment_owners.iter().all(|o| !o.is_empty()));
        debug_assert!(segment_owners
            .iter()
            .all(|o| o.iter().all(|n| members.contains(n))));
        Self {
            mode,
            num_owners,
            members,
            segment_owners,
        }
    }

    /// Ownership mode.
    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    /// Number of segments. Invariant for the cache's lifetime.
    pub fn num_segments(&self) -> u32 {
        self.segment_owners.len() as u32
    }

    /// Desired replication factor (primary + backups).
    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    /// Members of this hash, in ascending order.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Check whether a node is a member of this hash.
    pub fn contains_member(&self, node: NodeId) -> bool {
        self.members.binary_search(&node).is_ok()
    }

    /// Owners of a segment, primary first.
    pub fn locate_owners(&self, segment: SegmentId) -> &[NodeId] {
        &self.segment_owners[segment as usize]
    }

    /// Primary owner of a segment.
    pub fn primary_owner(&self, segment: SegmentId) -> NodeId {
        self.segment_owners[segment as usize][0]
    }

    /// Check whether a node owns a segment (as primary or backup).
    pub fn is_segment_owner(&self, segment: SegmentId, node: NodeId) -> bool {
        self.segment_owners[segment as usize].contains(&node)
    }

    /// Check whether a node is the primary owner of a segment.
    pub fn is_primary_owner(&self, segment: SegmentId, node: NodeId) -> bool {
        self.primary_owner(segment) == node
    }

    /// Map a key to its segment using the stable key hash.
    pub fn segment_for_key(&self, key: &[u8]) -> SegmentId {
        (hash_key(key) % self.segment_owners.len() as u64) as SegmentId
    }

    /// Owners of the segment a key maps to, primary first.
    pub fn owners_for_key(&self, key: &[u8]) -> &[NodeId] {
        self.locate_owners(self.segment_for_key(key))
    }

    /// All segments a node owns (as primary or backup).
    pub fn segments_for_owner(&self, node: NodeId) -> Vec<SegmentId> {
        self.segment_owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.contains(&node))
            .map(|(seg, _)| seg as SegmentId)
            .collect()
    }

    /// Segments a node owns as primary.
    pub fn primary_segments_for_owner(&self, node: NodeId) -> Vec<SegmentId> {
        self.segment_owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners[0] == node)
            .map(|(seg, _)| seg as SegmentId)
            .collect()
    }

    /// Combine this hash with another into a union hash.
    ///
    /// The union owns each segment with this hash's owners first, then the
    /// other's owners not already present. It backs the write view during a
    /// rebalance: writes must reach both the old and the new owners.
    pub fn union(&self, other: &ConsistentHash) -> ConsistentHash {
        assert_eq!(
            self.num_segments(),
            other.num_segments(),
            "cannot union hashes with different segment counts"
        );
        let mut members = self.members.clone();
        for &m in &other.members {
            if !members.contains(&m) {
                members.push(m);
            }
        }
        members.sort_unstable();

        let segment_owners = self
            .segment_owners
            .iter()
            .zip(&other.segment_owners)
            .map(|(a, b)| {
                let mut owners = a.clone();
                for &o in b {
                    if !owners.contains(&o) {
                        owners.push(o);
                    }
                }
                owners
            })
            .collect();

        ConsistentHash {
            mode: self.mode,
            num_owners: self.num_owners.max(other.num_owners),
            members,
            segment_owners,
        }
    }
}

/// Stable key hash used for segment mapping.
fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    key.hash(&mut hasher);
    hasher.finish()
}
