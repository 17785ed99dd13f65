//! Derived ownership counts for a consistent hash.

use crate::hashing::consistent_hash::ConsistentHash;
use crate::types::NodeId;
use std::collections::HashMap;

/// Read-only per-member ownership counts.
///
/// Counts are precomputed at construction in a single pass over the
/// segments, restricted to the given member subset. Used by the factory
/// tests to verify balance and by operators to inspect skew.
#[derive(Debug, Clone)]
pub struct OwnershipStatistics {
    primary_owned: HashMap<NodeId, usize>,
    owned: HashMap<NodeId, usize>,
}

impl OwnershipStatistics {
    /// Compute statistics for `members` over the given hash.
    pub fn new(ch: &ConsistentHash, members: &[NodeId]) -> Self {
        let mut primary_owned: HashMap<NodeId, usize> =
            members.iter().map(|&m| (m, 0)).collect();
        let mut owned = primary_owned.clone();

        for seg in 0..ch.num_segments() {
            let owners = ch.locate_owners(seg);
            if let Some(count) = primary_owned.get_mut(&owners[0]) {
                *count += 1;
            }
            for owner in owners {
                if let Some(count) = owned.get_mut(owner) {
                    *count += 1;
                }
            }
        }

        Self {
            primary_owned,
            owned,
        }
    }

    /// Number of segments the member owns as primary.
    pub fn primary_owned(&self, member: NodeId) -> usize {
        self.primary_owned.get(&member).copied().unwrap_or(0)
    }

    /// Number of segments the member owns in any position.
    pub fn owned(&self, member: NodeId) -> usize {
        self.owned.get(&member).copied().unwrap_or(0)
    }

    /// Sum of primary counts across the tracked members.
    pub fn sum_primary_owned(&self) -> usize {
        self.primary_owned.values().sum()
    }

    /// Sum of ownership counts across the tracked members.
    pub fn sum_owned(&self) -> usize {
        self.owned.values().sum()
    }
}
