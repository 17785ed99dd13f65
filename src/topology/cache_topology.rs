//! Versioned topology snapshots.

use crate::error::{Result, TopologyError};
use crate::hashing::ConsistentHash;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Rebalance phase of a cache topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyPhase {
    /// No rebalance in progress; reads and writes use the current hash.
    NoRebalance,
    /// Rebalance started: reads use the current hash, writes go to the
    /// union of current and pending owners.
    ReadOldWriteAll,
    /// New owners have received state: reads consult both hashes.
    ReadAllWriteAll,
    /// Old owners are no longer read; one confirmation round away from
    /// promoting the pending hash.
    ReadNewWriteAll,
    /// Partition-merge conflict resolution is running on top of the
    /// rebalance; reads stay on the current hash.
    ConflictResolution,
}

impl TopologyPhase {
    /// Whether this phase is part of an in-flight rebalance.
    pub fn is_rebalance(self) -> bool {
        !matches!(self, TopologyPhase::NoRebalance)
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            TopologyPhase::NoRebalance => "NoRebalance",
            TopologyPhase::ReadOldWriteAll => "ReadOldWriteAll",
            TopologyPhase::ReadAllWriteAll => "ReadAllWriteAll",
            TopologyPhase::ReadNewWriteAll => "ReadNewWriteAll",
            TopologyPhase::ConflictResolution => "ConflictResolution",
        }
    }
}

impl fmt::Display for TopologyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Availability of a cache under partition handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvailabilityMode {
    /// Normal operation.
    Available,
    /// The partition lost quorum; rebalancing is suspended and members
    /// operate in degraded mode until availability is restored.
    Degraded,
}

/// Immutable, versioned snapshot of a cache's ownership.
///
/// Created by the coordinator, broadcast to members, installed read-only.
/// Any field change produces a new snapshot with a higher `topology_id`;
/// `rebalance_id` only moves when a new rebalance starts.
#[derive(Debug, Clone)]
pub struct CacheTopology {
    topology_id: u64,
    rebalance_id: u64,
    current_ch: Arc<ConsistentHash>,
    pending_ch: Option<Arc<ConsistentHash>>,
    phase: TopologyPhase,
    actual_members: Vec<NodeId>,
    persistent_uuids: Vec<Uuid>,
}

impl CacheTopology {
    /// Build a topology snapshot, validating internal consistency.
    ///
    /// A pending hash without a rebalance phase (or the reverse) indicates
    /// a protocol bug; construction fails instead of propagating the
    /// corrupted state.
    pub fn new(
        topology_id: u64,
        rebalance_id: u64,
        current_ch: Arc<ConsistentHash>,
        pending_ch: Option<Arc<ConsistentHash>>,
        phase: TopologyPhase,
        actual_members: Vec<NodeId>,
        persistent_uuids: Vec<Uuid>,
    ) -> Result<Self> {
        if pending_ch.is_some() != phase.is_rebalance() {
            return Err(TopologyError::InconsistentTopology {
                phase: phase.name(),
                has_pending: pending_ch.is_some(),
            }
            .into());
        }
        Ok(Self {
            topology_id,
            rebalance_id,
            current_ch,
            pending_ch,
            phase,
            actual_members,
            persistent_uuids,
        })
    }

    /// Monotonically increasing topology version.
    pub fn topology_id(&self) -> u64 {
        self.topology_id
    }

    /// Monotonically increasing rebalance counter.
    pub fn rebalance_id(&self) -> u64 {
        self.rebalance_id
    }

    /// The hash currently in effect.
    pub fn current_ch(&self) -> &Arc<ConsistentHash> {
        &self.current_ch
    }

    /// The hash being moved toward, if a rebalance is in progress.
    pub fn pending_ch(&self) -> Option<&Arc<ConsistentHash>> {
        self.pending_ch.as_ref()
    }

    /// Current rebalance phase.
    pub fn phase(&self) -> TopologyPhase {
        self.phase
    }

    /// Members confirmed alive and participating.
    pub fn actual_members(&self) -> &[NodeId] {
        &self.actual_members
    }

    /// Stable per-node identifiers, aligned with `actual_members`.
    pub fn persistent_uuids(&self) -> &[Uuid] {
        &self.persistent_uuids
    }

    /// The hash reads should consult in the current phase.
    pub fn read_consistent_hash(&self) -> Arc<ConsistentHash> {
        match self.phase {
            TopologyPhase::NoRebalance
            | TopologyPhase::ReadOldWriteAll
            | TopologyPhase::ConflictResolution => self.current_ch.clone(),
            TopologyPhase::ReadAllWriteAll => Arc::new(
                self.current_ch
                    .union(self.pending_ch.as_ref().expect("rebalance phase has pending")),
            ),
            TopologyPhase::ReadNewWriteAll => self
                .pending_ch
                .as_ref()
                .expect("rebalance phase has pending")
                .clone(),
        }
    }

    /// The hash writes must reach in the current phase.
    ///
    /// During any rebalance phase writes go to both old and new owners so
    /// that no phase transition can lose an in-flight write.
    pub fn write_consistent_hash(&self) -> Arc<ConsistentHash> {
        match &self.pending_ch {
            None => self.current_ch.clone(),
            Some(pending) => Arc::new(self.current_ch.union(pending)),
        }
    }
}
