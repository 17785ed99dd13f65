//! Wire commands exchanged between the coordinator and members.

use crate::error::Result;
use crate::hashing::ConsistentHash;
use crate::topology::cache_topology::{AvailabilityMode, CacheTopology, TopologyPhase};
use crate::types::{CacheName, NodeId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Coordinator to member: install an updated cache topology.
///
/// Also signals the end of a rebalance (phase back to `NoRebalance`).
/// Members apply the command idempotently: stale `topology_id` or `view_id`
/// values are discarded, so redelivery and reordering are harmless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyUpdateCommand {
    /// The cache whose topology changed.
    pub cache_name: CacheName,
    /// Coordinator node that produced the update.
    pub origin: NodeId,
    /// Hash currently in effect.
    pub current_ch: ConsistentHash,
    /// Hash being moved toward, absent outside a rebalance.
    pub pending_ch: Option<ConsistentHash>,
    /// Rebalance phase.
    pub phase: TopologyPhase,
    /// Members confirmed alive and participating.
    pub actual_members: Vec<NodeId>,
    /// Stable node identifiers aligned with `actual_members`.
    pub persistent_uuids: Vec<Uuid>,
    /// Availability under partition handling.
    pub availability_mode: AvailabilityMode,
    /// Rebalance counter.
    pub rebalance_id: u64,
    /// Topology version.
    pub topology_id: u64,
    /// Cluster view the coordinator observed when broadcasting.
    pub view_id: u64,
}

impl TopologyUpdateCommand {
    /// Build a command from a topology snapshot.
    pub fn new(
        cache_name: impl Into<CacheName>,
        origin: NodeId,
        topology: &CacheTopology,
        availability_mode: AvailabilityMode,
        view_id: u64,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            origin,
            current_ch: topology.current_ch().as_ref().clone(),
            pending_ch: topology.pending_ch().map(|ch| ch.as_ref().clone()),
            phase: topology.phase(),
            actual_members: topology.actual_members().to_vec(),
            persistent_uuids: topology.persistent_uuids().to_vec(),
            availability_mode,
            rebalance_id: topology.rebalance_id(),
            topology_id: topology.topology_id(),
            view_id,
        }
    }

    /// Reconstruct the topology snapshot carried by this command.
    pub fn to_topology(&self) -> Result<CacheTopology> {
        CacheTopology::new(
            self.topology_id,
            self.rebalance_id,
            Arc::new(self.current_ch.clone()),
            self.pending_ch.clone().map(Arc::new),
            self.phase,
            self.actual_members.clone(),
            self.persistent_uuids.clone(),
        )
    }

    /// Serialize the command to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a command from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Member to coordinator: the topology update was installed (or discarded
/// as stale, which counts as success).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyAck {
    /// The cache the ack refers to.
    pub cache_name: CacheName,
    /// Acknowledging member.
    pub node: NodeId,
    /// The topology version the member acknowledges.
    pub topology_id: u64,
}
