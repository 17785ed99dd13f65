//! Coordinator-side topology state machine.

use crate::error::{Result, TopologyError};
use crate::hashing::{CacheMode, ConsistentHash, ConsistentHashFactory};
use crate::topology::cache_topology::{AvailabilityMode, CacheTopology, TopologyPhase};
use crate::topology::commands::TopologyUpdateCommand;
use crate::transport::{ClusterMessage, ClusterTransport};
use crate::types::{CacheName, NodeId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// First topology id handed to a newly created cache.
const INITIAL_TOPOLOGY_ID: u64 = 1;

/// Static cache parameters announced by a joining member.
#[derive(Debug, Clone, Copy)]
pub struct CacheJoinInfo {
    /// Ownership mode.
    pub cache_mode: CacheMode,
    /// Number of segments, fixed for the cache's lifetime.
    pub num_segments: u32,
    /// Desired replication factor.
    pub num_owners: usize,
}

/// Per-cache coordinator state.
struct CacheStatus {
    join_info: CacheJoinInfo,
    /// Members in join order.
    members: Vec<NodeId>,
    uuids: HashMap<NodeId, Uuid>,
    topology: Option<CacheTopology>,
    availability: AvailabilityMode,
    /// Members that confirmed the currently broadcast topology id.
    confirmations: HashSet<NodeId>,
    /// A rebalance was warranted while rebalancing was disabled.
    queued_rebalance: bool,
}

impl CacheStatus {
    fn new(join_info: CacheJoinInfo) -> Self {
        Self {
            join_info,
            members: Vec::new(),
            uuids: HashMap::new(),
            topology: None,
            availability: AvailabilityMode::Available,
            confirmations: HashSet::new(),
            queued_rebalance: false,
        }
    }

    fn factory(&self) -> ConsistentHashFactory {
        ConsistentHashFactory::new(self.join_info.cache_mode)
    }

    fn uuid_list(&self) -> Vec<Uuid> {
        self.members
            .iter()
            .map(|m| self.uuids.get(m).copied().unwrap_or_else(Uuid::nil))
            .collect()
    }

    /// Replace the topology and restart confirmation collection.
    fn install(&mut self, topology: CacheTopology) {
        self.confirmations.clear();
        self.topology = Some(topology);
    }

    fn topology_id(&self) -> u64 {
        self.topology.as_ref().map(|t| t.topology_id()).unwrap_or(0)
    }
}

/// Drives topology changes for every cache this node coordinates.
///
/// Which member holds the coordinator role is decided by an external
/// leader-election collaborator; this component only implements what the
/// coordinator does: decide when to rebalance, build the next topology
/// snapshot, broadcast it, and advance the phase once every member
/// confirmed.
pub struct TopologyCoordinator {
    local: NodeId,
    transport: Arc<dyn ClusterTransport>,
    caches: RwLock<HashMap<CacheName, CacheStatus>>,
    view_id: AtomicU64,
    rebalancing_enabled: AtomicBool,
}

impl TopologyCoordinator {
    /// Create a coordinator backed by the given transport.
    pub fn new(transport: Arc<dyn ClusterTransport>) -> Self {
        Self {
            local: transport.local_node(),
            transport,
            caches: RwLock::new(HashMap::new()),
            view_id: AtomicU64::new(1),
            rebalancing_enabled: AtomicBool::new(true),
        }
    }

    /// Record a new cluster view id (monotonic).
    pub fn update_view_id(&self, view_id: u64) {
        self.view_id.fetch_max(view_id, Ordering::SeqCst);
    }

    /// The topology currently installed for a cache, if any.
    pub fn current_topology(&self, cache_name: &str) -> Option<CacheTopology> {
        self.caches
            .read()
            .get(cache_name)
            .and_then(|s| s.topology.clone())
    }

    /// The availability mode of a cache.
    pub fn availability_mode(&self, cache_name: &str) -> Option<AvailabilityMode> {
        self.caches.read().get(cache_name).map(|s| s.availability)
    }

    /// Whether automatic rebalancing is enabled.
    pub fn is_rebalancing_enabled(&self) -> bool {
        self.rebalancing_enabled.load(Ordering::SeqCst)
    }

    /// A member joins a cache. Creates the cache on first join, otherwise
    /// triggers a rebalance if the balance invariant no longer holds.
    ///
    /// Returns the topology the joiner should start from.
    pub async fn handle_join(
        &self,
        cache_name: &str,
        joiner: NodeId,
        persistent_uuid: Uuid,
        join_info: CacheJoinInfo,
    ) -> Result<CacheTopology> {
        {
            let mut caches = self.caches.write();
            let status = caches
                .entry(cache_name.to_string())
                .or_insert_with(|| CacheStatus::new(join_info));
            if !status.members.contains(&joiner) {
                status.members.push(joiner);
            }
            status.uuids.insert(joiner, persistent_uuid);

            if status.topology.is_none() {
                let factory = status.factory();
                let ch = factory.create(
                    status.join_info.num_owners,
                    status.join_info.num_segments,
                    &status.members,
                    None,
                )?;
                let topology = CacheTopology::new(
                    INITIAL_TOPOLOGY_ID,
                    1,
                    Arc::new(ch),
                    None,
                    TopologyPhase::NoRebalance,
                    status.members.clone(),
                    status.uuid_list(),
                )?;
                info!(cache = cache_name, joiner, "Creating initial cache topology");
                status.install(topology);
            } else {
                info!(cache = cache_name, joiner, "Member joined");
                self.trigger_rebalance_locked(cache_name, status)?;
            }
        }
        self.publish(cache_name).await?;
        self.current_topology(cache_name)
            .ok_or_else(|| TopologyError::CacheNotFound(cache_name.to_string()).into())
    }

    /// A member left (gracefully or suspected failed).
    ///
    /// Mid-rebalance the pending hash is recomputed without the leaver and
    /// re-broadcast at the same phase; the protocol never continues with a
    /// hash that still references a departed member.
    pub async fn handle_leave(&self, cache_name: &str, leaver: NodeId) -> Result<()> {
        {
            let mut caches = self.caches.write();
            let Some(status) = caches.get_mut(cache_name) else {
                return Ok(());
            };
            if !status.members.contains(&leaver) {
                return Ok(());
            }
            info!(cache = cache_name, leaver, "Member left");
            Self::remove_members_locked(cache_name, status, &[leaver])?;
            if status.members.is_empty() {
                caches.remove(cache_name);
                return Ok(());
            }
            if status
                .topology
                .as_ref()
                .is_some_and(|t| !t.phase().is_rebalance())
            {
                self.trigger_rebalance_locked(cache_name, status)?;
            }
        }
        self.publish(cache_name).await
    }

    /// Change the availability mode of a cache.
    ///
    /// Entering degraded mode suspends phase advancement; restoring
    /// availability resumes it.
    pub async fn set_availability_mode(
        &self,
        cache_name: &str,
        mode: AvailabilityMode,
    ) -> Result<()> {
        {
            let mut caches = self.caches.write();
            let status = caches
                .get_mut(cache_name)
                .ok_or_else(|| TopologyError::CacheNotFound(cache_name.to_string()))?;
            if status.availability == mode {
                return Ok(());
            }
            info!(cache = cache_name, ?mode, "Availability mode changed");
            status.availability = mode;
            if let Some(t) = &status.topology {
                // Re-version so members observe the new mode.
                let bumped = CacheTopology::new(
                    t.topology_id() + 1,
                    t.rebalance_id(),
                    t.current_ch().clone(),
                    t.pending_ch().cloned(),
                    t.phase(),
                    t.actual_members().to_vec(),
                    t.persistent_uuids().to_vec(),
                )?;
                status.install(bumped);
            }
        }
        self.publish(cache_name).await
    }

    /// Enable or disable automatic rebalancing.
    ///
    /// Rebalances warranted while disabled are queued and start as soon as
    /// rebalancing is re-enabled.
    pub async fn set_rebalancing_enabled(&self, enabled: bool) -> Result<()> {
        self.rebalancing_enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            return Ok(());
        }
        let names: Vec<CacheName> = self.caches.read().keys().cloned().collect();
        for cache_name in names {
            let queued = {
                let mut caches = self.caches.write();
                match caches.get_mut(&cache_name) {
                    Some(status) if status.queued_rebalance => {
                        self.trigger_rebalance_locked(&cache_name, status)?;
                        true
                    }
                    _ => false,
                }
            };
            if queued {
                self.publish(&cache_name).await?;
            }
        }
        Ok(())
    }

    /// Start a rebalance if the membership or balance changed. Must be
    /// called with the cache status locked and a stable topology installed.
    fn trigger_rebalance_locked(&self, cache_name: &str, status: &mut CacheStatus) -> Result<()> {
        let Some(topology) = status.topology.clone() else {
            return Ok(());
        };
        if topology.phase().is_rebalance() {
            // Superseded once the current rebalance finishes.
            status.queued_rebalance = true;
            return Ok(());
        }
        if !self.rebalancing_enabled.load(Ordering::SeqCst) {
            debug!(cache = cache_name, "Rebalancing disabled, queueing");
            status.queued_rebalance = true;
            return Ok(());
        }
        status.queued_rebalance = false;

        let factory = status.factory();
        let updated = factory.update_members(topology.current_ch(), &status.members, None)?;
        let balanced = factory.rebalance(&updated);

        if balanced == updated {
            if updated != **topology.current_ch() {
                // Membership changed but the assignment is already
                // balanced; a plain topology update is enough.
                let next = CacheTopology::new(
                    topology.topology_id() + 1,
                    topology.rebalance_id(),
                    Arc::new(updated),
                    None,
                    TopologyPhase::NoRebalance,
                    status.members.clone(),
                    status.uuid_list(),
                )?;
                status.install(next);
            }
            return Ok(());
        }

        let next = CacheTopology::new(
            topology.topology_id() + 1,
            topology.rebalance_id() + 1,
            Arc::new(updated),
            Some(Arc::new(balanced)),
            TopologyPhase::ReadOldWriteAll,
            status.members.clone(),
            status.uuid_list(),
        )?;
        info!(
            cache = cache_name,
            topology_id = next.topology_id(),
            rebalance_id = next.rebalance_id(),
            "Starting rebalance"
        );
        status.install(next);
        Ok(())
    }

    /// Drop members from a cache and recompute its hashes, keeping the
    /// rebalance phase if one is in flight.
    fn remove_members_locked(
        cache_name: &str,
        status: &mut CacheStatus,
        leavers: &[NodeId],
    ) -> Result<()> {
        status.members.retain(|m| !leavers.contains(m));
        for leaver in leavers {
            status.uuids.remove(leaver);
        }
        if status.members.is_empty() {
            status.topology = None;
            return Ok(());
        }
        let Some(topology) = status.topology.clone() else {
            return Ok(());
        };
        let factory = status.factory();
        let current = factory.update_members(topology.current_ch(), &status.members, None)?;
        let pending = topology
            .pending_ch()
            .map(|p| factory.update_members(p, &status.members, None))
            .transpose()?;
        let next = CacheTopology::new(
            topology.topology_id() + 1,
            topology.rebalance_id(),
            Arc::new(current),
            pending.map(Arc::new),
            topology.phase(),
            status.members.clone(),
            status.uuid_list(),
        )?;
        debug!(
            cache = cache_name,
            topology_id = next.topology_id(),
            phase = %next.phase(),
            "Recomputed topology after members left"
        );
        status.install(next);
        // The departure may have left the assignment unbalanced; check
        // again once the current rebalance (if any) completes.
        status.queued_rebalance = true;
        Ok(())
    }

    /// Broadcast the latest topology until every member confirmed it,
    /// advancing rebalance phases as confirmation rounds complete.
    ///
    /// An unreachable member is treated as a leave: it is removed from the
    /// membership, the topology recomputed and re-broadcast, rather than
    /// retrying against a dead peer forever.
    async fn publish(&self, cache_name: &str) -> Result<()> {
        loop {
            let Some((command, targets)) = self.broadcast_plan(cache_name) else {
                return Ok(());
            };
            let topology_id = command.topology_id;

            let mut failed = Vec::new();
            for node in targets {
                let message = ClusterMessage::TopologyUpdate(command.clone());
                match self.transport.send(node, message).await {
                    Ok(_) => {
                        let mut caches = self.caches.write();
                        if let Some(status) = caches.get_mut(cache_name) {
                            if status.topology_id() == topology_id {
                                status.confirmations.insert(node);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            cache = cache_name,
                            node,
                            error = %e,
                            "Member unreachable during topology broadcast"
                        );
                        failed.push(node);
                    }
                }
            }

            if !failed.is_empty() {
                let mut caches = self.caches.write();
                if let Some(status) = caches.get_mut(cache_name) {
                    Self::remove_members_locked(cache_name, status, &failed)?;
                    if status.members.is_empty() {
                        caches.remove(cache_name);
                        return Ok(());
                    }
                }
                continue;
            }

            let advanced = {
                let mut caches = self.caches.write();
                match caches.get_mut(cache_name) {
                    Some(status) => self.try_advance_locked(cache_name, status)?,
                    None => false,
                }
            };
            if !advanced {
                return Ok(());
            }
        }
    }

    fn broadcast_plan(&self, cache_name: &str) -> Option<(TopologyUpdateCommand, Vec<NodeId>)> {
        let caches = self.caches.read();
        let status = caches.get(cache_name)?;
        let topology = status.topology.as_ref()?;
        let command = TopologyUpdateCommand::new(
            cache_name,
            self.local,
            topology,
            status.availability,
            self.view_id.load(Ordering::SeqCst),
        );
        Some((command, status.members.clone()))
    }

    /// Advance the rebalance phase once every member confirmed the current
    /// topology. Returns `true` when a new topology was installed and must
    /// be broadcast.
    fn try_advance_locked(&self, cache_name: &str, status: &mut CacheStatus) -> Result<bool> {
        let Some(topology) = status.topology.clone() else {
            return Ok(false);
        };
        if !topology.phase().is_rebalance() {
            if status.queued_rebalance {
                let before = status.topology_id();
                self.trigger_rebalance_locked(cache_name, status)?;
                return Ok(status.topology_id() != before);
            }
            return Ok(false);
        }
        if status.availability == AvailabilityMode::Degraded {
            debug!(cache = cache_name, "Phase advancement suspended while degraded");
            return Ok(false);
        }
        if !status
            .members
            .iter()
            .all(|m| status.confirmations.contains(m))
        {
            return Ok(false);
        }

        let next = match topology.phase() {
            TopologyPhase::ReadOldWriteAll => CacheTopology::new(
                topology.topology_id() + 1,
                topology.rebalance_id(),
                topology.current_ch().clone(),
                topology.pending_ch().cloned(),
                TopologyPhase::ReadAllWriteAll,
                status.members.clone(),
                status.uuid_list(),
            )?,
            TopologyPhase::ReadAllWriteAll => CacheTopology::new(
                topology.topology_id() + 1,
                topology.rebalance_id(),
                topology.current_ch().clone(),
                topology.pending_ch().cloned(),
                TopologyPhase::ReadNewWriteAll,
                status.members.clone(),
                status.uuid_list(),
            )?,
            TopologyPhase::ReadNewWriteAll => {
                let promoted: Arc<ConsistentHash> = topology
                    .pending_ch()
                    .cloned()
                    .expect("rebalance phase has pending");
                let done = CacheTopology::new(
                    topology.topology_id() + 1,
                    topology.rebalance_id(),
                    promoted,
                    None,
                    TopologyPhase::NoRebalance,
                    status.members.clone(),
                    status.uuid_list(),
                )?;
                info!(
                    cache = cache_name,
                    topology_id = done.topology_id(),
                    rebalance_id = done.rebalance_id(),
                    "Rebalance complete"
                );
                done
            }
            TopologyPhase::ConflictResolution => CacheTopology::new(
                topology.topology_id() + 1,
                topology.rebalance_id(),
                topology.current_ch().clone(),
                topology.pending_ch().cloned(),
                TopologyPhase::ReadOldWriteAll,
                status.members.clone(),
                status.uuid_list(),
            )?,
            TopologyPhase::NoRebalance => unreachable!("checked above"),
        };
        debug!(
            cache = cache_name,
            topology_id = next.topology_id(),
            phase = %next.phase(),
            "Advancing rebalance phase"
        );
        status.install(next);
        Ok(true)
    }
}

impl std::fmt::Debug for TopologyCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyCoordinator")
            .field("local", &self.local)
            .field("caches", &self.caches.read().len())
            .finish()
    }
}
