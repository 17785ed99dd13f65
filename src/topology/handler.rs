//! Member-side topology installation.

use crate::error::Result;
use crate::topology::cache_topology::{AvailabilityMode, CacheTopology};
use crate::topology::commands::{TopologyAck, TopologyUpdateCommand};
use crate::types::{CacheName, NodeId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Component notified after a new topology is installed locally.
///
/// The replication manager registers here to re-evaluate its pending keys
/// against the new ownership; state transfer also hangs off this hook.
#[async_trait]
pub trait TopologyListener: Send + Sync + 'static {
    /// Called with the previously installed topology (if any) and the one
    /// just installed.
    async fn on_topology_update(
        &self,
        cache_name: &str,
        old: Option<Arc<CacheTopology>>,
        new: Arc<CacheTopology>,
    );
}

struct InstalledCache {
    topology: Arc<CacheTopology>,
    availability: AvailabilityMode,
}

/// Receives broadcast topology updates, installs them locally and
/// acknowledges.
///
/// Updates are applied idempotently and strictly in `topology_id` order:
/// anything stale or duplicated is discarded (still acknowledged as
/// success) so reordered network delivery is harmless. Each cache's state
/// is independent; concurrent delivery for different caches never
/// interferes.
pub struct TopologyUpdateHandler {
    local: NodeId,
    caches: DashMap<CacheName, InstalledCache>,
    listeners: DashMap<CacheName, Vec<Arc<dyn TopologyListener>>>,
    last_view_id: AtomicU64,
}

impl TopologyUpdateHandler {
    /// Create a handler for the local node.
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            caches: DashMap::new(),
            listeners: DashMap::new(),
            last_view_id: AtomicU64::new(0),
        }
    }

    /// The local node id.
    pub fn local_node(&self) -> NodeId {
        self.local
    }

    /// Register a listener for one cache's topology changes.
    pub fn register_listener(&self, cache_name: &str, listener: Arc<dyn TopologyListener>) {
        self.listeners
            .entry(cache_name.to_string())
            .or_default()
            .push(listener);
    }

    /// The topology currently installed for a cache.
    pub fn installed_topology(&self, cache_name: &str) -> Option<Arc<CacheTopology>> {
        self.caches.get(cache_name).map(|c| c.topology.clone())
    }

    /// The availability mode last received for a cache.
    pub fn availability_mode(&self, cache_name: &str) -> Option<AvailabilityMode> {
        self.caches.get(cache_name).map(|c| c.availability)
    }

    /// The highest cluster view id observed so far.
    pub fn last_view_id(&self) -> u64 {
        self.last_view_id.load(Ordering::SeqCst)
    }

    /// Apply a broadcast topology update.
    ///
    /// Returns an ack carrying the topology id installed locally. Discarded
    /// (stale/duplicate) updates still ack successfully. An internally
    /// inconsistent topology aborts processing for the cache with an error.
    pub async fn handle_topology_update(
        &self,
        command: &TopologyUpdateCommand,
    ) -> Result<TopologyAck> {
        let previous_view = self
            .last_view_id
            .fetch_max(command.view_id, Ordering::SeqCst);
        if command.view_id < previous_view {
            debug!(
                cache = %command.cache_name,
                view_id = command.view_id,
                last_view_id = previous_view,
                "Discarding topology update from an old cluster view"
            );
            return Ok(self.ack(&command.cache_name, command.topology_id));
        }

        // Validate before touching any state so a corrupted topology never
        // becomes visible.
        let new_topology = Arc::new(command.to_topology()?);

        let (old, installed) = {
            let mut entry = self
                .caches
                .entry(command.cache_name.clone())
                .or_insert_with(|| InstalledCache {
                    topology: new_topology.clone(),
                    availability: command.availability_mode,
                });
            let current_id = entry.topology.topology_id();
            if !Arc::ptr_eq(&entry.topology, &new_topology)
                && command.topology_id <= current_id
            {
                debug!(
                    cache = %command.cache_name,
                    topology_id = command.topology_id,
                    installed = current_id,
                    "Discarding stale topology update"
                );
                return Ok(self.ack(&command.cache_name, current_id));
            }
            let old = if Arc::ptr_eq(&entry.topology, &new_topology) {
                None
            } else {
                Some(std::mem::replace(&mut entry.topology, new_topology.clone()))
            };
            entry.availability = command.availability_mode;
            (old, new_topology.clone())
        };

        info!(
            cache = %command.cache_name,
            topology_id = installed.topology_id(),
            phase = %installed.phase(),
            origin = command.origin,
            "Installed topology"
        );

        let listeners = self
            .listeners
            .get(&command.cache_name)
            .map(|l| l.clone())
            .unwrap_or_default();
        for listener in listeners {
            listener
                .on_topology_update(&command.cache_name, old.clone(), installed.clone())
                .await;
        }

        Ok(self.ack(&command.cache_name, installed.topology_id()))
    }

    fn ack(&self, cache_name: &str, topology_id: u64) -> TopologyAck {
        TopologyAck {
            cache_name: cache_name.to_string(),
            node: self.local,
            topology_id,
        }
    }
}

impl std::fmt::Debug for TopologyUpdateHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyUpdateHandler")
            .field("local", &self.local)
            .field("caches", &self.caches.len())
            .finish()
    }
}
