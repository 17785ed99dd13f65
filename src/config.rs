//! Configuration types for the data grid.

use crate::hashing::CacheMode;
use crate::topology::CacheJoinInfo;
use crate::types::NodeId;
use std::time::Duration;

/// Main configuration for one grid node.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Ownership mode for caches created by this node.
    pub cache_mode: CacheMode,

    /// Number of segments per cache. Fixed for a cache's lifetime.
    pub num_segments: u32,

    /// Desired replication factor (primary + backups).
    pub num_owners: usize,

    /// Topology coordination settings.
    pub topology: TopologyConfig,

    /// Cross-site replication settings.
    pub irac: IracConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            cache_mode: CacheMode::Distributed,
            num_segments: 256,
            num_owners: 2,
            topology: TopologyConfig::default(),
            irac: IracConfig::default(),
        }
    }
}

impl GridConfig {
    /// Create a configuration for the given node.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Set the ownership mode.
    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    /// Set the number of segments.
    pub fn with_num_segments(mut self, segments: u32) -> Self {
        self.num_segments = segments;
        self
    }

    /// Set the replication factor.
    pub fn with_num_owners(mut self, owners: usize) -> Self {
        self.num_owners = owners;
        self
    }

    /// Set topology settings.
    pub fn with_topology_config(mut self, topology: TopologyConfig) -> Self {
        self.topology = topology;
        self
    }

    /// Set cross-site replication settings.
    pub fn with_irac_config(mut self, irac: IracConfig) -> Self {
        self.irac = irac;
        self
    }

    /// The join information this node announces to the coordinator.
    pub fn join_info(&self) -> CacheJoinInfo {
        CacheJoinInfo {
            cache_mode: self.cache_mode,
            num_segments: self.num_segments,
            num_owners: self.num_owners,
        }
    }
}

/// Topology coordination configuration.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Whether membership changes trigger rebalancing automatically.
    /// When disabled, warranted rebalances are queued until re-enabled.
    pub rebalancing_enabled: bool,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            rebalancing_enabled: true,
        }
    }
}

/// Cross-site replication configuration.
#[derive(Debug, Clone)]
pub struct IracConfig {
    /// Name of the local site.
    pub site_name: String,

    /// Maximum keys shipped to a site per send cycle.
    pub batch_size: usize,

    /// Interval between background send cycles.
    pub send_interval: Duration,
}

impl Default for IracConfig {
    fn default() -> Self {
        Self {
            site_name: "LOCAL".to_string(),
            batch_size: 1024,
            send_interval: Duration::from_millis(100),
        }
    }
}

impl IracConfig {
    /// Create a configuration for the given site name.
    pub fn new(site_name: impl Into<String>) -> Self {
        Self {
            site_name: site_name.into(),
            ..Default::default()
        }
    }

    /// Set the per-cycle batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the send-cycle interval.
    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = interval;
        self
    }
}
