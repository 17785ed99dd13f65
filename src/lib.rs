//! Segment-partitioned in-memory data grid with coordinated rebalancing
//! and asynchronous cross-site replication.
//!
//! This crate provides the coordination core of a distributed cache:
//! - **Consistent hashing** over a fixed number of segments, with a
//!   deterministic factory that keeps ownership balanced as members come
//!   and go
//! - **Topology coordination**: a coordinator drives phased rebalances and
//!   every member installs versioned topology snapshots idempotently
//! - **IRAC**: asynchronous replication of local writes to remote sites
//!   with deterministic conflict resolution
//!
//! # Example
//!
//! ```rust,ignore
//! use gridmesh::config::GridConfig;
//! use gridmesh::hashing::{CacheMode, ConsistentHashFactory};
//!
//! // Compute a balanced ownership assignment for three members.
//! let factory = ConsistentHashFactory::new(CacheMode::Distributed);
//! let ch = factory.create(2, 256, &[1, 2, 3], None)?;
//! assert_eq!(ch.locate_owners(0).len(), 2);
//! # Ok::<(), gridmesh::Error>(())
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  TopologyCoordinator                 │
//! │   membership change → factory → CacheTopology vN+1   │
//! └──────────────────────────┬──────────────────────────┘
//!                            │ broadcast / ack
//!            ┌───────────────┼───────────────┐
//!            ▼               ▼               ▼
//!      ┌──────────┐    ┌──────────┐    ┌──────────┐
//!      │ member A │    │ member B │    │ member C │   TopologyUpdateHandler
//!      └────┬─────┘    └──────────┘    └──────────┘
//!           │ local writes
//!           ▼
//!      ┌──────────┐    async, at-least-once    ┌──────────┐
//!      │   IRAC   │ ─────────────────────────► │ site NYC │
//!      │  manager │ ◄───────────────────────── │ (remote) │
//!      └──────────┘    conflict resolution     └──────────┘
//! ```
//!
//! Client protocol front-ends, persistent stores and metrics collection
//! are external collaborators reached through the narrow interfaces in
//! [`transport`] and [`container`].

pub mod config;
pub mod container;
pub mod error;
pub mod hashing;
pub mod irac;
pub mod testing;
pub mod topology;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use config::{GridConfig, IracConfig, TopologyConfig};
pub use error::{Error, Result};
pub use types::{CacheName, NodeId, RequestId, RequestIdGenerator, SegmentId};

// Re-export hashing types
pub use hashing::{CacheMode, CapacityHints, ConsistentHash, ConsistentHashFactory, OwnershipStatistics};

// Re-export topology types
pub use topology::{
    AvailabilityMode, CacheJoinInfo, CacheTopology, TopologyAck, TopologyCoordinator,
    TopologyListener, TopologyPhase, TopologyUpdateCommand, TopologyUpdateHandler,
};

// Re-export replication types
pub use irac::{
    ConflictOutcome, ConflictPolicy, ConflictSide, DefaultConflictPolicy, IracCounterSnapshot,
    IracKeyInfo, IracManager, IracResolution, IracTombstone, IracVersion, IracVersionGenerator,
    XSiteState,
};

// Re-export collaborator interfaces
pub use container::{ContainerEntry, DataContainer, InMemoryContainer, InMemoryStore, StoreAdapter};
pub use transport::{
    BackupSite, ClusterMessage, ClusterResponse, ClusterTransport, IracClearKeysRequest,
    IracStateEntry, IracUpdate, IracUpdateBatch,
};
