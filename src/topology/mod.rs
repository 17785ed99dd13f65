//! Cluster topology coordination.
//!
//! A cache's topology is a versioned snapshot of who owns what: the current
//! consistent hash, the pending hash while a rebalance is in flight, the
//! rebalance phase, and the confirmed member list. Topologies are built by
//! the coordinator, broadcast to every member, installed read-only, and
//! superseded wholesale — never patched.
//!
//! # Protocol
//!
//! ```text
//!   membership change
//!         │
//!         ▼
//! ┌──────────────────┐  TopologyUpdateCommand   ┌──────────────────────┐
//! │ TopologyCoordina-│ ───────────────────────► │ TopologyUpdateHandler │
//! │ tor (coordinator │ ◄─────────────────────── │ (every member)        │
//! │ member only)     │        ack / failure     └──────────────────────┘
//! └──────────────────┘
//!         │ all acked
//!         ▼
//!   advance phase:
//!   ReadOldWriteAll → ReadAllWriteAll → ReadNewWriteAll → NoRebalance
//! ```
//!
//! Every broadcast carries a strictly increasing `topology_id`; members
//! discard anything stale or duplicated, so redelivery and reordering are
//! harmless. A member that cannot be reached is treated as a leave and the
//! topology is recomputed, never retried forever.
//!
//! Which member plays the coordinator role is decided by an external
//! leader-election collaborator; this module only implements what the
//! coordinator does.

mod cache_topology;
mod commands;
mod coordinator;
mod handler;

pub use cache_topology::{AvailabilityMode, CacheTopology, TopologyPhase};
pub use commands::{TopologyAck, TopologyUpdateCommand};
pub use coordinator::{CacheJoinInfo, TopologyCoordinator};
pub use handler::{TopologyListener, TopologyUpdateHandler};
