//! Consistent hashing: segment-to-owner assignment and balancing.
//!
//! Keys are partitioned into a fixed number of segments. A [`ConsistentHash`]
//! maps every segment to an ordered list of owning members (primary first,
//! then backups) and is immutable: membership or rebalance events always
//! produce a new instance through the [`ConsistentHashFactory`], never mutate
//! an existing one, so readers share snapshots by reference without locks.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConsistentHashFactory                        │
//! │                                                             │
//! │  create(owners, segments, members)   ──────────► CH v1      │
//! │  update_members(CH v1, members')     ──────────► CH v2      │
//! │  rebalance(CH v2)                    ──────────► CH v3      │
//! │                                                             │
//! │  Pure computation: same input, same output on every node.   │
//! └─────────────────────────────────────────────────────────────┘
//!
//!  segment 0 → [ node 2 (primary), node 5 ]
//!  segment 1 → [ node 5 (primary), node 7 ]
//!  ...
//!  key → XxHash64(key) mod num_segments → segment → owners
//! ```
//!
//! The factory is deterministic: when several equally balanced assignments
//! exist it breaks ties by member order, so independent replicas recompute
//! identical hashes from identical inputs without re-broadcast.

mod consistent_hash;
mod factory;
mod statistics;

pub use consistent_hash::{CacheMode, ConsistentHash};
pub use factory::{CapacityHints, ConsistentHashFactory};
pub use statistics::OwnershipStatistics;
