//! Cross-site asynchronous replication (IRAC).
//!
//! Every write applied locally is tracked until all configured backup
//! sites acknowledge it. A background sender ships batches per site;
//! conflicting concurrent updates from remote sites are resolved
//! deterministically using per-site version vectors and a pluggable
//! policy.
//!
//! # Architecture
//!
//! ```text
//!  local write ──► track_updated_key ─┐
//!  local expiry ─► track_expired_key ─┤
//!                                     ▼
//!                        ┌─────────────────────────┐
//!                        │  pending-key table      │  at most one live
//!                        │  key → entry (owner,    │  entry per key;
//!                        │  segment, tombstone)    │  atomic replace
//!                        └───────────┬─────────────┘
//!                                    │ send cycle (batched per site)
//!                 ┌──────────────────┼──────────────────┐
//!                 ▼                  ▼                  ▼
//!            site "NYC"         site "SFO"         site "BER"
//!                 │ ack              │ ack              │ ack
//!                 └────────── entry removed when all sites acked
//! ```
//!
//! Delivery is at-least-once: entries survive transport failures and only
//! leave the table on explicit acknowledgment, loss of segment ownership,
//! or a superseding clear. The conflict rules are symmetric across sites,
//! so independently resolving clusters converge on the same value.

mod conflict;
mod keys;
mod manager;

pub use conflict::{
    ConflictOutcome, ConflictPolicy, ConflictSide, DefaultConflictPolicy, IracCounterSnapshot,
    IracCounters, IracResolution,
};
pub use keys::{
    IracKeyInfo, IracTombstone, IracVersion, IracVersionGenerator, VersionOrder, XSiteState,
};
pub use manager::IracManager;
