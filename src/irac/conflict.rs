//! Deterministic conflict resolution for concurrent cross-site updates.

use crate::irac::keys::IracTombstone;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};

/// One side of a conflict, as seen by the resolving site.
#[derive(Debug, Clone, Copy)]
pub struct ConflictSide<'a> {
    /// The value on this side, absent for removals.
    pub value: Option<&'a Bytes>,
    /// Version metadata of this side's update.
    pub tombstone: &'a IracTombstone,
}

/// Outcome chosen by a conflict policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// Keep the local value, discard the remote update.
    LocalWins,
    /// Apply the remote update over the local value.
    RemoteWins,
    /// Store a policy-produced combination of both values.
    Merge(Bytes),
}

/// Pluggable resolution for updates the version vectors cannot order.
///
/// Both sites resolving the same conflict must reach the same outcome, so
/// implementations may only depend on the two sides' values and metadata.
pub trait ConflictPolicy: Send + Sync + 'static {
    /// Resolve a concurrent update pair.
    fn resolve(&self, local: ConflictSide<'_>, remote: ConflictSide<'_>) -> ConflictOutcome;
}

/// Default policy: the update from the lexicographically lowest site name
/// wins. Symmetric on both sites, so conflicting clusters converge.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConflictPolicy;

impl ConflictPolicy for DefaultConflictPolicy {
    fn resolve(&self, local: ConflictSide<'_>, remote: ConflictSide<'_>) -> ConflictOutcome {
        if remote.tombstone.site < local.tombstone.site {
            ConflictOutcome::RemoteWins
        } else {
            ConflictOutcome::LocalWins
        }
    }
}

/// How an incoming remote update was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IracResolution {
    /// The remote update was causally newer and was applied.
    Applied,
    /// The remote update was stale and discarded.
    Discarded,
    /// Conflict resolved in favor of the local value.
    ConflictLocalWins,
    /// Conflict resolved in favor of the remote update.
    ConflictRemoteWins,
    /// Conflict resolved by merging both values.
    ConflictMerged,
}

/// Cumulative conflict-resolution counters.
///
/// Exposed for observability; an external statistics collector polls
/// [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct IracCounters {
    discards: AtomicU64,
    conflict_local_wins: AtomicU64,
    conflict_remote_wins: AtomicU64,
    conflict_merged: AtomicU64,
    expirations_reapplied: AtomicU64,
}

impl IracCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// A stale remote update was discarded.
    pub fn increment_discards(&self) {
        self.discards.fetch_add(1, Ordering::Relaxed);
    }

    /// A conflict kept the local value.
    pub fn increment_conflict_local_wins(&self) {
        self.conflict_local_wins.fetch_add(1, Ordering::Relaxed);
    }

    /// A conflict applied the remote update.
    pub fn increment_conflict_remote_wins(&self) {
        self.conflict_remote_wins.fetch_add(1, Ordering::Relaxed);
    }

    /// A conflict produced a merged value.
    pub fn increment_conflict_merged(&self) {
        self.conflict_merged.fetch_add(1, Ordering::Relaxed);
    }

    /// A superseded expiration was re-applied before being replaced.
    pub fn increment_expirations_reapplied(&self) {
        self.expirations_reapplied.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a resolution outcome.
    pub fn record(&self, resolution: IracResolution) {
        match resolution {
            IracResolution::Applied => {}
            IracResolution::Discarded => self.increment_discards(),
            IracResolution::ConflictLocalWins => self.increment_conflict_local_wins(),
            IracResolution::ConflictRemoteWins => self.increment_conflict_remote_wins(),
            IracResolution::ConflictMerged => self.increment_conflict_merged(),
        }
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> IracCounterSnapshot {
        IracCounterSnapshot {
            discards: self.discards.load(Ordering::Relaxed),
            conflict_local_wins: self.conflict_local_wins.load(Ordering::Relaxed),
            conflict_remote_wins: self.conflict_remote_wins.load(Ordering::Relaxed),
            conflict_merged: self.conflict_merged.load(Ordering::Relaxed),
            expirations_reapplied: self.expirations_reapplied.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the conflict counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IracCounterSnapshot {
    /// Stale remote updates discarded.
    pub discards: u64,
    /// Conflicts resolved keeping the local value.
    pub conflict_local_wins: u64,
    /// Conflicts resolved applying the remote update.
    pub conflict_remote_wins: u64,
    /// Conflicts resolved by merge.
    pub conflict_merged: u64,
    /// Superseded expirations re-applied before replacement.
    pub expirations_reapplied: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irac::keys::IracVersion;

    fn tombstone(site: &str) -> IracTombstone {
        let mut version = IracVersion::new();
        version.increment(site);
        IracTombstone::new(site, version)
    }

    #[test]
    fn test_default_policy_prefers_lowest_site_name() {
        let policy = DefaultConflictPolicy;
        let lon = tombstone("LON");
        let nyc = tombstone("NYC");
        let value = Bytes::from_static(b"v");

        let outcome = policy.resolve(
            ConflictSide {
                value: Some(&value),
                tombstone: &nyc,
            },
            ConflictSide {
                value: Some(&value),
                tombstone: &lon,
            },
        );
        assert_eq!(outcome, ConflictOutcome::RemoteWins);

        let outcome = policy.resolve(
            ConflictSide {
                value: Some(&value),
                tombstone: &lon,
            },
            ConflictSide {
                value: Some(&value),
                tombstone: &nyc,
            },
        );
        assert_eq!(outcome, ConflictOutcome::LocalWins);
    }

    #[test]
    fn test_counters_record_outcomes() {
        let counters = IracCounters::new();
        counters.record(IracResolution::Discarded);
        counters.record(IracResolution::ConflictLocalWins);
        counters.record(IracResolution::ConflictRemoteWins);
        counters.record(IracResolution::ConflictRemoteWins);
        counters.record(IracResolution::ConflictMerged);
        counters.record(IracResolution::Applied);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.discards, 1);
        assert_eq!(snapshot.conflict_local_wins, 1);
        assert_eq!(snapshot.conflict_remote_wins, 2);
        assert_eq!(snapshot.conflict_merged, 1);
        assert_eq!(snapshot.expirations_reapplied, 0);
    }
}
