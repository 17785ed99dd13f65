//! Key tracking metadata for cross-site replication.

use crate::types::{NodeId, RequestId, SegmentId};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Identity of one tracked key: which segment it lives in and which request
/// produced the update being replicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IracKeyInfo {
    /// The key's segment.
    pub segment: SegmentId,
    /// The raw storage key.
    pub key: Bytes,
    /// The request (or transaction) that last updated the key.
    pub owner: RequestId,
}

impl IracKeyInfo {
    /// Create a new key info.
    pub fn new(segment: SegmentId, key: Bytes, owner: RequestId) -> Self {
        Self {
            segment,
            key,
            owner,
        }
    }
}

/// Relation between two site-version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrder {
    /// Identical vectors.
    Equal,
    /// `self` happened before the other version.
    Before,
    /// `self` happened after the other version.
    After,
    /// Neither dominates: the updates were concurrent.
    Concurrent,
}

/// Per-site version vector.
///
/// Each site increments its own counter on every local update and merges
/// the counters observed from remote updates, so dominance in the vector
/// order means causal succession and incomparability means a conflict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IracVersion {
    counters: BTreeMap<String, u64>,
}

impl IracVersion {
    /// Empty version.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a site (absent counts as zero).
    pub fn get(&self, site: &str) -> u64 {
        self.counters.get(site).copied().unwrap_or(0)
    }

    /// Increment the counter of a site.
    pub fn increment(&mut self, site: &str) {
        *self.counters.entry(site.to_string()).or_insert(0) += 1;
    }

    /// Pointwise maximum with another version.
    pub fn merge(&mut self, other: &IracVersion) {
        for (site, &counter) in &other.counters {
            let entry = self.counters.entry(site.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Compare two versions in the vector order.
    pub fn compare(&self, other: &IracVersion) -> VersionOrder {
        let mut less = false;
        let mut greater = false;
        for site in self.counters.keys().chain(other.counters.keys()) {
            match self.get(site).cmp(&other.get(site)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
        }
        match (less, greater) {
            (false, false) => VersionOrder::Equal,
            (true, false) => VersionOrder::Before,
            (false, true) => VersionOrder::After,
            (true, true) => VersionOrder::Concurrent,
        }
    }
}

impl fmt::Display for IracVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (site, counter) in &self.counters {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}={}", site, counter)?;
            first = false;
        }
        Ok(())
    }
}

/// Version metadata marking a key's last known state.
///
/// Attached to every replicated update and kept on removals so conflicting
/// writes arriving later can still be ordered against the delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IracTombstone {
    /// Site that produced this version.
    pub site: String,
    /// The version vector at update time.
    pub version: IracVersion,
}

impl IracTombstone {
    /// Create a tombstone.
    pub fn new(site: impl Into<String>, version: IracVersion) -> Self {
        Self {
            site: site.into(),
            version,
        }
    }

    /// Compare against another tombstone in the vector order.
    pub fn compare(&self, other: &IracTombstone) -> VersionOrder {
        self.version.compare(&other.version)
    }
}

/// Produces tombstones for local updates of one site.
///
/// Remembers every remote version it has seen so locally generated
/// versions dominate all causally prior updates.
#[derive(Debug)]
pub struct IracVersionGenerator {
    site: String,
    observed: Mutex<IracVersion>,
}

impl IracVersionGenerator {
    /// Create a generator for the local site.
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            observed: Mutex::new(IracVersion::new()),
        }
    }

    /// The local site name.
    pub fn site(&self) -> &str {
        &self.site
    }

    /// Record a version observed from a remote update.
    pub fn observe(&self, version: &IracVersion) {
        self.observed.lock().merge(version);
    }

    /// Generate the tombstone for a new local update.
    pub fn generate(&self) -> IracTombstone {
        let mut observed = self.observed.lock();
        observed.increment(&self.site);
        IracTombstone::new(self.site.clone(), observed.clone())
    }
}

/// Entry shipped during cross-site state transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XSiteState {
    /// The key's segment.
    pub segment: SegmentId,
    /// The raw storage key.
    pub key: Bytes,
    /// Value, absent for removals.
    pub value: Option<Bytes>,
    /// Version metadata of the entry.
    pub tombstone: Option<IracTombstone>,
}

impl XSiteState {
    /// Key info for tracking this state on the sending node.
    pub fn key_info(&self, node: NodeId) -> IracKeyInfo {
        IracKeyInfo::new(self.segment, self.key.clone(), RequestId::no_request(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(pairs: &[(&str, u64)]) -> IracVersion {
        let mut v = IracVersion::new();
        for &(site, count) in pairs {
            for _ in 0..count {
                v.increment(site);
            }
        }
        v
    }

    #[test]
    fn test_version_compare() {
        let a = version(&[("LON", 2), ("NYC", 1)]);
        let b = version(&[("LON", 2), ("NYC", 1)]);
        assert_eq!(a.compare(&b), VersionOrder::Equal);

        let newer = version(&[("LON", 3), ("NYC", 1)]);
        assert_eq!(a.compare(&newer), VersionOrder::Before);
        assert_eq!(newer.compare(&a), VersionOrder::After);

        let concurrent = version(&[("LON", 1), ("NYC", 2)]);
        assert_eq!(a.compare(&concurrent), VersionOrder::Concurrent);
    }

    #[test]
    fn test_version_merge() {
        let mut a = version(&[("LON", 2)]);
        a.merge(&version(&[("LON", 1), ("NYC", 4)]));
        assert_eq!(a.get("LON"), 2);
        assert_eq!(a.get("NYC"), 4);
    }

    #[test]
    fn test_generator_dominates_observed_versions() {
        let gen = IracVersionGenerator::new("LON");
        gen.observe(&version(&[("NYC", 5)]));
        let tombstone = gen.generate();

        assert_eq!(tombstone.site, "LON");
        assert_eq!(
            tombstone.version.compare(&version(&[("NYC", 5)])),
            VersionOrder::After
        );

        // Successive generations keep dominating each other.
        let next = gen.generate();
        assert_eq!(next.version.compare(&tombstone.version), VersionOrder::After);
    }
}
