//! Factory producing balanced consistent hashes.
//!
//! All three operations are pure: they read their inputs, never touch I/O,
//! and produce identical output for identical input on every node. The
//! coordinator and any member validating a topology locally therefore agree
//! on the resulting assignment without an extra round-trip.

use crate::error::{Error, Result};
use crate::hashing::consistent_hash::{CacheMode, ConsistentHash};
use crate::types::NodeId;
use std::cmp::Reverse;
use std::collections::HashMap;

/// Optional per-member capacity hints.
///
/// Accepted for API stability; the balancing algorithm currently assumes
/// uniform capacity and ignores the weights.
#[derive(Debug, Clone, Default)]
pub struct CapacityHints {
    /// Relative capacity per member.
    pub weights: HashMap<NodeId, f64>,
}

/// Creates and evolves [`ConsistentHash`] instances.
#[derive(Debug, Clone, Copy)]
pub struct ConsistentHashFactory {
    mode: CacheMode,
}

impl ConsistentHashFactory {
    /// Create a factory for the given cache mode.
    pub fn new(mode: CacheMode) -> Self {
        Self { mode }
    }

    /// Build the initial hash for a membership.
    ///
    /// Primary-owned segment counts differ by at most one across members,
    /// and total-owned counts stay within the rounding bound of
    /// `num_segments * num_owners / num_members`.
    pub fn create(
        &self,
        num_owners: usize,
        num_segments: u32,
        members: &[NodeId],
        _capacity: Option<&CapacityHints>,
    ) -> Result<ConsistentHash> {
        if members.is_empty() {
            return Err(Error::InvalidConfiguration(
                "cannot create a consistent hash without members".into(),
            ));
        }
        if num_segments == 0 {
            return Err(Error::InvalidConfiguration(
                "number of segments must be positive".into(),
            ));
        }
        if self.mode == CacheMode::Distributed && num_owners < 1 {
            return Err(Error::InvalidConfiguration(
                "replication factor must be at least 1".into(),
            ));
        }
        let members = sorted_members(members);
        let owners = match self.mode {
            CacheMode::Distributed => {
                rebuild_distributed(None, num_owners, num_segments, &members)
            }
            CacheMode::Replicated => rebuild_replicated(None, num_segments, &members),
        };
        Ok(self.build(num_owners, members, owners))
    }

    /// Recompute the hash for a changed membership.
    ///
    /// Assignments of surviving members are preserved as-is; only segments
    /// owned exclusively by departed members are reassigned. The result is
    /// the *target shape* for the new membership; it does not move data and
    /// is typically followed by [`rebalance`](Self::rebalance).
    pub fn update_members(
        &self,
        ch: &ConsistentHash,
        new_members: &[NodeId],
        _capacity: Option<&CapacityHints>,
    ) -> Result<ConsistentHash> {
        if new_members.is_empty() {
            return Err(Error::InvalidConfiguration(
                "cannot update a consistent hash to an empty membership".into(),
            ));
        }
        let members = sorted_members(new_members);
        if members == ch.members() {
            return Ok(ch.clone());
        }

        let num_segments = ch.num_segments() as usize;
        let k = match self.mode {
            CacheMode::Distributed => ch.num_owners().min(members.len()),
            CacheMode::Replicated => 1,
        };

        let mut totals: HashMap<NodeId, usize> = members.iter().map(|&m| (m, 0)).collect();
        let mut owners: Vec<Vec<NodeId>> = Vec::with_capacity(num_segments);
        let mut orphans = Vec::new();
        for seg in 0..num_segments {
            let survivors: Vec<NodeId> = ch
                .locate_owners(seg as u32)
                .iter()
                .copied()
                .filter(|n| members.binary_search(n).is_ok())
                .collect();
            for &s in &survivors {
                *totals.get_mut(&s).expect("survivor is a member") += 1;
            }
            if survivors.is_empty() {
                orphans.push(seg);
            }
            owners.push(survivors);
        }

        // Segments that lost every owner get a fresh assignment using the
        // same least-loaded rule the balancer applies.
        for seg in orphans {
            let mut candidates = members.clone();
            candidates.sort_by_key(|m| (totals[m], *m));
            for &m in candidates.iter().take(k.max(1)) {
                owners[seg].push(m);
                *totals.get_mut(&m).expect("candidate is a member") += 1;
            }
        }

        Ok(self.build(ch.num_owners(), members, owners))
    }

    /// Compute a strictly more balanced assignment for the hash's current
    /// membership, moving as little ownership as the balance bound allows.
    ///
    /// Rebalancing an already balanced hash returns an equivalent hash.
    pub fn rebalance(&self, ch: &ConsistentHash) -> ConsistentHash {
        let members = ch.members().to_vec();
        let owners = match self.mode {
            CacheMode::Distributed => {
                rebuild_distributed(Some(ch), ch.num_owners(), ch.num_segments(), &members)
            }
            CacheMode::Replicated => rebuild_replicated(Some(ch), ch.num_segments(), &members),
        };
        self.build(ch.num_owners(), members, owners)
    }

    fn build(
        &self,
        num_owners: usize,
        members: Vec<NodeId>,
        owners: Vec<Vec<NodeId>>,
    ) -> ConsistentHash {
        let effective = match self.mode {
            CacheMode::Distributed => num_owners,
            CacheMode::Replicated => members.len(),
        };
        ConsistentHash::new(self.mode, effective, members, owners)
    }
}

fn sorted_members(members: &[NodeId]) -> Vec<NodeId> {
    let mut sorted = members.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
}

/// Per-member assignment quotas.
///
/// Starts from the current counts clamped into `[lo, hi]` and then adjusts
/// round-robin until the quotas sum to `target`. Members already inside the
/// bound keep their count, which is what makes rebalancing idempotent and
/// keeps ownership moves to the minimum the bound requires.
fn balanced_quotas(current: &[usize], lo: &[usize], hi: usize, target: usize) -> Vec<usize> {
    let n = current.len();
    let mut quotas: Vec<usize> = (0..n)
        .map(|m| current[m].max(lo[m]).min(hi.max(lo[m])))
        .collect();
    let mut sum: usize = quotas.iter().sum();

    let mut idx = 0;
    let mut stalled = 0;
    while sum < target && stalled < n {
        if quotas[idx] < hi {
            quotas[idx] += 1;
            sum += 1;
            stalled = 0;
        } else {
            stalled += 1;
        }
        idx = (idx + 1) % n;
    }
    idx = 0;
    stalled = 0;
    while sum > target && stalled < n {
        if quotas[idx] > lo[idx] {
            quotas[idx] -= 1;
            sum -= 1;
            stalled = 0;
        } else {
            stalled += 1;
        }
        idx = (idx + 1) % n;
    }
    quotas
}

/// Rebuild a balanced distributed assignment, keeping as much of `base` as
/// the quotas allow. Works on member indices into the sorted member list.
fn rebuild_distributed(
    base: Option<&ConsistentHash>,
    num_owners: usize,
    num_segments: u32,
    members: &[NodeId],
) -> Vec<Vec<NodeId>> {
    let n = members.len();
    let s = num_segments as usize;
    let k = num_owners.min(n).max(1);

    let mut base_owners: Vec<Vec<usize>> = vec![Vec::new(); s];
    if let Some(ch) = base {
        for (seg, list) in base_owners.iter_mut().enumerate() {
            for node in ch.locate_owners(seg as u32) {
                if let Ok(idx) = members.binary_search(node) {
                    list.push(idx);
                }
            }
        }
    }

    // Primary role: keep the current primary wherever its quota allows,
    // otherwise hand the role to another owner of the segment so the role
    // moves without moving data.
    let floor_p = s / n;
    let ceil_p = if s % n == 0 { floor_p } else { floor_p + 1 };
    let mut current_primaries = vec![0usize; n];
    for list in &base_owners {
        if let Some(&p) = list.first() {
            current_primaries[p] += 1;
        }
    }
    let pquota = balanced_quotas(&current_primaries, &vec![floor_p; n], ceil_p, s);

    let mut primary: Vec<Option<usize>> = vec![None; s];
    let mut pused = vec![0usize; n];
    for seg in 0..s {
        if let Some(&p) = base_owners[seg].first() {
            if pused[p] < pquota[p] {
                primary[seg] = Some(p);
                pused[p] += 1;
            }
        }
    }
    for seg in 0..s {
        if primary[seg].is_some() {
            continue;
        }
        let pick = base_owners[seg]
            .iter()
            .copied()
            .find(|&m| pused[m] < pquota[m])
            .or_else(|| {
                (0..n)
                    .filter(|&m| pused[m] < pquota[m])
                    .max_by_key(|&m| (pquota[m] - pused[m], Reverse(m)))
            })
            .expect("primary quotas sum to the segment count");
        primary[seg] = Some(pick);
        pused[pick] += 1;
    }
    let primary: Vec<usize> = primary.into_iter().map(|p| p.expect("assigned")).collect();

    if k == 1 {
        return primary.iter().map(|&p| vec![members[p]]).collect();
    }

    // Total ownership: a member must own at least its primary segments.
    let total = s * k;
    let floor_t = total / n;
    let ceil_t = if total % n == 0 { floor_t } else { floor_t + 1 };
    let lo: Vec<usize> = (0..n).map(|m| floor_t.max(pused[m])).collect();
    let mut current_totals = vec![0usize; n];
    for list in &base_owners {
        for &m in list {
            current_totals[m] += 1;
        }
    }
    let tquota = balanced_quotas(&current_totals, &lo, ceil_t, total);

    let mut owners: Vec<Vec<usize>> = Vec::with_capacity(s);
    let mut tused = vec![0usize; n];
    for &p in &primary {
        owners.push(vec![p]);
        tused[p] += 1;
    }

    // Retain surviving backups in order while their member has quota left.
    for seg in 0..s {
        for pos in 0..base_owners[seg].len() {
            if owners[seg].len() >= k {
                break;
            }
            let m = base_owners[seg][pos];
            if !owners[seg].contains(&m) && tused[m] < tquota[m] {
                owners[seg].push(m);
                tused[m] += 1;
            }
        }
    }

    // Fill the remaining slots from the members with the most quota left.
    for seg in 0..s {
        while owners[seg].len() < k {
            let pick = (0..n)
                .filter(|&m| !owners[seg].contains(&m) && tused[m] < tquota[m])
                .max_by_key(|&m| (tquota[m] - tused[m], Reverse(m)));
            match pick {
                Some(m) => {
                    owners[seg].push(m);
                    tused[m] += 1;
                }
                None => {
                    if !repair_slot(seg, &mut owners, &mut tused, &tquota) {
                        // No quota-respecting move exists; take the least
                        // loaded non-owner and accept the one-off skew.
                        let m = (0..n)
                            .filter(|&m| !owners[seg].contains(&m))
                            .min_by_key(|&m| (tused[m], m))
                            .expect("k <= n leaves an eligible member");
                        owners[seg].push(m);
                        tused[m] += 1;
                    }
                }
            }
        }
    }

    owners
        .into_iter()
        .map(|list| list.into_iter().map(|m| members[m]).collect())
        .collect()
}

/// Resolve a fill dead-end: every member with remaining quota already owns
/// `seg`. Move one of them into another segment's backup slot, freeing that
/// slot's member to own `seg` instead. Net counts are unchanged for the
/// displaced member, so quotas stay exact.
fn repair_slot(
    seg: usize,
    owners: &mut [Vec<usize>],
    tused: &mut [usize],
    tquota: &[usize],
) -> bool {
    let n = tquota.len();
    let spares: Vec<usize> = (0..n).filter(|&m| tused[m] < tquota[m]).collect();
    for &x in &spares {
        for s2 in 0..owners.len() {
            if s2 == seg || owners[s2].contains(&x) {
                continue;
            }
            for pos in 1..owners[s2].len() {
                let b = owners[s2][pos];
                if owners[seg].contains(&b) {
                    continue;
                }
                owners[s2][pos] = x;
                tused[x] += 1;
                owners[seg].push(b);
                return true;
            }
        }
    }
    false
}

/// Rebuild a replicated assignment: every member owns every segment and the
/// primary role is balanced with the same keep-if-possible quota rule.
fn rebuild_replicated(
    base: Option<&ConsistentHash>,
    num_segments: u32,
    members: &[NodeId],
) -> Vec<Vec<NodeId>> {
    let n = members.len();
    let s = num_segments as usize;

    let mut base_primary: Vec<Option<usize>> = vec![None; s];
    let mut current_primaries = vec![0usize; n];
    if let Some(ch) = base {
        for (seg, slot) in base_primary.iter_mut().enumerate() {
            if let Ok(idx) = members.binary_search(&ch.primary_owner(seg as u32)) {
                *slot = Some(idx);
                current_primaries[idx] += 1;
            }
        }
    }

    let floor_p = s / n;
    let ceil_p = if s % n == 0 { floor_p } else { floor_p + 1 };
    let pquota = balanced_quotas(&current_primaries, &vec![floor_p; n], ceil_p, s);

    let mut pused = vec![0usize; n];
    let mut primary = vec![0usize; s];
    let mut pending = Vec::new();
    for seg in 0..s {
        match base_primary[seg] {
            Some(p) if pused[p] < pquota[p] => {
                primary[seg] = p;
                pused[p] += 1;
            }
            _ => pending.push(seg),
        }
    }
    for seg in pending {
        let pick = (0..n)
            .filter(|&m| pused[m] < pquota[m])
            .max_by_key(|&m| (pquota[m] - pused[m], Reverse(m)))
            .expect("primary quotas sum to the segment count");
        primary[seg] = pick;
        pused[pick] += 1;
    }

    (0..s)
        .map(|seg| {
            let p = primary[seg];
            let mut list = Vec::with_capacity(n);
            list.push(members[p]);
            list.extend(members.iter().enumerate().filter(|(i, _)| *i != p).map(|(_, &m)| m));
            list
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::statistics::OwnershipStatistics;

    const SEGMENT_GRID: [u32; 10] = [1, 2, 4, 8, 16, 31, 32, 33, 67, 128];

    fn check_distributed(ch: &ConsistentHash) {
        let n = ch.members().len();
        let s = ch.num_segments() as usize;
        let k = ch.num_owners().min(n);
        let stats = OwnershipStatistics::new(ch, ch.members());

        let primaries: Vec<usize> = ch
            .members()
            .iter()
            .map(|&m| stats.primary_owned(m))
            .collect();
        assert_eq!(primaries.iter().sum::<usize>(), s);
        let max_p = primaries.iter().max().unwrap();
        let min_p = primaries.iter().min().unwrap();
        assert!(
            max_p - min_p <= 1,
            "primary skew too high: {:?} for {} segments",
            primaries,
            s
        );

        let total = s * k;
        let floor_t = total / n;
        let ceil_t = if total % n == 0 { floor_t } else { floor_t + 1 };
        for &m in ch.members() {
            let owned = stats.owned(m);
            assert!(
                owned >= floor_t && owned <= ceil_t,
                "member {} owns {} segments, expected within [{}, {}]",
                m,
                owned,
                floor_t,
                ceil_t
            );
        }

        for seg in 0..ch.num_segments() {
            let owners = ch.locate_owners(seg);
            assert_eq!(owners.len(), k);
            let mut dedup = owners.to_vec();
            dedup.sort_unstable();
            dedup.dedup();
            assert_eq!(dedup.len(), owners.len(), "duplicate owner in segment {}", seg);
        }
    }

    fn check_replicated(ch: &ConsistentHash) {
        let s = ch.num_segments() as usize;
        let stats = OwnershipStatistics::new(ch, ch.members());
        let mut min_p = usize::MAX;
        let mut max_p = 0;
        for &m in ch.members() {
            assert_eq!(stats.owned(m), s);
            let p = stats.primary_owned(m);
            min_p = min_p.min(p);
            max_p = max_p.max(p);
        }
        assert!(max_p - min_p <= 1);
    }

    #[test]
    fn test_create_rejects_invalid_input() {
        let factory = ConsistentHashFactory::new(CacheMode::Distributed);
        assert!(matches!(
            factory.create(2, 16, &[], None),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(
            factory.create(0, 16, &[1], None),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(
            factory.create(2, 0, &[1], None),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_distributed_membership_walk() {
        let factory = ConsistentHashFactory::new(CacheMode::Distributed);
        let walks: [&[NodeId]; 6] = [&[1], &[1, 2], &[1, 2, 3], &[1, 2, 3, 4], &[2, 3, 4], &[3]];
        for num_owners in [1usize, 2, 3] {
            for &segments in &SEGMENT_GRID {
                let mut ch = factory.create(num_owners, segments, walks[0], None).unwrap();
                check_distributed(&ch);
                for members in &walks[1..] {
                    ch = factory.update_members(&ch, members, None).unwrap();
                    ch = factory.rebalance(&ch);
                    check_distributed(&ch);
                }
            }
        }
    }

    #[test]
    fn test_replicated_membership_walk() {
        let factory = ConsistentHashFactory::new(CacheMode::Replicated);
        let walks: [&[NodeId]; 6] = [&[1], &[1, 2], &[1, 2, 3], &[1, 2, 3, 4], &[2, 3, 4], &[3]];
        for &segments in &SEGMENT_GRID {
            let mut ch = factory.create(1, segments, walks[0], None).unwrap();
            check_replicated(&ch);
            for members in &walks[1..] {
                ch = factory.update_members(&ch, members, None).unwrap();
                ch = factory.rebalance(&ch);
                check_replicated(&ch);
            }
        }
    }

    #[test]
    fn test_random_join_leave_order_converges() {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let factory = ConsistentHashFactory::new(CacheMode::Distributed);

        for _ in 0..20 {
            let mut members: Vec<NodeId> = vec![1];
            let mut ch = factory.create(2, 64, &members, None).unwrap();
            let mut pool: Vec<NodeId> = (2..=6).collect();
            pool.shuffle(&mut rng);

            for &joiner in &pool {
                members.push(joiner);
                ch = factory.update_members(&ch, &members, None).unwrap();
                ch = factory.rebalance(&ch);
                check_distributed(&ch);
            }
            let mut leavers = members.clone();
            leavers.shuffle(&mut rng);
            for leaver in leavers {
                members.retain(|&m| m != leaver);
                if members.is_empty() {
                    break;
                }
                ch = factory.update_members(&ch, &members, None).unwrap();
                ch = factory.rebalance(&ch);
                check_distributed(&ch);
            }
        }
    }

    #[test]
    fn test_rebalance_is_idempotent() {
        let factory = ConsistentHashFactory::new(CacheMode::Distributed);
        let ch = factory.create(2, 32, &[1, 2, 3], None).unwrap();
        let balanced = factory.rebalance(&ch);
        let again = factory.rebalance(&balanced);
        assert_eq!(balanced, again);

        let factory = ConsistentHashFactory::new(CacheMode::Replicated);
        let ch = factory.create(1, 33, &[1, 2, 3], None).unwrap();
        assert_eq!(factory.rebalance(&ch), factory.rebalance(&factory.rebalance(&ch)));
    }

    #[test]
    fn test_factory_is_deterministic() {
        let factory = ConsistentHashFactory::new(CacheMode::Distributed);
        let a = factory.create(2, 67, &[5, 3, 9, 1], None).unwrap();
        let b = factory.create(2, 67, &[1, 9, 3, 5], None).unwrap();
        assert_eq!(a, b);

        let grown_a = factory.rebalance(&factory.update_members(&a, &[1, 3, 5, 9, 11], None).unwrap());
        let grown_b = factory.rebalance(&factory.update_members(&b, &[11, 9, 5, 3, 1], None).unwrap());
        assert_eq!(grown_a, grown_b);
    }

    #[test]
    fn test_update_members_preserves_survivors() {
        let factory = ConsistentHashFactory::new(CacheMode::Distributed);
        let ch = factory.create(2, 32, &[1, 2, 3], None).unwrap();
        let updated = factory.update_members(&ch, &[1, 2, 3, 4], None).unwrap();

        // A pure membership update does not move any existing assignment.
        for seg in 0..32 {
            assert_eq!(ch.locate_owners(seg), updated.locate_owners(seg));
        }
        assert!(updated.contains_member(4));
        assert!(updated.segments_for_owner(4).is_empty());
    }

    #[test]
    fn test_update_members_promotes_backup_on_primary_leave() {
        let factory = ConsistentHashFactory::new(CacheMode::Distributed);
        let ch = factory.create(2, 32, &[1, 2, 3], None).unwrap();
        let seg = ch.primary_segments_for_owner(1)[0];
        let backup = ch.locate_owners(seg)[1];

        let updated = factory.update_members(&ch, &[2, 3], None).unwrap();
        assert_eq!(updated.primary_owner(seg), backup);
    }

    #[test]
    fn test_update_members_reassigns_orphaned_segments() {
        let factory = ConsistentHashFactory::new(CacheMode::Distributed);
        let ch = factory.create(1, 16, &[1, 2], None).unwrap();
        // With a single owner per segment, dropping a member orphans all of
        // its segments; every segment must still end up with an owner.
        let updated = factory.update_members(&ch, &[2], None).unwrap();
        for seg in 0..16 {
            assert_eq!(updated.locate_owners(seg), &[2]);
        }
    }

    #[test]
    fn test_rebalance_keeps_a_surviving_owner_per_segment() {
        let factory = ConsistentHashFactory::new(CacheMode::Distributed);
        let ch = factory.create(2, 32, &[1, 2], None).unwrap();
        let updated = factory.update_members(&ch, &[1, 2, 3], None).unwrap();
        let rebalanced = factory.rebalance(&updated);

        for seg in 0..32 {
            let old: Vec<NodeId> = ch.locate_owners(seg).to_vec();
            let kept = rebalanced
                .locate_owners(seg)
                .iter()
                .any(|o| old.contains(o));
            assert!(kept, "segment {} lost every previous owner", seg);
        }
        check_distributed(&rebalanced);
    }

    #[test]
    fn test_more_owners_than_members() {
        let factory = ConsistentHashFactory::new(CacheMode::Distributed);
        let ch = factory.create(3, 16, &[1, 2], None).unwrap();
        for seg in 0..16 {
            assert_eq!(ch.locate_owners(seg).len(), 2);
        }
        check_distributed(&ch);
    }
}
