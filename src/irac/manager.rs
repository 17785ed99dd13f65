//! Tracking and shipment of locally-updated keys to backup sites.

use crate::config::IracConfig;
use crate::container::{ContainerEntry, DataContainer};
use crate::error::{Result, TransportError};
use crate::irac::conflict::{
    ConflictOutcome, ConflictPolicy, ConflictSide, IracCounterSnapshot, IracCounters,
    IracResolution,
};
use crate::irac::keys::{
    IracKeyInfo, IracTombstone, IracVersionGenerator, VersionOrder, XSiteState,
};
use crate::topology::{CacheTopology, TopologyListener};
use crate::transport::{
    BackupSite, ClusterMessage, ClusterResponse, ClusterTransport, IracClearKeysRequest,
    IracStateEntry, IracUpdate, IracUpdateBatch,
};
use crate::types::{CacheName, NodeId, RequestId, SegmentId};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

/// Site acknowledgments are tracked in a `u64` bitmask.
const MAX_BACKUP_SITES: usize = 63;

/// Shipment state of a pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    /// Waiting for the next send cycle.
    Pending,
    /// Included in a batch currently being sent.
    InFlight,
}

/// An unconfirmed expiration displaced by a newer update for the same key.
/// It is shipped ahead of the update to every site that had not yet
/// acknowledged it, so the expiration's intent is never lost to the race.
#[derive(Debug, Clone)]
struct SupersededExpiration {
    info: IracKeyInfo,
    tombstone: Option<IracTombstone>,
    unacked_sites: u64,
}

/// One tracked key. At most one live entry exists per key; newer tracking
/// calls replace the entry atomically.
#[derive(Debug)]
struct PendingEntry {
    info: IracKeyInfo,
    expiration: bool,
    tombstone: Option<IracTombstone>,
    status: EntryStatus,
    /// Bitmask of sites that have not acknowledged this update yet.
    unacked_sites: u64,
    reapply_expiration: Option<SupersededExpiration>,
    transfers: Vec<Arc<StateTransferTracker>>,
}

/// Completion signal for a cross-site state transfer: fires once every
/// listed key's send has been acknowledged (or the key stopped being this
/// node's responsibility).
#[derive(Debug)]
struct StateTransferTracker {
    remaining: AtomicUsize,
    done: Mutex<Option<oneshot::Sender<()>>>,
}

impl StateTransferTracker {
    fn new(count: usize, done: oneshot::Sender<()>) -> Self {
        let tracker = Self {
            remaining: AtomicUsize::new(count),
            done: Mutex::new(Some(done)),
        };
        if count == 0 {
            tracker.finish();
        }
        tracker
    }

    fn complete_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        if let Some(done) = self.done.lock().take() {
            let _ = done.send(());
        }
    }
}

/// Tracks every key mutated locally until all backup sites confirmed it,
/// ships batches asynchronously and resolves conflicting concurrent
/// updates from remote sites.
///
/// Entries survive transport failures: a key leaves the pending table only
/// on explicit acknowledgment from every site, on loss of segment
/// ownership, or through a superseding clear. Per key, the most recently
/// tracked state is always the one sent.
pub struct IracManager {
    cache_name: CacheName,
    local: NodeId,
    config: IracConfig,
    transport: Arc<dyn ClusterTransport>,
    sites: Vec<Arc<dyn BackupSite>>,
    container: Arc<dyn DataContainer>,
    policy: Arc<dyn ConflictPolicy>,
    versions: Arc<IracVersionGenerator>,
    pending: DashMap<Bytes, PendingEntry>,
    /// Version metadata of removed keys, kept so later conflicting writes
    /// can still be ordered against the delete.
    removal_tombstones: DashMap<Bytes, IracTombstone>,
    /// Bitmask of sites still owed a clear request.
    clear_pending: AtomicU64,
    topology: RwLock<Option<Arc<CacheTopology>>>,
    counters: IracCounters,
    notify: Notify,
    running: AtomicBool,
}

impl IracManager {
    /// Create a manager for one cache.
    pub fn new(
        cache_name: impl Into<CacheName>,
        config: IracConfig,
        transport: Arc<dyn ClusterTransport>,
        sites: Vec<Arc<dyn BackupSite>>,
        container: Arc<dyn DataContainer>,
        policy: Arc<dyn ConflictPolicy>,
    ) -> Self {
        assert!(
            sites.len() <= MAX_BACKUP_SITES,
            "at most {} backup sites are supported",
            MAX_BACKUP_SITES
        );
        let versions = Arc::new(IracVersionGenerator::new(config.site_name.clone()));
        Self {
            cache_name: cache_name.into(),
            local: transport.local_node(),
            config,
            transport,
            sites,
            container,
            policy,
            versions,
            pending: DashMap::new(),
            removal_tombstones: DashMap::new(),
            clear_pending: AtomicU64::new(0),
            topology: RwLock::new(None),
            counters: IracCounters::new(),
            notify: Notify::new(),
            running: AtomicBool::new(true),
        }
    }

    /// The topology this manager last observed.
    pub fn current_topology(&self) -> Option<Arc<CacheTopology>> {
        self.topology.read().clone()
    }

    /// The local site name.
    pub fn site_name(&self) -> &str {
        &self.config.site_name
    }

    /// The version generator stamping local updates.
    pub fn versions(&self) -> &Arc<IracVersionGenerator> {
        &self.versions
    }

    /// Conflict-resolution counters.
    pub fn counter_snapshot(&self) -> IracCounterSnapshot {
        self.counters.snapshot()
    }

    fn all_sites_mask(&self) -> u64 {
        if self.sites.is_empty() {
            0
        } else {
            (1u64 << self.sites.len()) - 1
        }
    }

    /// Record the key as changed by `owner`. Non-blocking; the background
    /// sender picks the entry up on its next cycle.
    pub fn track_updated_key(&self, segment: SegmentId, key: Bytes, owner: RequestId) {
        self.track_key(segment, key, owner, false);
    }

    /// Record the key as expired by `owner`.
    ///
    /// Expirations use a different conflict rule: removal-on-expiry is a
    /// local liveness optimization, so it never wins against a concurrent
    /// remote write.
    pub fn track_expired_key(&self, segment: SegmentId, key: Bytes, owner: RequestId) {
        self.track_key(segment, key, owner, true);
    }

    fn track_key(&self, segment: SegmentId, key: Bytes, owner: RequestId, expiration: bool) {
        let mask = self.all_sites_mask();
        if mask == 0 {
            return;
        }
        let tombstone = self.current_tombstone(&key);
        let info = IracKeyInfo::new(segment, key.clone(), owner);
        let mut reapplied = false;

        match self.pending.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let mut reapply = entry.reapply_expiration.take();
                if entry.expiration && !expiration && entry.unacked_sites != 0 {
                    // The unconfirmed expiration must not be silently lost:
                    // it is re-applied ahead of the update that displaced it.
                    reapply = Some(SupersededExpiration {
                        info: entry.info.clone(),
                        tombstone: entry.tombstone.clone(),
                        unacked_sites: entry.unacked_sites,
                    });
                    reapplied = true;
                }
                let transfers = std::mem::take(&mut entry.transfers);
                *entry = PendingEntry {
                    info,
                    expiration,
                    tombstone,
                    status: EntryStatus::Pending,
                    unacked_sites: mask,
                    reapply_expiration: reapply,
                    transfers,
                };
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(PendingEntry {
                    info,
                    expiration,
                    tombstone,
                    status: EntryStatus::Pending,
                    unacked_sites: mask,
                    reapply_expiration: None,
                    transfers: Vec::new(),
                });
            }
        }

        if reapplied {
            self.counters.increment_expirations_reapplied();
            debug!(cache = %self.cache_name, "Re-applying superseded expiration before update");
        }
        self.notify.notify_one();
    }

    /// Record the removal tombstone of a deleted key so future conflicting
    /// writes can be ordered against the delete.
    pub fn record_removal_tombstone(&self, key: Bytes, tombstone: IracTombstone) {
        self.removal_tombstones.insert(key, tombstone);
    }

    fn current_tombstone(&self, key: &Bytes) -> Option<IracTombstone> {
        self.container
            .get(key)
            .and_then(|e| e.tombstone)
            .or_else(|| self.removal_tombstones.get(key).map(|t| t.clone()))
    }

    /// Track a set of keys for cross-site state transfer.
    ///
    /// Returns a future that completes once every listed key's send has
    /// been acknowledged by all sites.
    pub fn track_for_state_transfer(
        &self,
        states: Vec<XSiteState>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let (done_tx, done_rx) = oneshot::channel();
        let mask = self.all_sites_mask();
        let trackable = if mask == 0 { 0 } else { states.len() };
        let tracker = Arc::new(StateTransferTracker::new(trackable, done_tx));

        if mask != 0 {
            for state in states {
                let info = state.key_info(self.local);
                match self.pending.entry(state.key.clone()) {
                    dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                        // The key is already tracked with newer state; its
                        // acknowledgment covers the transfer as well.
                        occupied.get_mut().transfers.push(tracker.clone());
                    }
                    dashmap::mapref::entry::Entry::Vacant(vacant) => {
                        vacant.insert(PendingEntry {
                            info,
                            expiration: false,
                            tombstone: state.tombstone,
                            status: EntryStatus::Pending,
                            unacked_sites: mask,
                            reapply_expiration: None,
                            transfers: vec![tracker.clone()],
                        });
                    }
                }
            }
            self.notify.notify_one();
        }

        async move {
            let _ = done_rx.await;
        }
    }

    /// Discard all pending entries. With `send_clear`, backup sites are
    /// also instructed to drop their tracked keys for this cache.
    pub fn track_clear(&self, send_clear: bool) {
        let mut cleared = 0usize;
        self.pending.retain(|_, entry| {
            Self::complete_transfers(entry);
            cleared += 1;
            false
        });
        self.removal_tombstones.clear();
        debug!(cache = %self.cache_name, cleared, send_clear, "Cleared tracked keys");
        if send_clear && !self.sites.is_empty() {
            self.clear_pending
                .store(self.all_sites_mask(), Ordering::SeqCst);
            self.notify.notify_one();
        }
    }

    /// Remove the pending entry for one key, if it still belongs to the
    /// same owner. Used after a key's update is confirmed out of band.
    pub fn remove_state(&self, info: &IracKeyInfo) {
        let removed = self
            .pending
            .remove_if(&info.key, |_, entry| entry.info.owner == info.owner);
        if let Some((_, entry)) = removed {
            Self::complete_transfers(&entry);
            debug!(cache = %self.cache_name, owner = %info.owner, "Removed tracked key state");
        }
    }

    /// Whether the key's latest update is still unconfirmed by some site.
    pub fn contains_key(&self, key: &Bytes) -> bool {
        self.pending.contains_key(key)
    }

    /// Snapshot of all keys not yet acknowledged by every site.
    ///
    /// The returned sequence is a restartable snapshot, not a live view.
    pub fn pending_keys(&self) -> Vec<IracKeyInfo> {
        self.pending.iter().map(|e| e.info.clone()).collect()
    }

    /// Whether no keys are pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of pending keys.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    fn complete_transfers(entry: &PendingEntry) {
        for tracker in &entry.transfers {
            tracker.complete_one();
        }
    }

    /// Re-evaluate every pending entry against a newly installed topology.
    ///
    /// Entries whose segment is no longer owned locally are dropped (the
    /// new owner resumes responsibility); for newly owned segments the
    /// previous owners are asked to hand their pending state over.
    pub async fn topology_updated(
        &self,
        old: Option<Arc<CacheTopology>>,
        new: Arc<CacheTopology>,
    ) {
        *self.topology.write() = Some(new.clone());
        let write_ch = new.write_consistent_hash();

        let mut dropped = 0usize;
        self.pending.retain(|_, entry| {
            if write_ch.is_segment_owner(entry.info.segment, self.local) {
                true
            } else {
                Self::complete_transfers(entry);
                dropped += 1;
                false
            }
        });
        if dropped > 0 {
            debug!(
                cache = %self.cache_name,
                dropped,
                topology_id = new.topology_id(),
                "Dropped pending keys for segments no longer owned"
            );
        }

        // Pull pending state for segments that just became local. A node
        // whose first topology is already mid-rebalance owned nothing
        // before, so it asks the current owners.
        let old_write = old.as_ref().map(|t| t.write_consistent_hash());
        let mut requests: HashMap<NodeId, Vec<SegmentId>> = HashMap::new();
        for segment in 0..write_ch.num_segments() {
            if !write_ch.is_segment_owner(segment, self.local) {
                continue;
            }
            let owned_before = old_write
                .as_ref()
                .map(|ch| ch.is_segment_owner(segment, self.local))
                .unwrap_or(false);
            if owned_before {
                continue;
            }
            let previous = match &old_write {
                Some(ch) => ch.primary_owner(segment),
                None => new.current_ch().primary_owner(segment),
            };
            if previous != self.local {
                requests.entry(previous).or_default().push(segment);
            }
        }
        for (owner, segments) in requests {
            let message = ClusterMessage::IracStateRequest {
                cache_name: self.cache_name.clone(),
                requestor: self.local,
                segments,
            };
            if let Err(e) = self.transport.send(owner, message).await {
                warn!(
                    cache = %self.cache_name,
                    owner,
                    error = %e,
                    "Failed to request pending-key state from previous owner"
                );
            }
        }
    }

    /// Send the pending state for the requested segments to `requestor`.
    pub async fn request_state(&self, requestor: NodeId, segments: &[SegmentId]) {
        let entries: Vec<IracStateEntry> = self
            .pending
            .iter()
            .filter(|e| segments.contains(&e.info.segment))
            .map(|e| IracStateEntry {
                segment: e.info.segment,
                key: e.info.key.clone(),
                owner: e.info.owner,
                tombstone: e.tombstone.clone(),
                expiration: e.expiration,
            })
            .collect();
        if entries.is_empty() {
            return;
        }
        info!(
            cache = %self.cache_name,
            requestor,
            keys = entries.len(),
            "Handing pending-key state to new owner"
        );
        let message = ClusterMessage::IracStateResponse {
            cache_name: self.cache_name.clone(),
            entries,
        };
        if let Err(e) = self.transport.send(requestor, message).await {
            warn!(
                cache = %self.cache_name,
                requestor,
                error = %e,
                "Failed to transfer pending-key state"
            );
        }
    }

    /// Install pending-key state received from a previous owner.
    ///
    /// Existing local entries win: the local tracking is at least as new as
    /// what the previous owner had.
    pub fn receive_state(
        &self,
        segment: SegmentId,
        key: Bytes,
        owner: RequestId,
        tombstone: Option<IracTombstone>,
        expiration: bool,
    ) {
        let mask = self.all_sites_mask();
        if mask == 0 {
            return;
        }
        if let dashmap::mapref::entry::Entry::Vacant(vacant) = self.pending.entry(key.clone()) {
            vacant.insert(PendingEntry {
                info: IracKeyInfo::new(segment, key, owner),
                expiration,
                tombstone,
                status: EntryStatus::Pending,
                unacked_sites: mask,
                reapply_expiration: None,
                transfers: Vec::new(),
            });
            self.notify.notify_one();
        }
    }

    /// Cross-site-aware expiration check.
    ///
    /// A key counts as expired only once every backup site confirms it has
    /// converged on the expiry; a single dissent (or unreachable site)
    /// aborts the local removal, since a remote update may still be in
    /// flight.
    pub async fn check_and_track_expiration(&self, key: &Bytes) -> bool {
        for site in &self.sites {
            match site.check_expired(&self.cache_name, key).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        cache = %self.cache_name,
                        site = site.name(),
                        "Remote site still sees the key alive; expiration aborted"
                    );
                    return false;
                }
                Err(e) => {
                    warn!(
                        cache = %self.cache_name,
                        site = site.name(),
                        error = %e,
                        "Could not confirm expiration with remote site"
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Inspect a remote node's tracked keys and instruct a cleanup for the
    /// ones that are stale here (already resolved or superseded). Bounds
    /// the pending-key backlog under partial failures.
    pub async fn check_stale_keys(&self, origin: NodeId, keys: &[IracKeyInfo]) {
        let stale: Vec<IracKeyInfo> = keys
            .iter()
            .filter(|info| match self.pending.get(&info.key) {
                None => true,
                Some(entry) => entry.info.owner != info.owner,
            })
            .cloned()
            .collect();
        if stale.is_empty() {
            return;
        }
        debug!(
            cache = %self.cache_name,
            origin,
            stale = stale.len(),
            "Instructing cleanup of stale tracked keys"
        );
        let message = ClusterMessage::IracCleanup {
            cache_name: self.cache_name.clone(),
            keys: stale,
        };
        if let Err(e) = self.transport.send(origin, message).await {
            warn!(
                cache = %self.cache_name,
                origin,
                error = %e,
                "Failed to send stale-key cleanup"
            );
        }
    }

    /// Drop tracked keys another member confirmed stale.
    pub fn cleanup_stale_keys(&self, keys: &[IracKeyInfo]) {
        for info in keys {
            self.remove_state(info);
        }
    }

    /// Apply an update received from a remote site, resolving conflicts
    /// deterministically and counting the outcome.
    pub fn apply_remote_update(&self, update: &IracUpdate) -> IracResolution {
        if let Some(remote) = &update.tombstone {
            self.versions.observe(&remote.version);
        }
        let local_entry = self.container.get(&update.key);
        let local_tombstone = local_entry
            .as_ref()
            .and_then(|e| e.tombstone.clone())
            .or_else(|| self.removal_tombstones.get(&update.key).map(|t| t.clone()));

        let resolution = match (&local_tombstone, &update.tombstone) {
            (None, _) => {
                self.apply(update, update.tombstone.clone());
                IracResolution::Applied
            }
            (Some(_), None) => IracResolution::Discarded,
            (Some(local), Some(remote)) => match local.compare(remote) {
                VersionOrder::Before => {
                    self.apply(update, Some(remote.clone()));
                    IracResolution::Applied
                }
                VersionOrder::Equal | VersionOrder::After => IracResolution::Discarded,
                VersionOrder::Concurrent => {
                    self.resolve_conflict(update, local_entry.as_ref(), local, remote)
                }
            },
        };
        self.counters.record(resolution);
        debug!(
            cache = %self.cache_name,
            outcome = ?resolution,
            expiration = update.expiration,
            "Processed remote update"
        );
        resolution
    }

    fn resolve_conflict(
        &self,
        update: &IracUpdate,
        local_entry: Option<&ContainerEntry>,
        local: &IracTombstone,
        remote: &IracTombstone,
    ) -> IracResolution {
        // Expiration is a liveness optimization, not an authoritative
        // delete: it never wins a conflict.
        if update.expiration {
            return IracResolution::ConflictLocalWins;
        }
        let local_pending_expiration = self
            .pending
            .get(&update.key)
            .map(|e| e.expiration)
            .unwrap_or(false);
        if local_pending_expiration {
            if let Some((_, entry)) = self.pending.remove(&update.key) {
                Self::complete_transfers(&entry);
            }
            self.apply(update, Some(remote.clone()));
            return IracResolution::ConflictRemoteWins;
        }

        let outcome = self.policy.resolve(
            ConflictSide {
                value: local_entry.map(|e| &e.value),
                tombstone: local,
            },
            ConflictSide {
                value: update.value.as_ref(),
                tombstone: remote,
            },
        );
        match outcome {
            ConflictOutcome::LocalWins => IracResolution::ConflictLocalWins,
            ConflictOutcome::RemoteWins => {
                self.apply(update, Some(remote.clone()));
                IracResolution::ConflictRemoteWins
            }
            ConflictOutcome::Merge(value) => {
                let mut version = local.version.clone();
                version.merge(&remote.version);
                let site = if remote.site < local.site {
                    remote.site.clone()
                } else {
                    local.site.clone()
                };
                let merged = IracTombstone::new(site, version);
                self.container
                    .put(update.key.clone(), ContainerEntry::new(value, Some(merged)));
                self.removal_tombstones.remove(&update.key);
                IracResolution::ConflictMerged
            }
        }
    }

    fn apply(&self, update: &IracUpdate, tombstone: Option<IracTombstone>) {
        match &update.value {
            Some(value) => {
                self.container.put(
                    update.key.clone(),
                    ContainerEntry::new(value.clone(), tombstone),
                );
                self.removal_tombstones.remove(&update.key);
            }
            None => {
                self.container.remove(&update.key);
                if let Some(tombstone) = tombstone {
                    self.removal_tombstones.insert(update.key.clone(), tombstone);
                }
            }
        }
    }

    /// One shipment pass over all backup sites.
    ///
    /// Batches pending entries per site; a transport failure leaves the
    /// entries pending for the next cycle, and an acknowledgment removes an
    /// entry only if it was not superseded while in flight.
    pub async fn send_cycle(&self) {
        for (idx, site) in self.sites.iter().enumerate() {
            let bit = 1u64 << idx;

            if self.clear_pending.load(Ordering::SeqCst) & bit != 0 {
                let request = IracClearKeysRequest {
                    cache_name: self.cache_name.clone(),
                    origin_site: self.config.site_name.clone(),
                };
                match site.send_clear(&request).await {
                    Ok(()) => {
                        self.clear_pending.fetch_and(!bit, Ordering::SeqCst);
                        debug!(cache = %self.cache_name, site = site.name(), "Clear delivered");
                    }
                    Err(e) => {
                        // Updates tracked after the clear must not overtake
                        // it; skip this site until the clear goes through.
                        warn!(
                            cache = %self.cache_name,
                            site = site.name(),
                            error = %e,
                            "Clear delivery failed; retrying next cycle"
                        );
                        continue;
                    }
                }
            }

            let mut selected: Vec<(Bytes, RequestId)> = Vec::new();
            let mut updates: Vec<IracUpdate> = Vec::new();
            for entry in self.pending.iter() {
                if entry.unacked_sites & bit == 0 || entry.status == EntryStatus::InFlight {
                    continue;
                }
                if selected.len() >= self.config.batch_size {
                    break;
                }
                if let Some(superseded) = &entry.reapply_expiration {
                    if superseded.unacked_sites & bit != 0 {
                        updates.push(IracUpdate {
                            segment: superseded.info.segment,
                            key: superseded.info.key.clone(),
                            value: None,
                            tombstone: superseded.tombstone.clone(),
                            expiration: true,
                            owner: superseded.info.owner,
                        });
                    }
                }
                let (value, tombstone) = match self.container.get(&entry.info.key) {
                    Some(stored) => (Some(stored.value), stored.tombstone),
                    None => (None, entry.tombstone.clone()),
                };
                updates.push(IracUpdate {
                    segment: entry.info.segment,
                    key: entry.info.key.clone(),
                    value,
                    tombstone,
                    expiration: entry.expiration,
                    owner: entry.info.owner,
                });
                selected.push((entry.info.key.clone(), entry.info.owner));
            }
            if updates.is_empty() {
                continue;
            }

            for (key, owner) in &selected {
                if let Some(mut entry) = self.pending.get_mut(key) {
                    if entry.info.owner == *owner {
                        entry.status = EntryStatus::InFlight;
                    }
                }
            }

            let batch = IracUpdateBatch {
                cache_name: self.cache_name.clone(),
                origin_site: self.config.site_name.clone(),
                updates,
            };
            match site.send_updates(&batch).await {
                Ok(()) => {
                    debug!(
                        cache = %self.cache_name,
                        site = site.name(),
                        keys = selected.len(),
                        "Batch acknowledged"
                    );
                    for (key, owner) in selected {
                        self.acknowledge(&key, owner, bit);
                    }
                }
                Err(e) => {
                    warn!(
                        cache = %self.cache_name,
                        site = site.name(),
                        error = %e,
                        "Batch send failed; entries stay pending for retry"
                    );
                    for (key, owner) in selected {
                        if let Some(mut entry) = self.pending.get_mut(&key) {
                            if entry.info.owner == owner {
                                entry.status = EntryStatus::Pending;
                            }
                        }
                    }
                }
            }
        }
    }

    fn acknowledge(&self, key: &Bytes, owner: RequestId, bit: u64) {
        let mut fully_acked = false;
        if let Some(mut entry) = self.pending.get_mut(key) {
            if entry.info.owner != owner {
                // Superseded while in flight: the newer state is resent on
                // the next cycle; this ack refers to the old update.
                entry.status = EntryStatus::Pending;
                return;
            }
            entry.unacked_sites &= !bit;
            entry.status = EntryStatus::Pending;
            if let Some(superseded) = &mut entry.reapply_expiration {
                superseded.unacked_sites &= !bit;
                if superseded.unacked_sites == 0 {
                    entry.reapply_expiration = None;
                }
            }
            fully_acked = entry.unacked_sites == 0;
        }
        if fully_acked {
            let removed = self
                .pending
                .remove_if(key, |_, e| e.info.owner == owner && e.unacked_sites == 0);
            if let Some((_, entry)) = removed {
                Self::complete_transfers(&entry);
                debug!(cache = %self.cache_name, "Key confirmed by all backup sites");
            }
        }
    }

    /// Background sender loop; runs until [`shutdown`](Self::shutdown).
    pub async fn run(self: Arc<Self>) {
        info!(cache = %self.cache_name, sites = self.sites.len(), "IRAC sender started");
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.send_interval) => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.send_cycle().await;
        }
        info!(cache = %self.cache_name, "IRAC sender stopped");
    }

    /// Spawn the background sender on the current runtime.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.clone().run())
    }

    /// Stop the background sender.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Dispatch a replication-related cluster message to this manager.
    pub async fn handle_cluster_message(
        &self,
        message: &ClusterMessage,
    ) -> Result<ClusterResponse> {
        match message {
            ClusterMessage::IracStateRequest {
                requestor,
                segments,
                ..
            } => {
                self.request_state(*requestor, segments).await;
                Ok(ClusterResponse::Ok)
            }
            ClusterMessage::IracStateResponse { entries, .. } => {
                for entry in entries {
                    self.receive_state(
                        entry.segment,
                        entry.key.clone(),
                        entry.owner,
                        entry.tombstone.clone(),
                        entry.expiration,
                    );
                }
                Ok(ClusterResponse::Ok)
            }
            ClusterMessage::IracStaleCheck { origin, keys, .. } => {
                self.check_stale_keys(*origin, keys).await;
                Ok(ClusterResponse::Ok)
            }
            ClusterMessage::IracCleanup { keys, .. } => {
                self.cleanup_stale_keys(keys);
                Ok(ClusterResponse::Ok)
            }
            ClusterMessage::TopologyUpdate(_) => Err(TransportError::UnexpectedResponse(
                "topology update routed to the replication manager".into(),
            )
            .into()),
        }
    }
}

#[async_trait]
impl TopologyListener for IracManager {
    async fn on_topology_update(
        &self,
        cache_name: &str,
        old: Option<Arc<CacheTopology>>,
        new: Arc<CacheTopology>,
    ) {
        if cache_name == self.cache_name {
            self.topology_updated(old, new).await;
        }
    }
}

impl std::fmt::Debug for IracManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IracManager")
            .field("cache_name", &self.cache_name)
            .field("local", &self.local)
            .field("pending", &self.pending.len())
            .field("sites", &self.sites.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::InMemoryContainer;
    use crate::error::Error;
    use crate::hashing::{CacheMode, ConsistentHashFactory};
    use crate::irac::conflict::DefaultConflictPolicy;
    use crate::irac::keys::IracVersion;
    use crate::topology::TopologyPhase;

    struct RecordingTransport {
        local: NodeId,
        sent: Mutex<Vec<(NodeId, ClusterMessage)>>,
    }

    impl RecordingTransport {
        fn new(local: NodeId) -> Arc<Self> {
            Arc::new(Self {
                local,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<(NodeId, ClusterMessage)> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl ClusterTransport for RecordingTransport {
        fn local_node(&self) -> NodeId {
            self.local
        }

        async fn send(&self, dest: NodeId, message: ClusterMessage) -> Result<ClusterResponse> {
            self.sent.lock().push((dest, message));
            Ok(ClusterResponse::Ok)
        }
    }

    struct TestSite {
        name: String,
        fail_sends: AtomicBool,
        batches: Mutex<Vec<IracUpdateBatch>>,
        clears: Mutex<Vec<IracClearKeysRequest>>,
        expired: Mutex<HashMap<Bytes, bool>>,
    }

    impl TestSite {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail_sends: AtomicBool::new(false),
                batches: Mutex::new(Vec::new()),
                clears: Mutex::new(Vec::new()),
                expired: Mutex::new(HashMap::new()),
            })
        }

        fn set_failing(&self, failing: bool) {
            self.fail_sends.store(failing, Ordering::SeqCst);
        }

        fn set_expired(&self, key: &[u8], expired: bool) {
            self.expired
                .lock()
                .insert(Bytes::copy_from_slice(key), expired);
        }

        fn batches(&self) -> Vec<IracUpdateBatch> {
            self.batches.lock().clone()
        }

        fn clears(&self) -> Vec<IracClearKeysRequest> {
            self.clears.lock().clone()
        }
    }

    #[async_trait]
    impl BackupSite for TestSite {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send_updates(&self, batch: &IracUpdateBatch) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(Error::Transport(TransportError::SiteUnreachable(
                    self.name.clone(),
                )));
            }
            self.batches.lock().push(batch.clone());
            Ok(())
        }

        async fn send_clear(&self, request: &IracClearKeysRequest) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(Error::Transport(TransportError::SiteUnreachable(
                    self.name.clone(),
                )));
            }
            self.clears.lock().push(request.clone());
            Ok(())
        }

        async fn check_expired(&self, _cache_name: &str, key: &Bytes) -> Result<bool> {
            Ok(self.expired.lock().get(key).copied().unwrap_or(true))
        }
    }

    fn manager_with_sites(
        sites: Vec<Arc<dyn BackupSite>>,
    ) -> (IracManager, Arc<RecordingTransport>, Arc<InMemoryContainer>) {
        let transport = RecordingTransport::new(1);
        let container = Arc::new(InMemoryContainer::new());
        let manager = IracManager::new(
            "users",
            IracConfig::new("LON").with_batch_size(64),
            transport.clone(),
            sites,
            container.clone(),
            Arc::new(DefaultConflictPolicy),
        );
        (manager, transport, container)
    }

    fn key(name: &str) -> Bytes {
        Bytes::copy_from_slice(name.as_bytes())
    }

    fn owner(seq: u64) -> RequestId {
        RequestId::new(1, seq)
    }

    fn tombstone(site: &str, count: u64) -> IracTombstone {
        let mut version = IracVersion::new();
        for _ in 0..count {
            version.increment(site);
        }
        IracTombstone::new(site, version)
    }

    #[tokio::test]
    async fn test_tracked_key_ships_and_clears_on_ack() {
        let site = TestSite::new("NYC");
        let (manager, _, container) = manager_with_sites(vec![site.clone()]);
        container.put(
            key("k"),
            ContainerEntry::new(Bytes::from_static(b"v"), Some(tombstone("LON", 1))),
        );

        manager.track_updated_key(3, key("k"), owner(1));
        assert!(manager.contains_key(&key("k")));

        manager.send_cycle().await;

        assert!(manager.is_empty());
        let batches = site.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].updates.len(), 1);
        let update = &batches[0].updates[0];
        assert_eq!(update.segment, 3);
        assert_eq!(update.value, Some(Bytes::from_static(b"v")));
        assert!(!update.expiration);
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_entry_pending() {
        let site = TestSite::new("NYC");
        let (manager, _, _) = manager_with_sites(vec![site.clone()]);

        site.set_failing(true);
        manager.track_updated_key(0, key("k"), owner(1));
        manager.send_cycle().await;
        assert!(manager.contains_key(&key("k")));
        assert!(site.batches().is_empty());

        site.set_failing(false);
        manager.send_cycle().await;
        assert!(manager.is_empty());
        assert_eq!(site.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_entry_pending_until_every_site_acks() {
        let nyc = TestSite::new("NYC");
        let sfo = TestSite::new("SFO");
        let (manager, _, _) = manager_with_sites(vec![nyc.clone(), sfo.clone()]);

        sfo.set_failing(true);
        manager.track_updated_key(0, key("k"), owner(1));
        manager.send_cycle().await;

        // NYC acked, SFO did not: the key stays pending.
        assert!(manager.contains_key(&key("k")));
        assert_eq!(nyc.batches().len(), 1);

        sfo.set_failing(false);
        manager.send_cycle().await;
        assert!(manager.is_empty());
        // NYC is not sent the key again.
        assert_eq!(nyc.batches().len(), 1);
        assert_eq!(sfo.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_last_track_wins() {
        let site = TestSite::new("NYC");
        let (manager, _, _) = manager_with_sites(vec![site.clone()]);

        manager.track_updated_key(0, key("k"), owner(1));
        manager.track_updated_key(0, key("k"), owner(2));

        let pending = manager.pending_keys();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].owner, owner(2));
    }

    #[tokio::test]
    async fn test_superseded_expiration_is_reapplied_first() {
        let site = TestSite::new("NYC");
        let (manager, _, container) = manager_with_sites(vec![site.clone()]);

        manager.track_expired_key(0, key("k"), owner(1));
        container.put(
            key("k"),
            ContainerEntry::new(Bytes::from_static(b"v2"), Some(tombstone("LON", 2))),
        );
        manager.track_updated_key(0, key("k"), owner(2));

        assert_eq!(manager.counter_snapshot().expirations_reapplied, 1);

        manager.send_cycle().await;
        let batches = site.batches();
        assert_eq!(batches.len(), 1);
        let updates = &batches[0].updates;
        assert_eq!(updates.len(), 2);
        // The displaced expiration ships ahead of the update.
        assert!(updates[0].expiration);
        assert_eq!(updates[0].owner, owner(1));
        assert!(updates[0].value.is_none());
        assert!(!updates[1].expiration);
        assert_eq!(updates[1].owner, owner(2));
        assert_eq!(updates[1].value, Some(Bytes::from_static(b"v2")));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_expiration_superseded_by_expiration_is_not_reapplied() {
        let site = TestSite::new("NYC");
        let (manager, _, _) = manager_with_sites(vec![site]);

        manager.track_expired_key(0, key("k"), owner(1));
        manager.track_expired_key(0, key("k"), owner(2));

        assert_eq!(manager.counter_snapshot().expirations_reapplied, 0);
        assert_eq!(manager.pending_keys()[0].owner, owner(2));
    }

    #[tokio::test]
    async fn test_track_clear_sends_clear_request() {
        let site = TestSite::new("NYC");
        let (manager, _, _) = manager_with_sites(vec![site.clone()]);

        manager.track_updated_key(0, key("a"), owner(1));
        manager.track_updated_key(1, key("b"), owner(2));
        manager.track_clear(true);

        assert!(manager.is_empty());
        manager.send_cycle().await;
        assert_eq!(site.clears().len(), 1);
        assert_eq!(site.clears()[0].cache_name, "users");
        assert_eq!(site.clears()[0].origin_site, "LON");
        assert!(site.batches().is_empty());
    }

    #[tokio::test]
    async fn test_track_clear_without_send() {
        let site = TestSite::new("NYC");
        let (manager, _, _) = manager_with_sites(vec![site.clone()]);

        manager.track_updated_key(0, key("a"), owner(1));
        manager.track_clear(false);

        assert!(manager.is_empty());
        manager.send_cycle().await;
        assert!(site.clears().is_empty());
    }

    #[tokio::test]
    async fn test_remove_state_checks_owner() {
        let site = TestSite::new("NYC");
        let (manager, _, _) = manager_with_sites(vec![site]);

        manager.track_updated_key(2, key("k"), owner(5));

        // A stale removal (older owner) must not drop the newer entry.
        manager.remove_state(&IracKeyInfo::new(2, key("k"), owner(4)));
        assert!(manager.contains_key(&key("k")));

        manager.remove_state(&IracKeyInfo::new(2, key("k"), owner(5)));
        assert!(!manager.contains_key(&key("k")));
    }

    #[tokio::test]
    async fn test_receive_state_does_not_clobber_local_entry() {
        let site = TestSite::new("NYC");
        let (manager, _, _) = manager_with_sites(vec![site]);

        manager.track_updated_key(1, key("k"), owner(9));
        manager.receive_state(1, key("k"), owner(3), None, false);
        assert_eq!(manager.pending_keys()[0].owner, owner(9));

        manager.receive_state(4, key("other"), owner(2), None, true);
        assert!(manager.contains_key(&key("other")));
    }

    #[tokio::test]
    async fn test_check_and_track_expiration_requires_all_sites() {
        let nyc = TestSite::new("NYC");
        let sfo = TestSite::new("SFO");
        let ber = TestSite::new("BER");
        let (manager, _, _) =
            manager_with_sites(vec![nyc.clone(), sfo.clone(), ber.clone()]);

        nyc.set_expired(b"k", true);
        sfo.set_expired(b"k", false);
        ber.set_expired(b"k", false);
        assert!(!manager.check_and_track_expiration(&key("k")).await);

        sfo.set_expired(b"k", true);
        assert!(!manager.check_and_track_expiration(&key("k")).await);

        ber.set_expired(b"k", true);
        assert!(manager.check_and_track_expiration(&key("k")).await);
    }

    #[tokio::test]
    async fn test_state_transfer_completion() {
        let site = TestSite::new("NYC");
        let (manager, _, _) = manager_with_sites(vec![site]);

        let states = vec![
            XSiteState {
                segment: 0,
                key: key("a"),
                value: Some(Bytes::from_static(b"1")),
                tombstone: None,
            },
            XSiteState {
                segment: 1,
                key: key("b"),
                value: None,
                tombstone: Some(tombstone("LON", 1)),
            },
        ];
        let done = manager.track_for_state_transfer(states);
        tokio::pin!(done);

        // Not complete until the sends are acknowledged.
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), &mut done)
            .await
            .is_err());

        manager.send_cycle().await;
        tokio::time::timeout(std::time::Duration::from_secs(1), done)
            .await
            .expect("state transfer must complete after acks");
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_check_stale_keys_sends_cleanup() {
        let site = TestSite::new("NYC");
        let (manager, transport, _) = manager_with_sites(vec![site]);

        manager.track_updated_key(0, key("live"), owner(7));

        let keys = vec![
            IracKeyInfo::new(0, key("live"), owner(7)),  // still tracked
            IracKeyInfo::new(0, key("gone"), owner(3)),  // never tracked
            IracKeyInfo::new(0, key("live"), owner(6)),  // superseded owner
        ];
        manager.check_stale_keys(9, &keys).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let (dest, message) = &sent[0];
        assert_eq!(*dest, 9);
        match message {
            ClusterMessage::IracCleanup { keys, .. } => {
                assert_eq!(keys.len(), 2);
                assert!(keys.iter().all(|k| k.owner != owner(7)));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_apply_remote_update_orders_by_version() {
        let site = TestSite::new("NYC");
        let (manager, _, container) = manager_with_sites(vec![site]);
        container.put(
            key("k"),
            ContainerEntry::new(Bytes::from_static(b"old"), Some(tombstone("NYC", 1))),
        );

        // Causally newer remote update applies.
        let newer = IracUpdate {
            segment: 0,
            key: key("k"),
            value: Some(Bytes::from_static(b"new")),
            tombstone: Some(tombstone("NYC", 2)),
            expiration: false,
            owner: RequestId::new(2, 1),
        };
        assert_eq!(manager.apply_remote_update(&newer), IracResolution::Applied);
        assert_eq!(
            container.get(&key("k")).unwrap().value,
            Bytes::from_static(b"new")
        );

        // Stale redelivery is discarded and counted.
        let stale = IracUpdate {
            tombstone: Some(tombstone("NYC", 1)),
            ..newer.clone()
        };
        assert_eq!(
            manager.apply_remote_update(&stale),
            IracResolution::Discarded
        );
        assert_eq!(manager.counter_snapshot().discards, 1);
    }

    #[tokio::test]
    async fn test_concurrent_conflict_uses_policy() {
        let site = TestSite::new("NYC");
        let (manager, _, container) = manager_with_sites(vec![site]);

        // Local updated by LON, remote concurrently by AAA (wins: lowest
        // site name).
        container.put(
            key("k"),
            ContainerEntry::new(Bytes::from_static(b"local"), Some(tombstone("LON", 1))),
        );
        let remote = IracUpdate {
            segment: 0,
            key: key("k"),
            value: Some(Bytes::from_static(b"remote")),
            tombstone: Some(tombstone("AAA", 1)),
            expiration: false,
            owner: RequestId::new(2, 1),
        };
        assert_eq!(
            manager.apply_remote_update(&remote),
            IracResolution::ConflictRemoteWins
        );
        assert_eq!(
            container.get(&key("k")).unwrap().value,
            Bytes::from_static(b"remote")
        );

        // Concurrent loser keeps the local value.
        container.put(
            key("j"),
            ContainerEntry::new(Bytes::from_static(b"local"), Some(tombstone("LON", 1))),
        );
        let losing = IracUpdate {
            segment: 0,
            key: key("j"),
            value: Some(Bytes::from_static(b"remote")),
            tombstone: Some(tombstone("ZRH", 1)),
            expiration: false,
            owner: RequestId::new(2, 2),
        };
        assert_eq!(
            manager.apply_remote_update(&losing),
            IracResolution::ConflictLocalWins
        );
        assert_eq!(
            container.get(&key("j")).unwrap().value,
            Bytes::from_static(b"local")
        );

        let snapshot = manager.counter_snapshot();
        assert_eq!(snapshot.conflict_remote_wins, 1);
        assert_eq!(snapshot.conflict_local_wins, 1);
    }

    #[tokio::test]
    async fn test_remote_expiration_never_wins_conflict() {
        let site = TestSite::new("NYC");
        let (manager, _, container) = manager_with_sites(vec![site]);

        container.put(
            key("k"),
            ContainerEntry::new(Bytes::from_static(b"local"), Some(tombstone("ZRH", 1))),
        );
        // Remote expiration from the "winning" site name still loses.
        let expiration = IracUpdate {
            segment: 0,
            key: key("k"),
            value: None,
            tombstone: Some(tombstone("AAA", 1)),
            expiration: true,
            owner: RequestId::new(2, 1),
        };
        assert_eq!(
            manager.apply_remote_update(&expiration),
            IracResolution::ConflictLocalWins
        );
        assert!(container.get(&key("k")).is_some());
    }

    #[tokio::test]
    async fn test_remote_write_beats_local_pending_expiration() {
        let site = TestSite::new("NYC");
        let (manager, _, container) = manager_with_sites(vec![site]);

        // Local expiration removed the entry and is pending cross-site
        // confirmation.
        manager.record_removal_tombstone(key("k"), tombstone("LON", 2));
        manager.track_expired_key(0, key("k"), owner(1));

        let remote_write = IracUpdate {
            segment: 0,
            key: key("k"),
            value: Some(Bytes::from_static(b"remote")),
            tombstone: Some(tombstone("NYC", 1)),
            expiration: false,
            owner: RequestId::new(2, 1),
        };
        assert_eq!(
            manager.apply_remote_update(&remote_write),
            IracResolution::ConflictRemoteWins
        );
        // The remote write prevails and the local expiration is discarded.
        assert_eq!(
            container.get(&key("k")).unwrap().value,
            Bytes::from_static(b"remote")
        );
        assert!(!manager.contains_key(&key("k")));
    }

    #[tokio::test]
    async fn test_topology_update_drops_unowned_segments() {
        let site = TestSite::new("NYC");
        let (manager, transport, _) = manager_with_sites(vec![site]);

        let factory = ConsistentHashFactory::new(CacheMode::Distributed);
        // Node 1 owns every segment alone.
        let solo = Arc::new(factory.create(1, 4, &[1], None).unwrap());
        let old = Arc::new(
            CacheTopology::new(1, 1, solo.clone(), None, TopologyPhase::NoRebalance, vec![1], vec![])
                .unwrap(),
        );
        // After rebalance node 2 takes over half the segments.
        let both = Arc::new(factory.rebalance(
            &factory.update_members(&solo, &[1, 2], None).unwrap(),
        ));
        let new = Arc::new(
            CacheTopology::new(2, 1, both.clone(), None, TopologyPhase::NoRebalance, vec![1, 2], vec![])
                .unwrap(),
        );

        for segment in 0..4u32 {
            manager.track_updated_key(
                segment,
                key(&format!("k{}", segment)),
                owner(u64::from(segment)),
            );
        }
        manager.topology_updated(Some(old), new).await;

        // Only keys in segments still owned by node 1 remain.
        for info in manager.pending_keys() {
            assert!(both.is_segment_owner(info.segment, 1));
        }
        assert!(manager.len() < 4);
        // Node 1 lost segments, it does not gain any: no state requests.
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_topology_update_requests_state_for_new_segments() {
        let site = TestSite::new("NYC");
        let transport = RecordingTransport::new(2);
        let container = Arc::new(InMemoryContainer::new());
        let manager = IracManager::new(
            "users",
            IracConfig::new("LON"),
            transport.clone(),
            vec![site as Arc<dyn BackupSite>],
            container,
            Arc::new(DefaultConflictPolicy),
        );

        let factory = ConsistentHashFactory::new(CacheMode::Distributed);
        let solo = Arc::new(factory.create(1, 4, &[1], None).unwrap());
        let old = Arc::new(
            CacheTopology::new(1, 1, solo.clone(), None, TopologyPhase::NoRebalance, vec![1], vec![])
                .unwrap(),
        );
        let both = Arc::new(factory.rebalance(
            &factory.update_members(&solo, &[1, 2], None).unwrap(),
        ));
        let new = Arc::new(
            CacheTopology::new(2, 1, both.clone(), None, TopologyPhase::NoRebalance, vec![1, 2], vec![])
                .unwrap(),
        );

        manager.topology_updated(Some(old), new).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let (dest, message) = &sent[0];
        assert_eq!(*dest, 1);
        match message {
            ClusterMessage::IracStateRequest {
                requestor,
                segments,
                ..
            } => {
                assert_eq!(*requestor, 2);
                let expected: Vec<SegmentId> = (0..4)
                    .filter(|&s| both.is_segment_owner(s, 2))
                    .collect();
                assert_eq!(segments, &expected);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
