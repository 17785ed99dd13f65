//! Local data container and persistent store collaborator interfaces.
//!
//! The grid core reads and writes entries through the narrow
//! [`DataContainer`] capability: get/put/remove keyed by raw storage key,
//! with the replication tombstone riding along. Eviction policy, memory
//! accounting and the full cache API live outside the core.
//!
//! [`StoreAdapter`] is the pluggable persistence seam consumed during state
//! transfer (preload/passivation); backends are swappable and the core
//! depends only on the trait.

use crate::error::Result;
use crate::irac::IracTombstone;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

/// A stored entry: the value plus the replication metadata of its last
/// update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    /// The stored value.
    pub value: Bytes,
    /// Version metadata of the update that produced this value.
    pub tombstone: Option<IracTombstone>,
}

impl ContainerEntry {
    /// Create an entry.
    pub fn new(value: Bytes, tombstone: Option<IracTombstone>) -> Self {
        Self { value, tombstone }
    }
}

/// Narrow view of the local data container used by the replication core.
pub trait DataContainer: Send + Sync + 'static {
    /// Look up an entry.
    fn get(&self, key: &Bytes) -> Option<ContainerEntry>;

    /// Insert or replace an entry.
    fn put(&self, key: Bytes, entry: ContainerEntry);

    /// Remove an entry, returning what was stored.
    fn remove(&self, key: &Bytes) -> Option<ContainerEntry>;

    /// Remove everything.
    fn clear(&self);

    /// Number of stored entries.
    fn len(&self) -> usize;

    /// Whether the container is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Heap-backed container used by embedded deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryContainer {
    entries: DashMap<Bytes, ContainerEntry>,
}

impl InMemoryContainer {
    /// Create an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Iterate over a snapshot of the stored keys.
    pub fn keys(&self) -> Vec<Bytes> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

impl DataContainer for InMemoryContainer {
    fn get(&self, key: &Bytes) -> Option<ContainerEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    fn put(&self, key: Bytes, entry: ContainerEntry) {
        self.entries.insert(key, entry);
    }

    fn remove(&self, key: &Bytes) -> Option<ContainerEntry> {
        self.entries.remove(key).map(|(_, e)| e)
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Pluggable persistent store, consumed during state transfer.
#[async_trait]
pub trait StoreAdapter: Send + Sync + 'static {
    /// Load an entry from the store.
    async fn load(&self, key: &Bytes) -> Result<Option<ContainerEntry>>;

    /// Persist an entry.
    async fn store(&self, key: Bytes, entry: ContainerEntry) -> Result<()>;

    /// Delete an entry from the store.
    async fn remove(&self, key: &Bytes) -> Result<()>;
}

/// In-memory store adapter for tests and volatile deployments.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<Bytes, ContainerEntry>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StoreAdapter for InMemoryStore {
    async fn load(&self, key: &Bytes) -> Result<Option<ContainerEntry>> {
        Ok(self.entries.get(key).map(|e| e.clone()))
    }

    async fn store(&self, key: Bytes, entry: ContainerEntry) -> Result<()> {
        self.entries.insert(key, entry);
        Ok(())
    }

    async fn remove(&self, key: &Bytes) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
