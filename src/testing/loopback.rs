//! In-memory transport implementations for tests.

use crate::error::{Error, Result, TransportError};
use crate::irac::IracManager;
use crate::topology::TopologyUpdateHandler;
use crate::transport::{
    BackupSite, ClusterMessage, ClusterResponse, ClusterTransport, IracClearKeysRequest,
    IracUpdateBatch,
};
use crate::types::NodeId;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// In-process cluster: routes [`ClusterMessage`]s between registered
/// nodes without any real networking.
#[derive(Default)]
pub struct LoopbackNetwork {
    handlers: DashMap<NodeId, Arc<TopologyUpdateHandler>>,
    managers: DashMap<NodeId, Arc<IracManager>>,
    down: DashSet<NodeId>,
}

impl LoopbackNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node's topology handler.
    pub fn register_handler(&self, node: NodeId, handler: Arc<TopologyUpdateHandler>) {
        self.handlers.insert(node, handler);
    }

    /// Register a node's replication manager.
    pub fn register_manager(&self, node: NodeId, manager: Arc<IracManager>) {
        self.managers.insert(node, manager);
    }

    /// Make a node unreachable (or reachable again).
    pub fn set_down(&self, node: NodeId, down: bool) {
        if down {
            self.down.insert(node);
        } else {
            self.down.remove(&node);
        }
    }

    /// A transport bound to the given node.
    pub fn transport(self: &Arc<Self>, node: NodeId) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            node,
            network: self.clone(),
        })
    }
}

/// One node's view of the [`LoopbackNetwork`].
pub struct LoopbackTransport {
    node: NodeId,
    network: Arc<LoopbackNetwork>,
}

#[async_trait]
impl ClusterTransport for LoopbackTransport {
    fn local_node(&self) -> NodeId {
        self.node
    }

    async fn send(&self, dest: NodeId, message: ClusterMessage) -> Result<ClusterResponse> {
        if self.network.down.contains(&dest) {
            return Err(Error::Transport(TransportError::NodeUnreachable(dest)));
        }
        match &message {
            ClusterMessage::TopologyUpdate(command) => {
                let handler = self
                    .network
                    .handlers
                    .get(&dest)
                    .map(|h| h.clone())
                    .ok_or(TransportError::NodeUnreachable(dest))?;
                let ack = handler.handle_topology_update(command).await?;
                Ok(ClusterResponse::TopologyInstalled(ack))
            }
            _ => {
                let manager = self
                    .network
                    .managers
                    .get(&dest)
                    .map(|m| m.clone())
                    .ok_or(TransportError::NodeUnreachable(dest))?;
                manager.handle_cluster_message(&message).await
            }
        }
    }
}

/// Programmable backup site recording everything it receives.
pub struct StubSite {
    name: String,
    fail_sends: AtomicBool,
    batches: Mutex<Vec<IracUpdateBatch>>,
    clears: Mutex<Vec<IracClearKeysRequest>>,
    expired: Mutex<HashMap<Bytes, bool>>,
}

impl StubSite {
    /// Create a stub site that acknowledges everything.
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail_sends: AtomicBool::new(false),
            batches: Mutex::new(Vec::new()),
            clears: Mutex::new(Vec::new()),
            expired: Mutex::new(HashMap::new()),
        })
    }

    /// Make sends fail (entries stay pending) or succeed again.
    pub fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    /// Program the answer to expiration checks for one key
    /// (unprogrammed keys count as expired).
    pub fn set_expired(&self, key: &[u8], expired: bool) {
        self.expired
            .lock()
            .insert(Bytes::copy_from_slice(key), expired);
    }

    /// Batches received so far.
    pub fn batches(&self) -> Vec<IracUpdateBatch> {
        self.batches.lock().clone()
    }

    /// Clear requests received so far.
    pub fn clears(&self) -> Vec<IracClearKeysRequest> {
        self.clears.lock().clone()
    }

    /// Total updates received across all batches.
    pub fn update_count(&self) -> usize {
        self.batches.lock().iter().map(|b| b.len()).sum()
    }
}

#[async_trait]
impl BackupSite for StubSite {
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
