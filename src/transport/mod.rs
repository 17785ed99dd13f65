//! Transport collaborator interfaces.
//!
//! The grid core never opens sockets itself. It talks to two capability
//! interfaces and treats everything behind them as an unreliable,
//! at-least-once message channel:
//!
//! - [`ClusterTransport`] — request/response to members of the local
//!   cluster (topology broadcasts, segment-scoped replication state moves).
//! - [`BackupSite`] — the asynchronous channel to one remote site used by
//!   cross-site replication.
//!
//! The core's contract with both: a send is never assumed successful until
//! the response arrives. Transport-level retries and timeouts live behind
//! the interface; the core reacts to an `Err` by retrying on its own cycle
//! (IRAC) or by treating the peer as suspected failed (topology).
//!
//! Production deployments plug in a real networked implementation; the
//! in-memory loopback used by the integration tests lives in
//! [`crate::testing`].

mod messages;

pub use messages::{
    ClusterMessage, ClusterResponse, IracClearKeysRequest, IracStateEntry, IracUpdate,
    IracUpdateBatch,
};

use crate::error::Result;
use crate::types::NodeId;
use async_trait::async_trait;
use bytes::Bytes;

/// Request/response channel to the members of the local cluster.
#[async_trait]
pub trait ClusterTransport: Send + Sync + 'static {
    /// The node this transport belongs to.
    fn local_node(&self) -> NodeId;

    /// Send a message to one member and await its response.
    async fn send(&self, dest: NodeId, message: ClusterMessage) -> Result<ClusterResponse>;
}

/// Asynchronous channel to one remote backup site.
#[async_trait]
pub trait BackupSite: Send + Sync + 'static {
    /// Name of the remote site.
    fn name(&self) -> &str;

    /// Ship a batch of key updates to the site.
    ///
    /// Succeeds only once the site acknowledged the whole batch; on error
    /// the caller keeps the entries pending and retries later.
    async fn send_updates(&self, batch: &IracUpdateBatch) -> Result<()>;

    /// Instruct the site to discard all tracked keys for a cache.
    async fn send_clear(&self, request: &IracClearKeysRequest) -> Result<()>;

    /// Ask the site whether it considers the key expired.
    ///
    /// Returns `false` when the site has observed a more recent access or
    /// update, in which case the local expiration must not proceed.
    async fn check_expired(&self, cache_name: &str, key: &Bytes) -> Result<bool>;
}
