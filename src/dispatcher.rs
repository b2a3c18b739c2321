use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

use crate::cluster_message::ClusterMessage;

/// The seam towards the actor layer: every completely received message is handed over
///  exactly once per message id (within the deduplication retention window).
///
/// Implementations are called on a receiver task and MUST NOT block for long or perform
///  I/O that could call back into the transport - routing to the actor registry and
///  offloading any real work is their responsibility.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn process_message(&self, source: SocketAddr, message: ClusterMessage);
}
