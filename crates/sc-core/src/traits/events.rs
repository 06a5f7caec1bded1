//! Node update notifications

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::EventsError;
use crate::types::NodeId;

/// Logical topic carrying node change notifications
pub const NODE_UPDATES_CHANNEL: &str = "node_updates";

/// Publish/subscribe channel of node ids.
///
/// Subscribers receive raw payloads; validating them is the subscriber's job
/// since other publishers may write anything to the topic.
#[async_trait]
pub trait NodeEvents: Send + Sync {
    /// Announce that a node's declared state changed
    async fn publish(&self, node: NodeId) -> Result<(), EventsError>;

    /// Receive every payload published after this call.
    ///
    /// The stream ends when the underlying channel is lost.
    async fn subscribe(&self) -> Result<BoxStream<'static, String>, EventsError>;
}
