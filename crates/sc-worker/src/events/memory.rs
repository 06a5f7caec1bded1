//! Process-local node update channel

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;

use sc_core::error::EventsError;
use sc_core::traits::NodeEvents;
use sc_core::NodeId;

/// Buffered notifications per subscriber before the oldest are dropped
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Node update channel backed by a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct MemoryNodeEvents {
    tx: broadcast::Sender<String>,
}

impl MemoryNodeEvents {
    /// Create a channel with no subscribers
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish a raw payload, bypassing node id formatting
    pub fn publish_raw(&self, payload: impl Into<String>) {
        // No subscribers is not an error
        let _ = self.tx.send(payload.into());
    }
}

impl Default for MemoryNodeEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeEvents for MemoryNodeEvents {
    async fn publish(&self, node: NodeId) -> Result<(), EventsError> {
        self.publish_raw(node.to_string());
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, String>, EventsError> {
        let rx = self.tx.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Node event subscriber lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let events = MemoryNodeEvents::new();
        let mut stream = events.subscribe().await.unwrap();

        let node = NodeId::new();
        events.publish(node).await.unwrap();
        events.publish_raw("garbage");

        assert_eq!(stream.next().await, Some(node.to_string()));
        assert_eq!(stream.next().await.as_deref(), Some("garbage"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let events = MemoryNodeEvents::new();
        events.publish(NodeId::new()).await.unwrap();
    }
}
