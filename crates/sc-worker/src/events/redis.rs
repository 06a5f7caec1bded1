//! Redis pub/sub node update channel

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::AsyncCommands;

use sc_core::error::EventsError;
use sc_core::traits::{NodeEvents, NODE_UPDATES_CHANNEL};
use sc_core::NodeId;

/// Node update channel shared by every worker through Redis
#[derive(Clone)]
pub struct RedisNodeEvents {
    client: redis::Client,
    publisher: redis::aio::MultiplexedConnection,
}

impl RedisNodeEvents {
    /// Connect to Redis at `url`
    pub async fn connect(url: &str) -> Result<Self, EventsError> {
        let client = redis::Client::open(url).map_err(backend_error)?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend_error)?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl NodeEvents for RedisNodeEvents {
    async fn publish(&self, node: NodeId) -> Result<(), EventsError> {
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn
            .publish(NODE_UPDATES_CHANNEL, node.to_string())
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, String>, EventsError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(backend_error)?;
        pubsub
            .subscribe(NODE_UPDATES_CHANNEL)
            .await
            .map_err(backend_error)?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!("Ignoring undecodable node event: {}", e);
                        None
                    }
                }
            });
        Ok(stream.boxed())
    }
}

fn backend_error(err: redis::RedisError) -> EventsError {
    EventsError::Backend(err.to_string())
}
