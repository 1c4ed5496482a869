//! The cross-process fan-out bus: once the serializer commits an operation it publishes
//! the result once per document, and every process holding live sessions for that
//! document re-broadcasts it locally via the `registry` module.
//!
//! `original_source/routers/websockets.py` subscribes one pub/sub channel per
//! *websocket connection* (`f"{document_id}_{id(websocket)}"`), because its worker pool
//! runs in separate OS processes from the web server and has to address a single
//! in-memory connection object by a proxy id. That per-connection channel is collapsed
//! here to one channel per document: this implementation's `registry` already performs
//! the local, in-process fan-out to every connected session, so the bus only needs to
//! get a committed operation to every process that might be holding one of them.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::ot::Operation;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus backend failure: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// A committed operation, as published to every process watching a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub document_id: Uuid,
    pub revision: u64,
    pub operation: Operation,
    /// The submitting session's token, so each process can tell its own sessions
    /// whether a given message is their own edit coming back (acknowledgement) or
    /// someone else's (broadcast).
    pub user_token: String,
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError>;

    /// A stream of every message published for `document_id` from the moment of the
    /// call onward. No backlog replay — `oplog::OperationLog::since` is how a session
    /// catches up on history it missed.
    async fn subscribe(&self, document_id: Uuid) -> Result<BoxStream<'static, BusMessage>, BusError>;
}

fn channel_key(document_id: Uuid) -> String {
    format!("document_channel_{document_id}")
}

pub struct RedisBus {
    client: redis::Client,
}

impl RedisBus {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        let payload = serde_json::to_string(&message)
            .map_err(|err| BusError::Backend(err.to_string()))?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.publish::<_, _, ()>(channel_key(message.document_id), payload)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        document_id: Uuid,
    ) -> Result<BoxStream<'static, BusMessage>, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel_key(document_id)).await?;
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });
        Ok(Box::pin(stream))
    }
}

/// In-process bus backed by one `tokio::sync::broadcast` channel per document, for
/// tests and single-process deployments.
#[derive(Clone)]
pub struct InMemoryBus {
    channels: Arc<Mutex<HashMap<Uuid, broadcast::Sender<BusMessage>>>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn sender_for(&self, document_id: Uuid) -> broadcast::Sender<BusMessage> {
        self.channels
            .lock()
            .await
            .entry(document_id)
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        let sender = self.sender_for(message.document_id).await;
        // No live subscribers is not an error: the document may have no sessions left.
        let _ = sender.send(message);
        Ok(())
    }

    async fn subscribe(
        &self,
        document_id: Uuid,
    ) -> Result<BoxStream<'static, BusMessage>, BusError> {
        let receiver = self.sender_for(document_id).await.subscribe();
        let stream = tokio_stream::wrappers::BroadcastStream::new(receiver)
            .filter_map(|item| async move { item.ok() });
        Ok(Box::pin(stream))
    }
}
