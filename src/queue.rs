//! The inbound operation queue and the per-document processing lease that decides
//! whether a newly-connected drain needs to be kicked off (§4.4's "exactly one
//! serializer drains a document's queue at a time").
//!
//! Grounded on `original_source/routers/websockets.py` (the `rpush`
//! `document_operations_{id}` / `exists` + `set` `document_processing_{id}` dance) and
//! `utils/actors/task.py::fetch_operations_from_redis`/`cleanup` for the pop and release
//! sides. A Redis-backed implementation is provided for production multi-process
//! deployments, and an in-memory one for tests and single-process deployments.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend failure: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// The raw, not-yet-transformed operation envelope as the session handler enqueues it
/// (still serialized JSON at this point, same as `original_source`'s `rpush` of the raw
/// websocket payload — parsing happens once the serializer pops it).
#[async_trait]
pub trait InboundQueue: Send + Sync {
    async fn push(&self, document_id: Uuid, payload: String) -> Result<(), QueueError>;

    /// Pops the oldest pending payload, or `None` once the queue is drained.
    async fn pop(&self, document_id: Uuid) -> Result<Option<String>, QueueError>;
}

/// A document's processing lease: held by whichever serializer task is currently
/// draining its queue, so a second session enqueueing concurrently doesn't spawn a
/// second drain.
#[async_trait]
pub trait ProcessingLease: Send + Sync {
    /// Atomically claims the lease if it is free. Returns `true` if this call won the
    /// claim (mirrors `exists` + `set` in `websockets.py`, but race-free). Backed
    /// implementations carry a TTL (30s for `RedisQueue`) so a worker that crashes
    /// mid-drain without calling `release` cannot wedge the document forever (§5/§7's
    /// `LeaseLost`).
    async fn try_claim(&self, document_id: Uuid) -> Result<bool, QueueError>;

    async fn release(&self, document_id: Uuid) -> Result<(), QueueError>;
}

fn operations_key(document_id: Uuid) -> String {
    format!("document_operations_{document_id}")
}

fn processing_key(document_id: Uuid) -> String {
    format!("document_processing_{document_id}")
}

pub struct RedisQueue {
    client: redis::Client,
}

impl RedisQueue {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InboundQueue for RedisQueue {
    async fn push(&self, document_id: Uuid, payload: String) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.rpush::<_, _, ()>(operations_key(document_id), payload)
            .await?;
        Ok(())
    }

    async fn pop(&self, document_id: Uuid) -> Result<Option<String>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.lpop(operations_key(document_id), None).await?;
        Ok(value)
    }
}

#[async_trait]
impl ProcessingLease for RedisQueue {
    async fn try_claim(&self, document_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let set: bool = redis::cmd("SET")
            .arg(processing_key(document_id))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(30_000)
            .query_async(&mut conn)
            .await
            .unwrap_or(false);
        Ok(set)
    }

    async fn release(&self, document_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(processing_key(document_id)).await?;
        Ok(())
    }
}

/// In-memory queue + lease, for tests and single-process deployments.
#[derive(Default, Clone)]
pub struct InMemoryQueue {
    operations: Arc<Mutex<HashMap<Uuid, VecDeque<String>>>>,
    leases: Arc<Mutex<std::collections::HashSet<Uuid>>>,
}

impl InMemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InboundQueue for InMemoryQueue {
    async fn push(&self, document_id: Uuid, payload: String) -> Result<(), QueueError> {
        self.operations
            .lock()
            .await
            .entry(document_id)
            .or_default()
            .push_back(payload);
        Ok(())
    }

    async fn pop(&self, document_id: Uuid) -> Result<Option<String>, QueueError> {
        Ok(self
            .operations
            .lock()
            .await
            .get_mut(&document_id)
            .and_then(VecDeque::pop_front))
    }
}

#[async_trait]
impl ProcessingLease for InMemoryQueue {
    async fn try_claim(&self, document_id: Uuid) -> Result<bool, QueueError> {
        Ok(self.leases.lock().await.insert(document_id))
    }

    async fn release(&self, document_id: Uuid) -> Result<(), QueueError> {
        self.leases.lock().await.remove(&document_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_push_pop_order() {
        let queue = InMemoryQueue::new();
        let document_id = Uuid::new_v4();
        queue.push(document_id, "a".to_string()).await.unwrap();
        queue.push(document_id, "b".to_string()).await.unwrap();

        assert_eq!(queue.pop(document_id).await.unwrap(), Some("a".to_string()));
        assert_eq!(queue.pop(document_id).await.unwrap(), Some("b".to_string()));
        assert_eq!(queue.pop(document_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn second_claim_fails_until_released() {
        let queue = InMemoryQueue::new();
        let document_id = Uuid::new_v4();
        assert!(queue.try_claim(document_id).await.unwrap());
        assert!(!queue.try_claim(document_id).await.unwrap());

        queue.release(document_id).await.unwrap();
        assert!(queue.try_claim(document_id).await.unwrap());
    }
}
