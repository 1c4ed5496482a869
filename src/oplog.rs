//! The append-only per-document operation log (§4.4). Out of scope for durable storage
//! per §1 beyond this interface; an in-memory implementation is provided for tests and
//! single-process deployments.
//!
//! Grounded on `original_source/models/operation.py` for the field set, and on
//! `document.operations.order_by("-revision")`/`.filter(revision__gte=...)` in
//! `utils/actors/task.py` for the access pattern `since`/`max_revision` must support.

use crate::ot::Operation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// An operation plus the revision the serializer assigned it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedOperation {
    pub document_id: Uuid,
    pub revision: u64,
    pub operation: Operation,
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("revision {revision} already logged for document {document_id} with different content")]
    RevisionConflict { document_id: Uuid, revision: u64 },
}

#[async_trait]
pub trait OperationLog: Send + Sync {
    /// Idempotent on `(document_id, revision)` if the content matches what's already
    /// logged; otherwise `RevisionConflict` (invariant 3: no two accepted operations
    /// share a revision).
    async fn append(&self, entry: LoggedOperation) -> Result<(), LogError>;

    /// Strictly ascending by revision, starting after `revision_exclusive`.
    async fn since(&self, document_id: Uuid, revision_exclusive: u64) -> Vec<LoggedOperation>;

    async fn max_revision(&self, document_id: Uuid) -> u64;
}

#[derive(Default, Clone)]
pub struct InMemoryOperationLog {
    entries: Arc<RwLock<HashMap<Uuid, Vec<LoggedOperation>>>>,
}

impl InMemoryOperationLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OperationLog for InMemoryOperationLog {
    async fn append(&self, entry: LoggedOperation) -> Result<(), LogError> {
        let mut entries = self.entries.write().await;
        let log = entries.entry(entry.document_id).or_default();
        if let Some(existing) = log.iter().find(|e| e.revision == entry.revision) {
            if existing.operation != entry.operation {
                return Err(LogError::RevisionConflict {
                    document_id: entry.document_id,
                    revision: entry.revision,
                });
            }
            return Ok(());
        }
        log.push(entry);
        log.sort_by_key(|e| e.revision);
        Ok(())
    }

    async fn since(&self, document_id: Uuid, revision_exclusive: u64) -> Vec<LoggedOperation> {
        self.entries
            .read()
            .await
            .get(&document_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.revision > revision_exclusive)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn max_revision(&self, document_id: Uuid) -> u64 {
        self.entries
            .read()
            .await
            .get(&document_id)
            .and_then(|log| log.iter().map(|e| e.revision).max())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::OperationType;
    use crate::position::Position;

    fn sample_op(revision: u64) -> Operation {
        Operation {
            from_pos: Position::new(0, 0),
            to_pos: Position::new(0, 0),
            text: vec!["x".to_string()],
            op_type: OperationType::Input,
            revision,
        }
    }

    #[tokio::test]
    async fn append_then_since_returns_ascending_order() {
        let log = InMemoryOperationLog::new();
        let document_id = Uuid::new_v4();

        for revision in [2, 1, 3] {
            log.append(LoggedOperation {
                document_id,
                revision,
                operation: sample_op(revision),
            })
            .await
            .unwrap();
        }

        let entries = log.since(document_id, 0).await;
        let revisions: Vec<u64> = entries.iter().map(|e| e.revision).collect();
        assert_eq!(revisions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn append_same_revision_same_content_is_idempotent() {
        let log = InMemoryOperationLog::new();
        let document_id = Uuid::new_v4();
        let entry = LoggedOperation {
            document_id,
            revision: 1,
            operation: sample_op(1),
        };
        log.append(entry.clone()).await.unwrap();
        log.append(entry).await.unwrap();
        assert_eq!(log.since(document_id, 0).await.len(), 1);
    }

    #[tokio::test]
    async fn append_same_revision_different_content_conflicts() {
        let log = InMemoryOperationLog::new();
        let document_id = Uuid::new_v4();
        log.append(LoggedOperation {
            document_id,
            revision: 1,
            operation: sample_op(1),
        })
        .await
        .unwrap();

        let mut other = sample_op(1);
        other.text = vec!["y".to_string()];
        let err = log
            .append(LoggedOperation {
                document_id,
                revision: 1,
                operation: other,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::RevisionConflict { .. }));
    }

    #[tokio::test]
    async fn max_revision_defaults_to_zero() {
        let log = InMemoryOperationLog::new();
        assert_eq!(log.max_revision(Uuid::new_v4()).await, 0);
    }
}
