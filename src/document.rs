//! The durable document record: current content plus `last_revision`, and the
//! `DocumentStore` trait the serializer needs (§1: persistence is an external
//! collaborator; this module defines the interface it consumes plus an in-memory
//! implementation usable in tests and single-process deployments).
//!
//! Grounded on `original_source/models/document.py` for the field set (`user_id`,
//! `share_role`, `shared_by_link` gate whether a connecting session may edit).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShareRole {
    View,
    Edit,
}

/// A document's current state: content plus the revision clock the serializer advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub content: Vec<String>,
    pub last_revision: u64,
    pub user_id: Option<Uuid>,
    pub share_role: ShareRole,
    pub shared_by_link: bool,
}

impl Document {
    #[must_use]
    pub fn new(id: Uuid, user_id: Option<Uuid>) -> Self {
        Self {
            id,
            content: vec![String::new()],
            last_revision: 0,
            user_id,
            share_role: ShareRole::View,
            shared_by_link: false,
        }
    }

    /// Whether a session without a resolved identity may nonetheless connect, per the
    /// sharing attributes on this document.
    #[must_use]
    pub fn publicly_editable(&self) -> bool {
        self.shared_by_link && self.share_role == ShareRole::Edit
    }

    #[must_use]
    pub fn publicly_readable(&self) -> bool {
        self.shared_by_link
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {0} not found")]
    NotFound(Uuid),
    #[error("revision conflict for document {document_id}: expected {expected}, got {actual}")]
    RevisionConflict {
        document_id: Uuid,
        expected: u64,
        actual: u64,
    },
}

/// What the serializer needs from persistence: load a document and commit a new
/// content/revision pair. Out of scope per §1 beyond this interface — a real
/// deployment plugs in a database-backed implementation.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, document_id: Uuid) -> Result<Document, StoreError>;

    /// Commits `content`/`new_revision` for `document_id`, but only if the document's
    /// current `last_revision` still equals `expected_revision` (optimistic
    /// concurrency matching invariant 1: revision advances by exactly +1 per op).
    async fn update(
        &self,
        document_id: Uuid,
        expected_revision: u64,
        new_revision: u64,
        content: Vec<String>,
    ) -> Result<(), StoreError>;
}

/// In-memory `DocumentStore`, for tests and single-process deployments without an
/// external database.
#[derive(Default, Clone)]
pub struct InMemoryDocumentStore {
    documents: Arc<RwLock<HashMap<Uuid, Document>>>,
}

impl InMemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, document: Document) {
        self.documents.write().await.insert(document.id, document);
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, document_id: Uuid) -> Result<Document, StoreError> {
        self.documents
            .read()
            .await
            .get(&document_id)
            .cloned()
            .ok_or(StoreError::NotFound(document_id))
    }

    async fn update(
        &self,
        document_id: Uuid,
        expected_revision: u64,
        new_revision: u64,
        content: Vec<String>,
    ) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        let document = documents
            .get_mut(&document_id)
            .ok_or(StoreError::NotFound(document_id))?;
        if document.last_revision != expected_revision {
            return Err(StoreError::RevisionConflict {
                document_id,
                expected: expected_revision,
                actual: document.last_revision,
            });
        }
        document.content = content;
        document.last_revision = new_revision;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_not_found_for_unknown_document() {
        let store = InMemoryDocumentStore::new();
        let err = store.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_rejects_stale_expected_revision() {
        let store = InMemoryDocumentStore::new();
        let doc = Document::new(Uuid::new_v4(), None);
        let id = doc.id;
        store.insert(doc).await;

        store
            .update(id, 0, 1, vec!["a".to_string()])
            .await
            .unwrap();

        let err = store
            .update(id, 0, 1, vec!["b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RevisionConflict { .. }));
    }

    #[tokio::test]
    async fn update_advances_revision_and_content() {
        let store = InMemoryDocumentStore::new();
        let doc = Document::new(Uuid::new_v4(), None);
        let id = doc.id;
        store.insert(doc).await;

        store
            .update(id, 0, 1, vec!["hello".to_string()])
            .await
            .unwrap();

        let updated = store.get(id).await.unwrap();
        assert_eq!(updated.last_revision, 1);
        assert_eq!(updated.content, vec!["hello".to_string()]);
    }
}
