//! The serializer: the single place where a document's operation queue is drained,
//! each pending operation transformed against whatever committed since it was authored,
//! applied to content, and fanned back out over the bus.
//!
//! Grounded on `original_source/utils/actors/task.py`: `async_document_task` is this
//! module's `drain_document`, `fetch_operations_from_redis` is the `queue.pop` loop,
//! `transform_and_prepare_operation` is `rebase`, `apply_and_save_operation` is the
//! `oplog`/`store` commit, and `cleanup` is the lease release. Unlike the Python
//! version (a dramatiq task run in a separate worker process), this is a plain
//! `tokio::spawn`ed future — `session` claims the lease and spawns it the same way
//! `websockets.py` calls `transform_document.send(...)` after winning the
//! `document_processing_{id}` claim.

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::bus::{Bus, BusError, BusMessage};
use crate::document::{DocumentStore, StoreError};
use crate::oplog::{LoggedOperation, OperationLog};
use crate::ot::{self, Operation, OperationType};
use crate::queue::{InboundQueue, ProcessingLease, QueueError};
use crate::wire::QueuedOperation;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Everything `drain_document` needs, bundled so `session` only has to pass one value
/// across the `tokio::spawn` boundary.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: std::sync::Arc<dyn InboundQueue>,
    pub lease: std::sync::Arc<dyn ProcessingLease>,
    pub store: std::sync::Arc<dyn DocumentStore>,
    pub oplog: std::sync::Arc<dyn OperationLog>,
    pub bus: std::sync::Arc<dyn Bus>,
}

/// Claims the processing lease for `document_id` and, if this call won it, spawns
/// `drain_document` on the runtime. A no-op if another task already holds the lease —
/// that task's drain loop will pick up the operation this call just pushed.
pub async fn trigger_drain(ctx: WorkerContext, document_id: Uuid) -> Result<(), WorkerError> {
    if ctx.lease.try_claim(document_id).await? {
        tokio::spawn(async move {
            if let Err(err) = drain_document(&ctx, document_id).await {
                error!(%document_id, %err, "document drain failed");
            }
            if let Err(err) = ctx.lease.release(document_id).await {
                error!(%document_id, %err, "failed to release processing lease");
            }
        });
    }
    Ok(())
}

/// Drains `document_id`'s inbound queue to empty, committing each operation in turn.
/// Malformed or invalid operations are logged and skipped rather than aborting the
/// whole drain (§7: the serializer should not wedge a document behind one bad op).
async fn drain_document(ctx: &WorkerContext, document_id: Uuid) -> Result<(), WorkerError> {
    while let Some(payload) = ctx.queue.pop(document_id).await? {
        let Some((user_token, op)) = parse_envelope(&payload) else {
            continue;
        };
        match commit_operation(ctx, document_id, op).await {
            Ok(committed) => {
                ctx.bus
                    .publish(BusMessage {
                        document_id,
                        revision: committed.revision,
                        operation: committed.operation,
                        user_token,
                    })
                    .await?;
            }
            Err(err) => {
                warn!(%document_id, %err, "dropping operation that failed to commit");
            }
        }
    }
    Ok(())
}

fn parse_envelope(payload: &str) -> Option<(String, Operation)> {
    match serde_json::from_str::<QueuedOperation>(payload) {
        Ok(envelope) if envelope.operation.op_type != OperationType::Cursor => {
            Some((envelope.user_token, envelope.operation))
        }
        Ok(_) => {
            warn!("dropping cursor operation that reached the inbound queue");
            None
        }
        Err(err) => {
            warn!(%err, "dropping malformed operation payload");
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CommitError {
    #[error(transparent)]
    Ot(#[from] ot::OtError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Rebases `op` against every operation committed since the revision it was authored
/// against, applies it to the document's current content, and persists both the
/// content and the append-only log entry under the document's expected revision (§4.4:
/// a committed operation is assigned exactly one, strictly increasing revision).
async fn commit_operation(
    ctx: &WorkerContext,
    document_id: Uuid,
    mut op: Operation,
) -> Result<LoggedOperation, CommitError> {
    let document = ctx.store.get(document_id).await?;
    let last_revision = ctx.oplog.max_revision(document_id).await;

    if op.revision < last_revision {
        for logged in ctx.oplog.since(document_id, op.revision).await {
            op = ot::transform(&op, &logged.operation)?;
        }
    }
    let new_revision = last_revision + 1;
    op.revision = new_revision;

    let new_content = ot::apply(&document.content, &op)?;
    debug!(%document_id, revision = new_revision, "applying committed operation");

    ctx.store
        .update(document_id, last_revision, new_revision, new_content)
        .await?;
    let entry = LoggedOperation {
        document_id,
        revision: new_revision,
        operation: op,
    };
    ctx.oplog.append(entry.clone()).await.ok();
    Ok(entry)
}
