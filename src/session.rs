//! The per-connection handler: authenticates and authorizes the upgrade request,
//! registers the session with `registry`, then runs two concurrent halves — a receive
//! loop that turns client frames into queue pushes or local cursor broadcasts, and a
//! forwarder that drains this session's outbound channel plus its `bus` subscription
//! onto the WebSocket.
//!
//! Grounded on `original_source/routers/websockets.py::websocket_endpoint` (the
//! receive loop, the cursor fast-path, the lease-claim-then-trigger dispatch) and
//! `connection_manager.py::connect` (roster send, join broadcast). The forwarder
//! task alongside the receive loop, both driven to completion with `tokio::select!`,
//! follows the shape of the teacher's `listen_socket`/syncer tasks in `daemon.rs`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{self, Identity, IdentityResolver};
use crate::bus::{Bus, BusMessage};
use crate::document::DocumentStore;
use crate::oplog::OperationLog;
use crate::ot::OperationType;
use crate::queue::{InboundQueue, ProcessingLease};
use crate::registry::{ConnectionRegistry, Peer};
use crate::wire::{ClientFrame, QueuedOperation, ServerFrame};
use crate::worker::{self, WorkerContext};

/// Failure modes of the WebSocket handshake itself, before a session exists to log
/// against — everything past the upgrade is handled inline in `run_session` instead,
/// since by then there is no client-facing status code left to return (§7).
#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("document not found")]
    DocumentNotFound,
    #[error("authentication or authorization failed")]
    AuthFailure,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::DocumentNotFound => StatusCode::NOT_FOUND.into_response(),
            Self::AuthFailure => StatusCode::FORBIDDEN.into_response(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub oplog: Arc<dyn OperationLog>,
    pub bus: Arc<dyn Bus>,
    pub queue: Arc<dyn InboundQueue>,
    pub lease: Arc<dyn ProcessingLease>,
    pub registry: ConnectionRegistry,
    pub identity_resolver: Arc<dyn IdentityResolver>,
}

impl AppState {
    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            queue: self.queue.clone(),
            lease: self.lease.clone(),
            store: self.store.clone(),
            oplog: self.oplog.clone(),
            bus: self.bus.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

pub async fn upgrade(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match authorize(&state, document_id, &params).await {
        Ok((identity, may_edit)) => ws
            .on_upgrade(move |socket| run_session(socket, state, document_id, identity, may_edit))
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn authorize(
    state: &AppState,
    document_id: Uuid,
    params: &ConnectParams,
) -> Result<(Option<Identity>, bool), SessionError> {
    let document = state
        .store
        .get(document_id)
        .await
        .map_err(|_| SessionError::DocumentNotFound)?;

    let identity = match &params.token {
        Some(token) => state.identity_resolver.resolve(token).await.ok(),
        None => None,
    };

    if !auth::may_connect(identity.as_ref(), &document) {
        return Err(SessionError::AuthFailure);
    }
    let may_edit = auth::may_edit(identity.as_ref(), &document);
    Ok((identity, may_edit))
}

fn synthesize_peer(identity: Option<&Identity>) -> (String, String) {
    match identity {
        Some(identity) => (identity.username.clone(), identity.user_id.to_string()),
        None => (
            "Anonymous".to_string(),
            format!("anon-{}", Uuid::new_v4()),
        ),
    }
}

async fn run_session(
    socket: WebSocket,
    state: AppState,
    document_id: Uuid,
    identity: Option<Identity>,
    may_edit: bool,
) {
    let session_id = Uuid::new_v4();
    let (username, user_token) = synthesize_peer(identity.as_ref());
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);

    let roster = state
        .registry
        .join(
            document_id,
            session_id,
            username.clone(),
            user_token.clone(),
            outbound_tx.clone(),
        )
        .await;
    if send_json(&mut ws_sender, &roster).await.is_err() {
        state.registry.leave(document_id, session_id).await;
        return;
    }

    let mut bus_stream = match state.bus.subscribe(document_id).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%document_id, %err, "failed to subscribe to document bus");
            state.registry.leave(document_id, session_id).await;
            return;
        }
    };
    let bus_user_token = user_token.clone();

    let worker_ctx = state.worker_context();

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                let Some(outgoing) = outgoing else { break };
                if ws_sender.send(Message::Text(outgoing)).await.is_err() {
                    break;
                }
            }
            bus_message = bus_stream.next() => {
                let Some(bus_message) = bus_message else { continue };
                let frame = frame_for_bus_message(&bus_message, &bus_user_token);
                if ws_sender.send(Message::Text(frame.to_json())).await.is_err() {
                    break;
                }
            }
            incoming = ws_receiver.next() => {
                let Some(incoming) = incoming else { break };
                match incoming {
                    Ok(Message::Text(text)) => {
                        handle_incoming(
                            &state,
                            &worker_ctx,
                            document_id,
                            session_id,
                            &user_token,
                            may_edit,
                            &text,
                        )
                        .await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(%document_id, %err, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    state.registry.leave(document_id, session_id).await;
    info!(%document_id, %session_id, "session disconnected");
}

fn frame_for_bus_message(message: &BusMessage, own_user_token: &str) -> ServerFrame {
    if message.user_token == own_user_token {
        ServerFrame::Acknowledge {
            revision: message.revision,
        }
    } else {
        ServerFrame::ExtChange {
            data: message.operation.clone(),
            revision: message.revision,
        }
    }
}

async fn handle_incoming(
    state: &AppState,
    worker_ctx: &WorkerContext,
    document_id: Uuid,
    session_id: Uuid,
    user_token: &str,
    may_edit: bool,
    text: &str,
) {
    let op: ClientFrame = match serde_json::from_str(text) {
        Ok(op) => op,
        Err(err) => {
            warn!(%document_id, %err, "dropping malformed client frame");
            return;
        }
    };

    if op.op_type == OperationType::Cursor {
        let payload = ServerFrame::Cursor { data: op }.to_json();
        state
            .registry
            .broadcast(document_id, session_id, payload, None)
            .await;
        return;
    }

    if !may_edit {
        debug!(%document_id, %session_id, "dropping edit from read-only session");
        return;
    }

    let envelope = QueuedOperation {
        user_token: user_token.to_string(),
        operation: op,
    };
    let payload = serde_json::to_string(&envelope).expect("QueuedOperation always serializes");
    if let Err(err) = state.queue.push(document_id, payload).await {
        warn!(%document_id, %err, "failed to enqueue operation");
        return;
    }
    if let Err(err) = worker::trigger_drain(worker_ctx.clone(), document_id).await {
        warn!(%document_id, %err, "failed to trigger document drain");
    }
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    roster: &[Peer],
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(roster).expect("roster always serializes");
    sender.send(Message::Text(payload)).await
}
