//! The JSON frames exchanged over a session's WebSocket connection.
//!
//! Grounded on `original_source/schema/websocket.py`'s `MessageTypeEnum` for the tag
//! vocabulary (`CURSOR`, `ACKNOWLEDGE`, `EXT_CHANGE`) and on `routers/websockets.py` /
//! `routers/connection_manager.py` for which frames carry a tag at all: the initial
//! roster and a newly-joined peer's announcement are untagged (a bare array, and a bare
//! peer object, respectively — see `registry::Peer`), matching what
//! `send_all_users_info`/`broadcast_new_user` actually send. Tagging style (`tag =
//! "type"`, one variant per message kind) follows the teacher's `editor_protocol.rs`.

use serde::{Deserialize, Serialize};

use crate::ot::Operation;

/// A client frame is exactly an [`Operation`] — the same shape whether it's an edit
/// (`INPUT`/`PASTE`/`UNDO`/`DELETE`) destined for the queue, or a `CURSOR` op handled
/// inline without ever touching the serializer.
pub type ClientFrame = Operation;

/// What a session actually pushes onto the inbound queue: the client's operation plus
/// the session's `user_token`, so the serializer can carry authorship through to the
/// bus without the OT algebra itself needing to know about identity. Mirrors
/// `original_source/routers/websockets.py` wrapping the raw client payload as
/// `{"data": json_data, "user_token": token}` before the `rpush`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub user_token: String,
    pub operation: Operation,
}

/// Sent to every remaining peer when a session drops off a document. Untagged, matching
/// `original_source/connection_manager.py`'s disconnect broadcast (a bare object, no
/// `"type"` key — same treatment as the roster and join-announcement frames).
#[derive(Debug, Clone, Serialize)]
pub struct DisconnectNotice {
    pub message: String,
    pub user_token: String,
}

impl DisconnectNotice {
    #[must_use]
    pub fn for_token(user_token: &str) -> Self {
        Self {
            message: format!("User {user_token} Disconnected from the file."),
            user_token: user_token.to_string(),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("DisconnectNotice always serializes")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// A committed edit, fanned out to every other session on the document.
    #[serde(rename = "EXT_CHANGE")]
    ExtChange { data: Operation, revision: u64 },
    /// An ephemeral cursor position, fanned out to every other session. Never echoed
    /// back to its sender and never assigned a revision.
    #[serde(rename = "CURSOR")]
    Cursor { data: Operation },
    /// Echoed back to the session whose edit was just committed, in place of the
    /// `ExtChange` broadcast (which goes to everyone else instead).
    #[serde(rename = "ACKNOWLEDGE")]
    Acknowledge { revision: u64 },
}

impl ServerFrame {
    /// Panics only if `Operation`/`u64` somehow fail to serialize, which they cannot.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerFrame always serializes")
    }
}
