//! The in-process presence map and fan-out actor: one per server process, tracking
//! which sessions are live for which document and forwarding outbound frames to them.
//!
//! The `Handle`/actor split (a cheaply-cloneable `ConnectionRegistry` wrapping an
//! `mpsc::Sender`, backed by a task running `RegistryActor::run`) is the same shape as
//! `daemon.rs`'s `Daemon`/`DaemonActor`. The presence semantics — a joining session
//! receives the full current roster, then everyone else receives just the new peer; a
//! random pastel color per peer; `broadcast`'s `send_to_owner` distinguishing an
//! acknowledgement-to-self from silence — are `connection_manager.py`'s
//! `ConnectionManager`.

use std::collections::HashMap;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::wire::DisconnectNotice;

/// A connected peer's presentation to other sessions on the same document. Carries no
/// session id: peers are identified to each other only by `user_token`, matching
/// `connection_manager.py`'s `websocket_data`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Peer {
    pub username: String,
    pub user_token: String,
    pub client_color: String,
}

fn random_pastel_color() -> String {
    let mut rng = rand::thread_rng();
    let r = rng.gen_range(180..=255u8);
    let g = rng.gen_range(180..=255u8);
    let b = rng.gen_range(180..=255u8);
    format!("#{r:02X}{g:02X}{b:02X}")
}

struct Session {
    peer: Peer,
    outbound: mpsc::Sender<String>,
}

enum RegistryMessage {
    Join {
        document_id: Uuid,
        session_id: Uuid,
        username: String,
        user_token: String,
        outbound: mpsc::Sender<String>,
        response_tx: oneshot::Sender<Vec<Peer>>,
    },
    Leave {
        document_id: Uuid,
        session_id: Uuid,
    },
    /// `owner_payload`: `Some` delivers that payload back to the sending session
    /// instead of the broadcast payload (an acknowledgement); `None` skips the sender
    /// entirely (e.g. cursor broadcasts, which never echo).
    Broadcast {
        document_id: Uuid,
        sender_session_id: Uuid,
        payload: String,
        owner_payload: Option<String>,
    },
}

struct RegistryActor {
    message_rx: mpsc::Receiver<RegistryMessage>,
    documents: HashMap<Uuid, HashMap<Uuid, Session>>,
}

impl RegistryActor {
    async fn run(&mut self) {
        while let Some(message) = self.message_rx.recv().await {
            self.handle_message(message).await;
        }
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::Join {
                document_id,
                session_id,
                username,
                user_token,
                outbound,
                response_tx,
            } => {
                let roster = self.roster(document_id);
                let _ = response_tx.send(roster);

                let peer = Peer {
                    username,
                    user_token,
                    client_color: random_pastel_color(),
                };
                self.broadcast_to_others(document_id, session_id, &peer_json(&peer))
                    .await;
                self.documents
                    .entry(document_id)
                    .or_default()
                    .insert(session_id, Session { peer, outbound });
            }
            RegistryMessage::Leave {
                document_id,
                session_id,
            } => {
                let Some(sessions) = self.documents.get_mut(&document_id) else {
                    return;
                };
                let Some(session) = sessions.remove(&session_id) else {
                    return;
                };
                if sessions.is_empty() {
                    self.documents.remove(&document_id);
                }
                let notice = DisconnectNotice::for_token(&session.peer.user_token).to_json();
                self.broadcast_to_others(document_id, session_id, &notice)
                    .await;
            }
            RegistryMessage::Broadcast {
                document_id,
                sender_session_id,
                payload,
                owner_payload,
            } => {
                let Some(sessions) = self.documents.get(&document_id) else {
                    return;
                };
                for (session_id, session) in sessions {
                    let outgoing = if *session_id == sender_session_id {
                        owner_payload.clone()
                    } else {
                        Some(payload.clone())
                    };
                    let Some(outgoing) = outgoing else { continue };
                    if session.outbound.send(outgoing).await.is_err() {
                        warn!(%document_id, %session_id, "dropping message for closed session");
                    }
                }
            }
        }
    }

    fn roster(&self, document_id: Uuid) -> Vec<Peer> {
        self.documents
            .get(&document_id)
            .map(|sessions| sessions.values().map(|s| s.peer.clone()).collect())
            .unwrap_or_default()
    }

    async fn broadcast_to_others(&self, document_id: Uuid, except: Uuid, payload: &str) {
        let Some(sessions) = self.documents.get(&document_id) else {
            return;
        };
        for (session_id, session) in sessions {
            if *session_id == except {
                continue;
            }
            if session.outbound.send(payload.to_string()).await.is_err() {
                warn!(%document_id, %session_id, "dropping join notice for closed session");
            }
        }
    }
}

fn peer_json(peer: &Peer) -> String {
    serde_json::to_string(peer).expect("Peer always serializes")
}

/// Cheaply-cloneable handle to the registry actor.
#[derive(Clone)]
pub struct ConnectionRegistry {
    message_tx: mpsc::Sender<RegistryMessage>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn spawn() -> Self {
        let (message_tx, message_rx) = mpsc::channel(256);
        let mut actor = RegistryActor {
            message_rx,
            documents: HashMap::new(),
        };
        tokio::spawn(async move { actor.run().await });
        Self { message_tx }
    }

    /// Registers `session_id` as connected to `document_id`, returning the roster of
    /// peers already present (not including this session) and broadcasting this
    /// session's presence to them.
    pub async fn join(
        &self,
        document_id: Uuid,
        session_id: Uuid,
        username: String,
        user_token: String,
        outbound: mpsc::Sender<String>,
    ) -> Vec<Peer> {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .message_tx
            .send(RegistryMessage::Join {
                document_id,
                session_id,
                username,
                user_token,
                outbound,
                response_tx,
            })
            .await
            .is_err()
        {
            debug!("registry actor gone during join");
            return Vec::new();
        }
        response_rx.await.unwrap_or_default()
    }

    pub async fn leave(&self, document_id: Uuid, session_id: Uuid) {
        let _ = self
            .message_tx
            .send(RegistryMessage::Leave {
                document_id,
                session_id,
            })
            .await;
    }

    pub async fn broadcast(
        &self,
        document_id: Uuid,
        sender_session_id: Uuid,
        payload: String,
        owner_payload: Option<String>,
    ) {
        let _ = self
            .message_tx
            .send(RegistryMessage::Broadcast {
                document_id,
                sender_session_id,
                payload,
                owner_payload,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_joiner_sees_first_in_roster_and_first_is_notified() {
        let registry = ConnectionRegistry::spawn();
        let document_id = Uuid::new_v4();
        let (first_tx, mut first_rx) = mpsc::channel(8);
        let (second_tx, _second_rx) = mpsc::channel(8);

        let first_session = Uuid::new_v4();
        let roster = registry
            .join(
                document_id,
                first_session,
                "alice".to_string(),
                "token-a".to_string(),
                first_tx,
            )
            .await;
        assert!(roster.is_empty());

        let second_session = Uuid::new_v4();
        let roster = registry
            .join(
                document_id,
                second_session,
                "bob".to_string(),
                "token-b".to_string(),
                second_tx,
            )
            .await;
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].user_token, "token-a");

        let notice = first_rx.recv().await.unwrap();
        assert!(notice.contains("token-b"));
    }

    #[tokio::test]
    async fn leave_notifies_remaining_peers_with_disconnect_message() {
        let registry = ConnectionRegistry::spawn();
        let document_id = Uuid::new_v4();
        let (first_tx, mut first_rx) = mpsc::channel(8);
        let (second_tx, _second_rx) = mpsc::channel(8);

        let first_session = Uuid::new_v4();
        registry
            .join(document_id, first_session, "alice".into(), "token-a".into(), first_tx)
            .await;
        let second_session = Uuid::new_v4();
        registry
            .join(document_id, second_session, "bob".into(), "token-b".into(), second_tx)
            .await;
        // Drain the join notice sent to `first_session` for "bob" joining.
        let _ = first_rx.recv().await;

        registry.leave(document_id, second_session).await;

        let notice = first_rx.recv().await.unwrap();
        assert!(notice.contains("token-b"));
        assert!(notice.contains("Disconnected from the file"));
        assert!(!notice.contains(r#""type""#));
    }

    #[tokio::test]
    async fn broadcast_skips_sender_without_owner_payload() {
        let registry = ConnectionRegistry::spawn();
        let document_id = Uuid::new_v4();
        let (sender_tx, mut sender_rx) = mpsc::channel(8);
        let (other_tx, mut other_rx) = mpsc::channel(8);

        let sender_session = Uuid::new_v4();
        registry
            .join(document_id, sender_session, "a".into(), "ta".into(), sender_tx)
            .await;
        let other_session = Uuid::new_v4();
        registry
            .join(document_id, other_session, "b".into(), "tb".into(), other_tx)
            .await;
        // Drain the join notice sent to `sender_session` for "b" joining.
        let _ = sender_rx.recv().await;

        registry
            .broadcast(document_id, sender_session, "cursor-update".to_string(), None)
            .await;

        let received = other_rx.recv().await.unwrap();
        assert_eq!(received, "cursor-update");
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_acknowledges_sender_when_owner_payload_given() {
        let registry = ConnectionRegistry::spawn();
        let document_id = Uuid::new_v4();
        let (sender_tx, mut sender_rx) = mpsc::channel(8);

        let sender_session = Uuid::new_v4();
        registry
            .join(document_id, sender_session, "a".into(), "ta".into(), sender_tx)
            .await;

        registry
            .broadcast(
                document_id,
                sender_session,
                "to-others".to_string(),
                Some("ack".to_string()),
            )
            .await;

        let received = sender_rx.recv().await.unwrap();
        assert_eq!(received, "ack");
    }
}
