//! Cross-worker event fan-out.
//!
//! Reviewer sockets are spread over multiple worker processes, but status
//! updates and sweeper decisions must reach all of them. Every emission is
//! published as an envelope on a shared pub/sub channel; each worker runs a
//! subscriber task that delivers envelopes to its local sockets. A single
//! publisher's envelopes are delivered in publish order, which is what keeps
//! `client_review_update` ahead of the status broadcast describing the same
//! assignment.

use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::realtime::protocol::ServerEvent;
use crate::store::{keys, Kv};

/// Frame handed to a socket's send task.
#[derive(Debug)]
pub enum Outbound {
    Event(ServerEvent),
    /// Server-initiated close; the sweeper reaps sessions this way.
    Close,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Envelope {
    Session { sid: String, event: ServerEvent },
    Room { room: String, event: ServerEvent },
    All { event: ServerEvent },
    LeaveRoom { sid: String, room: String },
    Disconnect { sid: String },
}

// ---------------------------------------------------------------------------
// Local registry
// ---------------------------------------------------------------------------

struct LocalSession {
    tx: mpsc::UnboundedSender<Outbound>,
    rooms: HashSet<String>,
}

/// Sessions attached to this worker process.
#[derive(Default)]
struct Registry {
    sessions: DashMap<String, LocalSession>,
}

impl Registry {
    fn register(&self, sid: &str) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(
            sid.to_string(),
            LocalSession {
                tx,
                rooms: HashSet::new(),
            },
        );
        rx
    }

    fn unregister(&self, sid: &str) {
        self.sessions.remove(sid);
    }

    fn enter_room(&self, sid: &str, room: &str) {
        if let Some(mut session) = self.sessions.get_mut(sid) {
            session.rooms.insert(room.to_string());
        }
    }

    fn deliver(&self, envelope: Envelope) {
        match envelope {
            Envelope::Session { sid, event } => {
                if let Some(session) = self.sessions.get(&sid) {
                    let _ = session.value().tx.send(Outbound::Event(event));
                }
            }
            Envelope::Room { room, event } => {
                for session in self.sessions.iter() {
                    if session.value().rooms.contains(&room) {
                        let _ = session.value().tx.send(Outbound::Event(event.clone()));
                    }
                }
            }
            Envelope::All { event } => {
                for session in self.sessions.iter() {
                    let _ = session.value().tx.send(Outbound::Event(event.clone()));
                }
            }
            Envelope::LeaveRoom { sid, room } => {
                if let Some(mut session) = self.sessions.get_mut(&sid) {
                    session.rooms.remove(&room);
                }
            }
            Envelope::Disconnect { sid } => {
                if let Some(session) = self.sessions.get(&sid) {
                    let _ = session.value().tx.send(Outbound::Close);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

pub struct Hub {
    kv: Kv,
    registry: Registry,
}

impl Hub {
    pub fn new(kv: Kv) -> Self {
        Self {
            kv,
            registry: Registry::default(),
        }
    }

    /// Attaches a socket that lives on this worker. The returned receiver
    /// feeds the socket's send task.
    pub fn register(&self, sid: &str) -> mpsc::UnboundedReceiver<Outbound> {
        self.registry.register(sid)
    }

    pub fn unregister(&self, sid: &str) {
        self.registry.unregister(sid);
    }

    /// Joins a room. Local-only: sockets always join rooms from the worker
    /// that owns them.
    pub fn enter_room(&self, sid: &str, room: &str) {
        self.registry.enter_room(sid, room);
    }

    /// Leaves a room, wherever the socket lives.
    pub async fn leave_room(&self, sid: &str, room: &str) -> Result<()> {
        self.publish(&Envelope::LeaveRoom {
            sid: sid.to_string(),
            room: room.to_string(),
        })
        .await
    }

    pub async fn emit_to(&self, sid: &str, event: ServerEvent) -> Result<()> {
        self.publish(&Envelope::Session {
            sid: sid.to_string(),
            event,
        })
        .await
    }

    pub async fn emit_room(&self, room: &str, event: ServerEvent) -> Result<()> {
        self.publish(&Envelope::Room {
            room: room.to_string(),
            event,
        })
        .await
    }

    pub async fn emit_all(&self, event: ServerEvent) -> Result<()> {
        self.publish(&Envelope::All { event }).await
    }

    /// Asks whichever worker owns the socket to close it.
    pub async fn disconnect(&self, sid: &str) -> Result<()> {
        self.publish(&Envelope::Disconnect {
            sid: sid.to_string(),
        })
        .await
    }

    async fn publish(&self, envelope: &Envelope) -> Result<()> {
        let payload = serde_json::to_string(envelope)?;
        self.kv.publish(keys::EVENT_CHANNEL, &payload).await
    }

    /// Subscribes to the event channel and delivers envelopes to local
    /// sockets until shutdown. Reconnects with a short backoff when the
    /// subscription drops.
    pub async fn run_subscriber(&self, shutdown: CancellationToken) {
        let channel = self.kv.key(keys::EVENT_CHANNEL);
        info!(channel = %channel, "Event subscriber started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let mut pubsub = match self.kv.client().get_async_pubsub().await {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "Event subscription connect failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            if let Err(e) = pubsub.subscribe(&channel).await {
                warn!(error = %e, "Event channel subscribe failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    msg = stream.next() => {
                        let Some(msg) = msg else {
                            warn!("Event subscription dropped, reconnecting");
                            break;
                        };
                        match msg.get_payload::<String>() {
                            Ok(payload) => self.deliver(&payload),
                            Err(e) => warn!(error = %e, "Undecodable event payload"),
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Event subscriber shutting down");
                        return;
                    }
                }
            }
        }
    }

    fn deliver(&self, payload: &str) {
        match serde_json::from_str::<Envelope>(payload) {
            Ok(envelope) => {
                debug!(?envelope, "Delivering envelope");
                self.registry.deliver(envelope);
            }
            Err(e) => warn!(error = %e, "Malformed event envelope"),
        }
    }
}
