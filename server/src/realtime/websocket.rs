//! WebSocket endpoint for reviewer sessions.
//!
//! Each upgrade gets a fresh socket id, registers with the hub, and is
//! immediately offered work. Incoming frames are JSON client events; errors
//! in an event handler are caught here and surfaced as
//! `client_server_error` rather than tearing the socket down.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::controller::{ConnectionController, ConversationController};
use crate::error::Result;
use crate::realtime::hub::{Hub, Outbound};
use crate::realtime::protocol::{ClientEvent, ServerEvent};

/// Transport-level ping cadence, to surface half-dead TCP connections. The
/// application-level liveness heartbeat is the `ping` client event.
const TRANSPORT_PING_INTERVAL: Duration = Duration::from_secs(30);

// MARK: - Handler

/// GET /ws (WebSocket upgrade)
pub async fn reviewer_socket(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
    State(connections): State<Arc<ConnectionController>>,
    State(conversations): State<Arc<ConversationController>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub, connections, conversations))
}

// MARK: - Socket lifecycle

async fn handle_socket(
    socket: WebSocket,
    hub: Arc<Hub>,
    connections: Arc<ConnectionController>,
    conversations: Arc<ConversationController>,
) {
    let sid = Uuid::new_v4().to_string();
    info!(sid = %sid, "Reviewer connected");

    // Register before announcing the session so no event published during
    // connect can be missed.
    let mut outbound = hub.register(&sid);

    if let Err(e) = connections.connect(&sid).await {
        error!(sid = %sid, error = %e, "Session registration failed");
        hub.unregister(&sid);
        return;
    }
    if let Err(e) = conversations.pick().await {
        error!(sid = %sid, error = %e, "Initial pick failed");
    }

    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));

    // Forward hub events to the socket.
    let sender_send = sender.clone();
    let send_sid = sid.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                Outbound::Event(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            error!(sid = %send_sid, error = %e, "Failed to serialize event");
                            continue;
                        }
                    };
                    let mut guard = sender_send.lock().await;
                    if guard.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    debug!(sid = %send_sid, "Server-initiated disconnect");
                    let mut guard = sender_send.lock().await;
                    let _ = guard.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Dispatch client events.
    let hub_recv = hub.clone();
    let recv_sid = sid.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Close(_) => break,
                Message::Text(text) => {
                    let event = match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(sid = %recv_sid, error = %e, "Unparseable client event");
                            continue;
                        }
                    };
                    if let Err(e) =
                        dispatch(event, &recv_sid, &connections, &conversations).await
                    {
                        error!(sid = %recv_sid, error = %e, "Uncaught error in event handler");
                        let report = ServerEvent::ServerError {
                            error_msg: e.to_string(),
                        };
                        if let Err(e) = hub_recv.emit_all(report).await {
                            error!(error = %e, "Failed to emit server error");
                        }
                    }
                }
                Message::Ping(_) => debug!(sid = %recv_sid, "Received transport ping"),
                _ => {}
            }
        }
    });

    // Transport heartbeat to detect stale connections.
    let sender_ping = sender.clone();
    let mut ping_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(TRANSPORT_PING_INTERVAL);
        loop {
            interval.tick().await;
            let mut guard = sender_ping.lock().await;
            if guard.send(Message::Ping(vec![].into())).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => { recv_task.abort(); ping_task.abort(); }
        _ = (&mut recv_task) => { send_task.abort(); ping_task.abort(); }
        _ = (&mut ping_task) => { send_task.abort(); recv_task.abort(); }
    }

    // Liveness is TTL-based: the session key simply expires and the next
    // sweeper tick reaps the session.
    hub.unregister(&sid);
    info!(sid = %sid, "Reviewer connection closed");
}

// MARK: - Event dispatch

async fn dispatch(
    event: ClientEvent,
    sid: &str,
    connections: &ConnectionController,
    conversations: &ConversationController,
) -> Result<()> {
    match event {
        ClientEvent::Ping => connections.ping(sid).await,
        ClientEvent::ActivitySignal => connections.activity_signal(sid).await,
        ClientEvent::ScoreConversation(request) => conversations.score(request, sid).await,
    }
}
