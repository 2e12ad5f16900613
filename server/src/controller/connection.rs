//! Socket-event side of reviewer sessions: connect, heartbeat, activity
//! bonus, and the dead-session sweep.

use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::models::{ConnectionModel, ConversationModel};
use crate::realtime::protocol::{CurrentStatus, ServerEvent, BROADCAST_ROOM};
use crate::realtime::Hub;

pub struct ConnectionController {
    connections: ConnectionModel,
    conversations: ConversationModel,
    hub: Arc<Hub>,
}

impl ConnectionController {
    pub fn new(
        connections: ConnectionModel,
        conversations: ConversationModel,
        hub: Arc<Hub>,
    ) -> Self {
        Self {
            connections,
            conversations,
            hub,
        }
    }

    /// A reviewer socket opened: register the session, join the broadcast
    /// room, and tell everyone the new count.
    pub async fn connect(&self, sid: &str) -> Result<()> {
        let count = self.connections.increment(sid).await?;
        self.hub.enter_room(sid, BROADCAST_ROOM);
        crate::metrics::set_reviewer_sessions(count);
        self.send_update(count).await
    }

    /// Heartbeat: refresh liveness and push the remaining review time back
    /// to the sender. Heartbeats never extend the review clock itself.
    pub async fn ping(&self, sid: &str) -> Result<()> {
        self.connections.extend(sid).await?;
        let time = self.conversations.get_time(sid).await?;
        self.hub
            .emit_to(sid, ServerEvent::TimeUpdate(time.to_string()))
            .await
    }

    /// Activity signal: credit the bonus and push the new remaining time.
    pub async fn activity_signal(&self, sid: &str) -> Result<()> {
        let time = self.conversations.earn_bonus(sid).await?;
        self.hub
            .emit_to(sid, ServerEvent::TimeUpdate(time.to_string()))
            .await
    }

    /// Sweeper entry point: reap sessions whose liveness expired, kick them
    /// out of the broadcast room and force-close their sockets. Returns the
    /// reaped sids so the conversation side can release their assignments.
    pub async fn dead_connections(&self) -> Result<Vec<String>> {
        let (changed, count, removed) = self.connections.integrity().await?;
        if !changed {
            info!("No dead reviewer sessions found");
            return Ok(Vec::new());
        }

        info!(count, removed = ?removed, "Dead reviewer sessions removed");
        crate::metrics::set_reviewer_sessions(count);
        for sid in &removed {
            self.hub.leave_room(sid, BROADCAST_ROOM).await?;
            self.hub.disconnect(sid).await?;
        }
        Ok(removed)
    }

    async fn send_update(&self, session_count: i64) -> Result<()> {
        let queue = self.conversations.get_queue().await?;
        let status = CurrentStatus {
            session_count,
            conversation_queue: queue.iter().map(|e| e.status()).collect(),
        };
        info!(
            session_count,
            queue_len = status.conversation_queue.len(),
            "Broadcasting status update"
        );
        self.hub
            .emit_room(BROADCAST_ROOM, ServerEvent::StatusUpdate(status))
            .await
    }
}
