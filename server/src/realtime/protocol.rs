//! Wire schema for the reviewer socket.
//!
//! Every frame is a JSON object tagged by event name:
//! `{"event": "...", "data": ...}`. Client events carry reviewer actions;
//! server events push queue status, assignments and countdowns.

use serde::{Deserialize, Serialize};

/// Broadcast room joined by every connected reviewer.
pub const BROADCAST_ROOM: &str = "scorer";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Liveness heartbeat. Extends the session TTL, never the review clock.
    #[serde(rename = "ping")]
    Ping,
    /// Reviewer is actively working; earns a bonus on the review clock.
    #[serde(rename = "activity_signal")]
    ActivitySignal,
    #[serde(rename = "score_conversation")]
    ScoreConversation(ScoreRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "client_status_update")]
    StatusUpdate(CurrentStatus),
    #[serde(rename = "client_review_update")]
    ReviewUpdate(ReviewDetails),
    #[serde(rename = "client_review_done")]
    ReviewDone { status: ReviewOutcome },
    /// Remaining seconds on the reviewer's assignment clock, as a string.
    #[serde(rename = "client_time_update")]
    TimeUpdate(String),
    #[serde(rename = "client_server_error")]
    ServerError { error_msg: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewOutcome {
    Done,
    Expired,
}

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: i32,
    pub message: String,
}

/// One entry of the shared review queue, as stored in the KV list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub guid: String,
    pub challenge_id: i64,
    /// Socket id of the assigned reviewer; empty while unassigned.
    pub assigned_to: String,
}

impl QueueEntry {
    pub fn is_assigned(&self) -> bool {
        !self.assigned_to.is_empty()
    }

    pub fn status(&self) -> QueueEntryStatus {
        QueueEntryStatus {
            id: self.id,
            guid: self.guid.clone(),
            challenge_id: self.challenge_id,
            in_review: self.is_assigned(),
        }
    }
}

/// Queue entry as broadcast to reviewers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntryStatus {
    pub id: i64,
    pub guid: String,
    pub challenge_id: i64,
    pub in_review: bool,
}

/// A submitted review request; stored as the details blob keyed by guid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub id: i64,
    pub challenge_id: i64,
    pub challenge_goal: String,
    pub challenge_title: String,
    pub conversation: Option<Vec<ChatMessage>>,
    pub picture: Option<String>,
    pub timestamp: String,
    pub conversation_id: String,
    pub document: String,
    pub answer_uri: String,
}

impl ReviewRequest {
    pub fn entry(&self) -> QueueEntry {
        QueueEntry {
            id: self.id,
            guid: self.conversation_id.clone(),
            challenge_id: self.challenge_id,
            assigned_to: String::new(),
        }
    }

    pub fn details(&self) -> ReviewDetails {
        ReviewDetails {
            id: self.id,
            guid: self.conversation_id.clone(),
            title: self.challenge_title.clone(),
            goal: self.challenge_goal.clone(),
            document: self.document.clone(),
            conversation: self.conversation.clone(),
            picture: self.picture.clone(),
        }
    }
}

/// Everything the assigned reviewer needs to judge a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewDetails {
    pub id: i64,
    pub guid: String,
    pub title: String,
    pub goal: String,
    pub document: String,
    pub conversation: Option<Vec<ChatMessage>>,
    pub picture: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentStatus {
    pub session_count: i64,
    pub conversation_queue: Vec<QueueEntryStatus>,
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRequest {
    pub conversation_id: String,
    pub passed: bool,
    pub custom_message: String,
}

/// Body POSTed to the submitter's `answer_uri`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreResult {
    pub passed: bool,
    pub custom_message: String,
}
