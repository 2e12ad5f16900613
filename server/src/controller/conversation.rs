//! Work-item flows: submission, matching reviewers to work, scoring, and
//! the two sweeper paths (dead reviewers, expired assignments).
//!
//! The models own the distributed lock; by the time anything is emitted
//! here the lock has been released, so slow sockets or a slow callback
//! never stall another worker's queue mutation.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::SCORING_KEY_HEADER;
use crate::error::{Error, Result};
use crate::models::{ConnectionModel, ConversationModel};
use crate::realtime::protocol::{
    CurrentStatus, ReviewOutcome, ReviewRequest, ScoreRequest, ScoreResult, ServerEvent,
    BROADCAST_ROOM,
};
use crate::realtime::Hub;

pub struct ConversationController {
    conversations: ConversationModel,
    connections: ConnectionModel,
    hub: Arc<Hub>,
    http: reqwest::Client,
    scoring_key: String,
}

impl ConversationController {
    pub fn new(
        conversations: ConversationModel,
        connections: ConnectionModel,
        hub: Arc<Hub>,
        scoring_key: String,
    ) -> Self {
        Self {
            conversations,
            connections,
            hub,
            http: reqwest::Client::new(),
            scoring_key,
        }
    }

    /// Matches one waiting reviewer with the earliest unassigned work item.
    ///
    /// Pops from the pool; if no unassigned work remains the reviewer is
    /// returned to the *head* of the pop order so they keep their turn.
    /// Always ends with a status broadcast.
    pub async fn pick(&self) -> Result<()> {
        if let Some(sid) = self.connections.pop_from_pool().await? {
            if let Some(guid) = self.conversations.assign_free(&sid).await? {
                info!(guid = %guid, sid = %sid, "Assigned conversation to reviewer");
                crate::metrics::record_review_assigned();
                match self.conversations.get_conversation(&guid).await? {
                    Some(details) => {
                        self.hub
                            .emit_to(&sid, ServerEvent::ReviewUpdate(details.details()))
                            .await?;
                    }
                    None => error!(guid = %guid, "Assigned conversation has no details"),
                }
            } else {
                self.connections.add_to_pool_front(&sid).await?;
            }
        } else {
            info!("No reviewers available to assign a conversation to");
        }

        self.send_update().await
    }

    /// Accepts a new review request unless its guid is already known.
    /// Returns false on a duplicate; the ingress layer maps that to 409.
    pub async fn new_conversation(&self, mut review: ReviewRequest) -> Result<bool> {
        let guid = review.conversation_id.clone();
        if self.conversations.get_conversation(&guid).await?.is_some() {
            error!(guid = %guid, "Conversation already exists");
            return Ok(false);
        }

        let id = self.conversations.push(review.entry()).await?;
        review.id = id;
        self.conversations.add(&review).await?;
        crate::metrics::record_review_submitted();
        self.pick().await?;
        Ok(true)
    }

    /// A reviewer delivered a verdict. Ignored (with an error log) unless
    /// the guid exists and is assigned to this reviewer. The work item is
    /// removed and the reviewer freed *before* the result callback fires;
    /// a failed callback is reported but never rolls anything back.
    pub async fn score(&self, request: ScoreRequest, sid: &str) -> Result<()> {
        let guid = &request.conversation_id;
        let Some(details) = self.conversations.get_conversation(guid).await? else {
            error!(guid = %guid, "Conversation not found");
            return Ok(());
        };

        match self.conversations.get_assignment(sid).await? {
            Some(assigned) if assigned == *guid => {}
            _ => {
                error!(guid = %guid, sid = %sid, "Conversation is not assigned to reviewer");
                return Ok(());
            }
        }

        self.conversations.remove(guid, sid).await?;
        self.hub
            .emit_to(
                sid,
                ServerEvent::ReviewDone {
                    status: ReviewOutcome::Done,
                },
            )
            .await?;
        self.connections.add_to_pool(sid).await?;
        self.pick().await?;

        info!(guid = %guid, passed = request.passed, "Scored conversation");
        crate::metrics::record_review_scored(request.passed);

        let result = ScoreResult {
            passed: request.passed,
            custom_message: request.custom_message,
        };
        self.deliver_result(&details.answer_uri, &result).await?;
        info!(uri = %details.answer_uri, "Scoring result delivered");
        Ok(())
    }

    async fn deliver_result(&self, uri: &str, result: &ScoreResult) -> Result<()> {
        self.http
            .post(uri)
            .header(SCORING_KEY_HEADER, &self.scoring_key)
            .json(result)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|source| Error::Callback {
                uri: uri.to_string(),
                source,
            })?;
        Ok(())
    }

    /// Reviewers reaped by the liveness sweep lose their assignments; their
    /// work returns to the queue in place and is offered out again.
    pub async fn dead_connections(&self, sids: &[String]) -> Result<()> {
        self.conversations.unassign_review(sids).await?;
        self.send_update().await?;
        self.pick().await
    }

    /// Assignments whose clock ran out: notify each reviewer, re-pool them
    /// if still alive, and try to hand the work to somebody else.
    pub async fn dead_reviews(&self) -> Result<()> {
        let expired = self.conversations.unassign_expired().await?;
        if expired.is_empty() {
            return Ok(());
        }

        info!(expired = ?expired, "Assignments expired");
        crate::metrics::record_reviews_expired(expired.len() as u64);
        for sid in &expired {
            self.hub
                .emit_to(
                    sid,
                    ServerEvent::ReviewDone {
                        status: ReviewOutcome::Expired,
                    },
                )
                .await?;
            if self.connections.is_alive(sid).await? {
                self.connections.add_to_pool(sid).await?;
            }
            self.pick().await?;
        }
        self.send_update().await
    }

    async fn send_update(&self) -> Result<()> {
        let session_count = self.connections.get_count().await?;
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
