//! HTTP submission endpoint for challenge backends.
//!
//! POST /api/score, authenticated by the shared `x-scoring-key` secret.
//! Accepts exactly one of a conversation transcript (with its document) or
//! a picture; duplicates by conversation id are refused with 409 so
//! submitters can retry safely.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::config::{Config, SCORING_KEY_HEADER};
use crate::controller::ConversationController;
use crate::realtime::protocol::{ChatMessage, ReviewRequest};

#[derive(Debug, Deserialize)]
pub struct SubmitReviewBody {
    pub challenge_id: i64,
    pub challenge_goal: String,
    pub challenge_title: String,
    pub timestamp: String,
    pub conversation_id: String,
    pub answer_uri: String,
    #[serde(default)]
    pub conversation: Option<Vec<ChatMessage>>,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub document: Option<String>,
}

/// POST /api/score
pub async fn submit_review(
    State(config): State<Arc<Config>>,
    State(conversations): State<Arc<ConversationController>>,
    headers: HeaderMap,
    body: std::result::Result<Json<SubmitReviewBody>, JsonRejection>,
) -> Response {
    match headers
        .get(SCORING_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        None => {
            warn!("Scoring request denied due to missing authentication key");
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Some(key) if key != config.scoring_key => {
            warn!("Scoring request denied due to invalid authentication key");
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Some(_) => {}
    }

    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(error = %rejection, "Scoring request denied due to invalid body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    debug!(guid = %body.conversation_id, challenge_id = body.challenge_id, "Scoring request received");

    let review = match validate(body) {
        Ok(review) => review,
        Err(reason) => {
            warn!(reason, "Scoring request denied");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match conversations.new_conversation(review).await {
        Ok(true) => (StatusCode::OK, "OK").into_response(),
        Ok(false) => StatusCode::CONFLICT.into_response(),
        Err(e) => {
            error!(error = %e, "Failed to enqueue review request");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Enforces the conversation/picture shape rules and builds the stored
/// review request. The id is allocated later, when the item is queued.
fn validate(body: SubmitReviewBody) -> std::result::Result<ReviewRequest, &'static str> {
    let document = match (&body.conversation, &body.picture) {
        (None, None) => return Err("missing field: conversation or picture"),
        (Some(_), Some(_)) => return Err("both fields present: conversation and picture"),
        (Some(_), None) => match body.document {
            Some(ref document) => document.clone(),
            None => return Err("missing field: document"),
        },
        (None, Some(_)) => String::new(),
    };

    Ok(ReviewRequest {
        id: 0,
        challenge_id: body.challenge_id,
        challenge_goal: body.challenge_goal,
        challenge_title: body.challenge_title,
        conversation: body.conversation,
        picture: body.picture,
        timestamp: body.timestamp,
        conversation_id: body.conversation_id,
        document,
        answer_uri: body.answer_uri,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> SubmitReviewBody {
        SubmitReviewBody {
            challenge_id: 7,
            challenge_goal: "g".to_string(),
            challenge_title: "t".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            conversation_id: "G1".to_string(),
            answer_uri: "http://cb".to_string(),
            conversation: None,
            picture: None,
            document: None,
        }
    }

    #[test]
    fn rejects_when_neither_conversation_nor_picture() {
        assert!(validate(body()).is_err());
    }

    #[test]
    fn rejects_when_both_conversation_and_picture() {
        let mut b = body();
        b.conversation = Some(vec![]);
        b.picture = Some("data:image/png;base64,".to_string());
        assert!(validate(b).is_err());
    }

    #[test]
    fn conversation_requires_document() {
        let mut b = body();
        b.conversation = Some(vec![ChatMessage {
            role: 0,
            message: "hi".to_string(),
        }]);
        assert!(validate(b).is_err());
    }

    #[test]
    fn accepts_conversation_with_document() {
        let mut b = body();
        b.conversation = Some(vec![ChatMessage {
            role: 0,
            message: "hi".to_string(),
        }]);
        b.document = Some("d".to_string());
        let review = validate(b).unwrap();
        assert_eq!(review.document, "d");
        assert_eq!(review.conversation_id, "G1");
        assert_eq!(review.id, 0);
    }

    #[test]
    fn picture_submission_gets_empty_document() {
        let mut b = body();
        b.picture = Some("data:image/png;base64,xyz".to_string());
        let review = validate(b).unwrap();
        assert_eq!(review.document, "");
        assert!(review.conversation.is_none());
    }
}
