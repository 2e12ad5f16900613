//! End-to-end dispatch flows over a live Redis: submission, assignment,
//! scoring with its callback, and both sweeper paths.
//!
//! The controllers are driven directly, with hub sessions standing in for
//! reviewer sockets; an ephemeral axum listener receives the scoring
//! callback. Expiry is simulated by deleting the relevant keys.

use std::sync::Arc;
use std::time::Duration;

use axum::{http::HeaderMap, http::StatusCode, routing::post, Json, Router};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use dispatch_server::controller::{ConnectionController, ConversationController};
use dispatch_server::lock::DistLock;
use dispatch_server::models::{ConnectionModel, ConversationModel};
use dispatch_server::realtime::protocol::{
    ReviewOutcome, ReviewRequest, ScoreRequest, ServerEvent,
};
use dispatch_server::realtime::{Hub, Outbound};
use dispatch_server::store::{keys, Kv};

const TEST_SCORING_KEY: &str = "secret-key";

struct Rig {
    kv: Kv,
    hub: Arc<Hub>,
    connections: Arc<ConnectionController>,
    conversations: Arc<ConversationController>,
    model: ConversationModel,
    sessions: ConnectionModel,
    shutdown: CancellationToken,
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn rig() -> Rig {
    let url = std::env::var("TEST_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let kv = Kv::connect(&url)
        .await
        .expect("Redis connection failed -- is Redis running?")
        .with_prefix(format!("test-{}", uuid::Uuid::new_v4()));

    let hub = Arc::new(Hub::new(kv.clone()));
    let shutdown = CancellationToken::new();
    {
        let hub = hub.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { hub.run_subscriber(shutdown).await });
    }
    wait_for_subscriber(&hub).await;

    let lock = DistLock::new(kv.clone(), keys::LOCK_NAME);
    let sessions = ConnectionModel::new(kv.clone());
    let model = ConversationModel::new(kv.clone(), lock);
    let connections = Arc::new(ConnectionController::new(
        sessions.clone(),
        model.clone(),
        hub.clone(),
    ));
    let conversations = Arc::new(ConversationController::new(
        model.clone(),
        sessions.clone(),
        hub.clone(),
        TEST_SCORING_KEY.to_string(),
    ));

    Rig {
        kv,
        hub,
        connections,
        conversations,
        model,
        sessions,
        shutdown,
    }
}

/// Publishes probes until one comes back, proving the subscriber is live.
async fn wait_for_subscriber(hub: &Arc<Hub>) {
    let mut rx = hub.register("__probe__");
    for _ in 0..50 {
        hub.emit_to("__probe__", ServerEvent::TimeUpdate("0".to_string()))
            .await
            .expect("probe publish failed");
        if timeout(Duration::from_millis(100), rx.recv()).await.is_ok() {
            hub.unregister("__probe__");
            return;
        }
    }
    panic!("event subscriber did not come up");
}

/// Registers a reviewer session and runs the connect flow the socket
/// endpoint would run.
async fn connect(rig: &Rig, sid: &str) -> mpsc::UnboundedReceiver<Outbound> {
    let rx = rig.hub.register(sid);
    rig.connections.connect(sid).await.unwrap();
    rig.conversations.pick().await.unwrap();
    rx
}

fn review(guid: &str, answer_uri: &str) -> ReviewRequest {
    ReviewRequest {
        id: 0,
        challenge_id: 7,
        challenge_goal: "goal".to_string(),
        challenge_title: "title".to_string(),
        conversation: None,
        picture: Some("data:image/png;base64,xyz".to_string()),
        timestamp: "2024-01-01T00:00:00Z".to_string(),
        conversation_id: guid.to_string(),
        document: String::new(),
        answer_uri: answer_uri.to_string(),
    }
}

async fn next_outbound(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Outbound {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("session channel closed")
}

/// Reads events until `pred` matches, asserting that no status update along
/// the way marks `guard_guid` as in review (the review_update-first
/// ordering guarantee).
async fn expect_event(
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
    guard_guid: Option<&str>,
    pred: impl Fn(&ServerEvent) -> bool,
) -> ServerEvent {
    for _ in 0..20 {
        match next_outbound(rx).await {
            Outbound::Event(event) => {
                if pred(&event) {
                    return event;
                }
                if let (Some(guid), ServerEvent::StatusUpdate(status)) = (guard_guid, &event) {
                    let early = status
                        .conversation_queue
                        .iter()
                        .any(|e| e.guid == guid && e.in_review);
                    assert!(!early, "status marked {guid} in_review before review_update");
                }
            }
            Outbound::Close => panic!("unexpected close"),
        }
    }
    panic!("expected event never arrived");
}

fn is_review_update(guid: &str) -> impl Fn(&ServerEvent) -> bool + '_ {
    move |event| matches!(event, ServerEvent::ReviewUpdate(d) if d.guid == guid)
}

fn is_review_done(outcome: ReviewOutcome) -> impl Fn(&ServerEvent) -> bool {
    move |event| matches!(event, ServerEvent::ReviewDone { status } if *status == outcome)
}

/// Spawns a callback receiver returning `status`; captures the scoring key
/// header and JSON body of each POST.
async fn callback_server(
    status: StatusCode,
) -> (String, mpsc::UnboundedReceiver<(String, serde_json::Value)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().route(
        "/answer",
        post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| {
            let tx = tx.clone();
            async move {
                let key = headers
                    .get("x-scoring-key")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let _ = tx.send((key, body));
                status
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let uri = format!("http://{}/answer", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (uri, rx)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_submit_assign_score() {
    let rig = rig().await;
    let (answer_uri, mut callbacks) = callback_server(StatusCode::OK).await;

    let mut r1 = connect(&rig, "R1").await;

    let accepted = rig
        .conversations
        .new_conversation(review("G1", &answer_uri))
        .await
        .unwrap();
    assert!(accepted);

    // R1 sees the assignment before any status update marks it in review.
    let update = expect_event(&mut r1, Some("G1"), is_review_update("G1")).await;
    let ServerEvent::ReviewUpdate(details) = update else {
        unreachable!()
    };
    assert_eq!(details.title, "title");
    assert_eq!(details.goal, "goal");
    assert!(details.picture.is_some());

    // The following broadcast shows the item under review.
    let status = expect_event(&mut r1, None, |e| {
        matches!(e, ServerEvent::StatusUpdate(s)
            if s.conversation_queue.iter().any(|q| q.guid == "G1" && q.in_review))
    })
    .await;
    let ServerEvent::StatusUpdate(status) = status else {
        unreachable!()
    };
    assert_eq!(status.session_count, 1);

    rig.conversations
        .score(
            ScoreRequest {
                conversation_id: "G1".to_string(),
                passed: true,
                custom_message: "ok".to_string(),
            },
            "R1",
        )
        .await
        .unwrap();

    expect_event(&mut r1, None, is_review_done(ReviewOutcome::Done)).await;
    expect_event(&mut r1, None, |e| {
        matches!(e, ServerEvent::StatusUpdate(s) if s.conversation_queue.is_empty())
    })
    .await;

    // Result delivered with the shared secret.
    let (key, body) = timeout(Duration::from_secs(2), callbacks.recv())
        .await
        .expect("callback never fired")
        .unwrap();
    assert_eq!(key, TEST_SCORING_KEY);
    assert_eq!(body["passed"], true);
    assert_eq!(body["custom_message"], "ok");

    // Everything about G1 is gone.
    assert!(rig.model.get_conversation("G1").await.unwrap().is_none());
    assert!(rig.model.get_queue().await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_submission_is_refused() {
    let rig = rig().await;

    let first = rig
        .conversations
        .new_conversation(review("G1", "http://127.0.0.1:1/answer"))
        .await
        .unwrap();
    let second = rig
        .conversations
        .new_conversation(review("G1", "http://127.0.0.1:1/answer"))
        .await
        .unwrap();

    assert!(first);
    assert!(!second);
    assert_eq!(rig.model.get_queue().await.unwrap().len(), 1);
}

#[tokio::test]
async fn two_reviewers_three_items() {
    let rig = rig().await;
    let (answer_uri, mut callbacks) = callback_server(StatusCode::OK).await;

    let mut r1 = connect(&rig, "R1").await;
    let mut r2 = connect(&rig, "R2").await;

    for guid in ["G1", "G2", "G3"] {
        assert!(rig
            .conversations
            .new_conversation(review(guid, &answer_uri))
            .await
            .unwrap());
    }

    // First waiting reviewer takes the first item, and so on.
    expect_event(&mut r1, Some("G1"), is_review_update("G1")).await;
    expect_event(&mut r2, Some("G2"), is_review_update("G2")).await;

    let queue = rig.model.get_queue().await.unwrap();
    assert_eq!(queue.len(), 3);
    assert_eq!(queue[2].guid, "G3");
    assert!(!queue[2].is_assigned());

    // Scoring frees R1, who immediately receives the backlog item.
    rig.conversations
        .score(
            ScoreRequest {
                conversation_id: "G1".to_string(),
                passed: false,
                custom_message: "nope".to_string(),
            },
            "R1",
        )
        .await
        .unwrap();

    expect_event(&mut r1, None, is_review_done(ReviewOutcome::Done)).await;
    expect_event(&mut r1, None, is_review_update("G3")).await;
    callbacks.recv().await.unwrap();

    let queue = rig.model.get_queue().await.unwrap();
    let summary: Vec<(&str, &str)> = queue
        .iter()
        .map(|e| (e.guid.as_str(), e.assigned_to.as_str()))
        .collect();
    assert_eq!(summary, vec![("G2", "R2"), ("G3", "R1")]);
}

#[tokio::test]
async fn callback_failure_does_not_roll_back() {
    let rig = rig().await;
    let (answer_uri, mut callbacks) = callback_server(StatusCode::INTERNAL_SERVER_ERROR).await;

    let mut r1 = connect(&rig, "R1").await;
    rig.conversations
        .new_conversation(review("G1", &answer_uri))
        .await
        .unwrap();
    expect_event(&mut r1, Some("G1"), is_review_update("G1")).await;

    let result = rig
        .conversations
        .score(
            ScoreRequest {
                conversation_id: "G1".to_string(),
                passed: true,
                custom_message: "ok".to_string(),
            },
            "R1",
        )
        .await;

    // The callback error surfaces, but the review is already finished.
    assert!(matches!(
        result,
        Err(dispatch_server::Error::Callback { .. })
    ));
    callbacks.recv().await.unwrap();
    expect_event(&mut r1, None, is_review_done(ReviewOutcome::Done)).await;
    assert!(rig.model.get_queue().await.unwrap().is_empty());
    assert!(rig.model.get_conversation("G1").await.unwrap().is_none());

    // R1 went back to the pool despite the failure.
    assert_eq!(
        rig.sessions.pop_from_pool().await.unwrap().as_deref(),
        Some("R1")
    );
}

#[tokio::test]
async fn score_with_mismatched_reviewer_is_ignored() {
    let rig = rig().await;
    let (answer_uri, _callbacks) = callback_server(StatusCode::OK).await;

    let mut r1 = connect(&rig, "R1").await;
    rig.conversations
        .new_conversation(review("G1", &answer_uri))
        .await
        .unwrap();
    expect_event(&mut r1, Some("G1"), is_review_update("G1")).await;

    // Somebody else claims to have reviewed G1.
    rig.conversations
        .score(
            ScoreRequest {
                conversation_id: "G1".to_string(),
                passed: true,
                custom_message: "ok".to_string(),
            },
            "R2",
        )
        .await
        .unwrap();

    let queue = rig.model.get_queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].assigned_to, "R1");
    assert!(rig.model.get_conversation("G1").await.unwrap().is_some());
}

#[tokio::test]
async fn dead_reviewer_frees_work_for_the_next_one() {
    let rig = rig().await;
    let (answer_uri, _callbacks) = callback_server(StatusCode::OK).await;

    let mut r1 = connect(&rig, "R1").await;
    rig.conversations
        .new_conversation(review("G1", &answer_uri))
        .await
        .unwrap();
    expect_event(&mut r1, Some("G1"), is_review_update("G1")).await;

    // R1's heartbeats stop; the sweeper reaps the session.
    rig.kv.del(&keys::liveness("R1")).await.unwrap();
    let dead = rig.connections.dead_connections().await.unwrap();
    assert_eq!(dead, vec!["R1".to_string()]);
    rig.conversations.dead_connections(&dead).await.unwrap();

    // R1's socket is told to close.
    loop {
        match next_outbound(&mut r1).await {
            Outbound::Close => break,
            Outbound::Event(_) => {}
        }
    }

    // The work item is queued again, unassigned.
    let queue = rig.model.get_queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert!(!queue[0].is_assigned());

    // A fresh reviewer picks it up straight away.
    let mut r2 = connect(&rig, "R2").await;
    expect_event(&mut r2, None, is_review_update("G1")).await;
    assert_eq!(
        rig.model.get_assignment("R2").await.unwrap().as_deref(),
        Some("G1")
    );
}

#[tokio::test]
async fn expired_assignment_requeues_and_reassigns() {
    let rig = rig().await;
    let (answer_uri, _callbacks) = callback_server(StatusCode::OK).await;

    let mut r1 = connect(&rig, "R1").await;
    rig.conversations
        .new_conversation(review("G1", &answer_uri))
        .await
        .unwrap();
    expect_event(&mut r1, Some("G1"), is_review_update("G1")).await;

    // The assignment clock runs out while R1 is still alive.
    rig.kv.del(&keys::assignment_ttl("R1")).await.unwrap();
    rig.conversations.dead_reviews().await.unwrap();

    expect_event(&mut r1, None, is_review_done(ReviewOutcome::Expired)).await;
    // R1 is the only reviewer, so the item comes straight back to them.
    expect_event(&mut r1, None, is_review_update("G1")).await;
    assert_eq!(
        rig.model.get_assignment("R1").await.unwrap().as_deref(),
        Some("G1")
    );
}

#[tokio::test]
async fn heartbeat_reports_time_without_extending_it() {
    let rig = rig().await;
    let (answer_uri, _callbacks) = callback_server(StatusCode::OK).await;

    let mut r1 = connect(&rig, "R1").await;
    rig.conversations
        .new_conversation(review("G1", &answer_uri))
        .await
        .unwrap();
    expect_event(&mut r1, Some("G1"), is_review_update("G1")).await;

    // Pin the clock to a known value.
    rig.kv.expire(&keys::assignment_ttl("R1"), 30).await.unwrap();

    rig.connections.ping("R1").await.unwrap();
    let time = expect_event(&mut r1, None, |e| matches!(e, ServerEvent::TimeUpdate(_))).await;
    let ServerEvent::TimeUpdate(reported) = time else {
        unreachable!()
    };
    let reported: i64 = reported.parse().unwrap();
    assert!(reported <= 30, "heartbeat must not extend the clock");
    assert!(reported >= 25);

    // An activity signal does extend it.
    rig.connections.activity_signal("R1").await.unwrap();
    let time = expect_event(&mut r1, None, |e| {
        matches!(e, ServerEvent::TimeUpdate(t) if t.parse::<i64>().unwrap() > 30)
    })
    .await;
    let ServerEvent::TimeUpdate(extended) = time else {
        unreachable!()
    };
    let extended: i64 = extended.parse().unwrap();
    assert!(extended > 30 && extended <= 36);
}
