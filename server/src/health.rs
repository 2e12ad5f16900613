use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::store::Kv;

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    kv_store: bool,
}

/// Liveness probe - checks if the application is running
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Readiness probe - the service can only dispatch work while the KV store
/// is reachable.
pub async fn readiness(State(kv): State<Kv>) -> (StatusCode, Json<ReadinessResponse>) {
    let kv_ready = kv.ping().await.is_ok();
    let status = if kv_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready: kv_ready,
            kv_store: kv_ready,
        }),
    )
}
