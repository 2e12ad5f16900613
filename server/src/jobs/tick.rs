//! Periodic sweeper: reaps expired assignments and dead reviewer sessions.
//!
//! Runs on every worker but acts only on the current sweeper leader, so the
//! reconciliation logic executes on exactly one process per tick. Every
//! step is idempotent; a failed tick is logged and the next one catches up.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::TICK_INTERVAL;
use crate::controller::{ConnectionController, ConversationController};
use crate::lock::DistLock;

pub async fn run_tick_worker(
    lock: Arc<DistLock>,
    connections: Arc<ConnectionController>,
    conversations: Arc<ConversationController>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!("Review sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !lock.is_leader() {
                    continue;
                }
                tick(&connections, &conversations).await;
            }
            _ = shutdown.cancelled() => {
                info!("Review sweeper shutting down");
                break;
            }
        }
    }
}

async fn tick(connections: &ConnectionController, conversations: &ConversationController) {
    if let Err(e) = conversations.dead_reviews().await {
        error!(error = %e, "Expired review sweep failed");
    }

    match connections.dead_connections().await {
        Ok(dead) if !dead.is_empty() => {
            info!(dead = ?dead, "Releasing assignments of dead reviewers");
            if let Err(e) = conversations.dead_connections(&dead).await {
                error!(error = %e, "Dead reviewer reassignment failed");
            }
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "Dead session sweep failed"),
    }
}
