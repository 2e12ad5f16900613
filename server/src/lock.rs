//! Distributed lock over the KV store.
//!
//! Two facets share one named lock resource:
//!
//! * an **operation lock** serializing the multi-step queue rewrites
//!   (read-list, mutate-entry, write-back) across worker processes, and
//! * a **leader key** electing the single worker that runs the periodic
//!   sweeper tick.
//!
//! Both are plain `SET NX PX` keys released (or extended) through
//! compare-owner Lua scripts, so a crashed holder is bounded by the TTL and
//! a slow holder can never delete a lock it no longer owns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::Script;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::store::Kv;

/// TTL on the operation lock. Queue rewrites finish in milliseconds; the TTL
/// only bounds the damage of a worker dying mid-section.
const OP_TTL_MS: u64 = 10_000;
const OP_RETRY: Duration = Duration::from_millis(50);

const LEADER_TTL_MS: u64 = 15_000;
const LEADER_RENEW_INTERVAL: Duration = Duration::from_secs(5);

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Proof of holding the operation lock. Must be handed back to
/// [`DistLock::unlock`]; dropping it without unlocking leaves the lock to
/// expire via its TTL.
#[must_use]
pub struct OpGuard {
    token: String,
}

pub struct DistLock {
    kv: Kv,
    op_key: String,
    leader_key: String,
    /// This process's identity on the leader key.
    token: String,
    leader: AtomicBool,
    cancel: CancellationToken,
    release: Script,
    extend: Script,
}

impl DistLock {
    pub fn new(kv: Kv, name: &str) -> Arc<Self> {
        Arc::new(Self {
            kv,
            op_key: format!("{name}.op"),
            leader_key: format!("{name}.leader"),
            token: Uuid::new_v4().to_string(),
            leader: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            release: Script::new(RELEASE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
        })
    }

    // -- Operation lock ----------------------------------------------------

    /// Blocks until the operation lock is owned by this caller.
    pub async fn lock(&self) -> Result<OpGuard> {
        let token = Uuid::new_v4().to_string();
        loop {
            if self.kv.set_nx_px(&self.op_key, &token, OP_TTL_MS).await? {
                return Ok(OpGuard { token });
            }
            tokio::time::sleep(OP_RETRY).await;
        }
    }

    /// Releases the operation lock. A failed release is logged rather than
    /// propagated; the TTL reclaims the lock either way.
    pub async fn unlock(&self, guard: OpGuard) {
        match self
            .kv
            .script_i64(&self.release, &self.op_key, &guard.token)
            .await
        {
            Ok(1) => {}
            Ok(_) => warn!("Operation lock already expired before release"),
            Err(e) => warn!(error = %e, "Failed to release operation lock"),
        }
    }

    // -- Leader facet ------------------------------------------------------

    /// Registers this worker for leader election and starts the renewal
    /// loop. Call once at startup; returns when the loop is running.
    pub fn start(self: Arc<Self>, concurrency: usize) {
        info!(concurrency, "Starting distributed lock worker");
        tokio::spawn(async move { self.run_leader_loop().await });
    }

    /// Relinquishes leadership and stops the renewal loop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Relaxed)
    }

    async fn run_leader_loop(&self) {
        let mut ticker = tokio::time::interval(LEADER_RENEW_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_leader() {
                        self.renew_leadership().await;
                    } else {
                        self.try_acquire_leadership().await;
                    }
                }
                _ = self.cancel.cancelled() => {
                    if self.leader.swap(false, Ordering::Relaxed) {
                        if let Err(e) = self
                            .kv
                            .script_i64(&self.release, &self.leader_key, &self.token)
                            .await
                        {
                            warn!(error = %e, "Failed to release leader key on shutdown");
                        }
                    }
                    info!("Distributed lock worker shutting down");
                    break;
                }
            }
        }
    }

    async fn try_acquire_leadership(&self) {
        match self
            .kv
            .set_nx_px(&self.leader_key, &self.token, LEADER_TTL_MS)
            .await
        {
            Ok(true) => {
                self.leader.store(true, Ordering::Relaxed);
                info!("Acquired sweeper leadership");
            }
            Ok(false) => debug!("Leader key held by another worker"),
            Err(e) => warn!(error = %e, "Leader acquisition attempt failed"),
        }
    }

    async fn renew_leadership(&self) {
        let ttl = LEADER_TTL_MS.to_string();
        match self
            .kv
            .script_i64_2(&self.extend, &self.leader_key, &self.token, &ttl)
            .await
        {
            Ok(1) => {}
            Ok(_) => {
                self.leader.store(false, Ordering::Relaxed);
                warn!("Sweeper leadership lost");
            }
            Err(e) => warn!(error = %e, "Leader renewal attempt failed"),
        }
    }
}
