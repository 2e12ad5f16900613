//! Reviewer session state: liveness keys, the global session set, the
//! authoritative counter and the waiting pool.
//!
//! Every write here is a single atomic command or pipeline, so no lock is
//! needed. A crash mid-pipeline can leave stale set or pool entries; the
//! next [`ConnectionModel::integrity`] sweep removes them.

use crate::error::Result;
use crate::store::{keys, Kv};

/// Liveness TTL. Two missed heartbeats at the recommended ~3 s cadence and
/// the session is gone on the next sweep.
pub const HEARTBEAT_TTL: u64 = 7;

#[derive(Clone)]
pub struct ConnectionModel {
    kv: Kv,
}

impl ConnectionModel {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    /// Registers a new session: bump the counter, arm the liveness key, join
    /// the session set and the waiting pool. Returns the new session count.
    pub async fn increment(&self, sid: &str) -> Result<i64> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .incr(self.kv.key(keys::CONNECTION_COUNT), 1)
            .set_ex(self.kv.key(&keys::liveness(sid)), 1, HEARTBEAT_TTL)
            .hset(self.kv.key(keys::CONNECTION_SET), sid, 1)
            .lpush(self.kv.key(keys::CONNECTION_POOL), sid);
        let (count, _, _, _): (i64, (), i64, i64) = self.kv.exec(&pipe).await?;
        Ok(count)
    }

    /// Refreshes liveness on heartbeat and re-asserts set membership. Does
    /// not touch the pool.
    pub async fn extend(&self, sid: &str) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set_ex(self.kv.key(&keys::liveness(sid)), 1, HEARTBEAT_TTL)
            .hset(self.kv.key(keys::CONNECTION_SET), sid, 1);
        let _: ((), i64) = self.kv.exec(&pipe).await?;
        Ok(())
    }

    pub async fn is_alive(&self, sid: &str) -> Result<bool> {
        self.kv.exists(&keys::liveness(sid)).await
    }

    pub async fn get_count(&self) -> Result<i64> {
        Ok(self.kv.get_i64(keys::CONNECTION_COUNT).await?.unwrap_or(0))
    }

    /// Takes the reviewer that has been waiting longest (pushes go to the
    /// front, pops come from the tail).
    pub async fn pop_from_pool(&self) -> Result<Option<String>> {
        self.kv.rpop(keys::CONNECTION_POOL).await
    }

    /// Normal reentry: the reviewer becomes the most recently available.
    pub async fn add_to_pool(&self, sid: &str) -> Result<()> {
        self.kv.lpush(keys::CONNECTION_POOL, sid).await
    }

    /// Rollback reentry: the reviewer goes back to the head of the pop
    /// order, keeping the position it had before a failed pick.
    pub async fn add_to_pool_front(&self, sid: &str) -> Result<()> {
        self.kv.rpush(keys::CONNECTION_POOL, sid).await
    }

    /// Reconciles the session set against liveness keys: sessions whose
    /// liveness expired are dropped from the set and the pool, and the
    /// counter is recomputed. Returns `(changed, new_count, removed_sids)`.
    ///
    /// Safe without a lock: per-item removal is conditional on the liveness
    /// key and all writes are single commands.
    pub async fn integrity(&self) -> Result<(bool, i64, Vec<String>)> {
        let members = self.kv.hgetall(keys::CONNECTION_SET).await?;
        if members.is_empty() {
            self.kv.set_i64(keys::CONNECTION_COUNT, 0).await?;
            return Ok((false, 0, Vec::new()));
        }

        let mut count = members.len() as i64;
        let mut changed = false;
        let mut removed = Vec::new();
        for sid in members.keys() {
            if self.kv.exists(&keys::liveness(sid)).await? {
                continue;
            }
            self.kv.hdel(keys::CONNECTION_SET, sid).await?;
            self.kv.lrem(keys::CONNECTION_POOL, sid).await?;
            removed.push(sid.clone());
            count -= 1;
            changed = true;
        }

        self.kv.set_i64(keys::CONNECTION_COUNT, count).await?;
        Ok((changed, count, removed))
    }
}
