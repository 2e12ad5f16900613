//! The shared review queue and its assignments.
//!
//! The queue is a KV list of JSON entries mutated by read-modify-write
//! (scan, rewrite one index, write back), so every mutating operation here
//! holds the distributed operation lock. The lock is always released before
//! returning; callers emit socket events only after that.

use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::lock::DistLock;
use crate::realtime::protocol::{QueueEntry, ReviewRequest};
use crate::store::{keys, Kv};

/// Seconds a reviewer has to finish a review once assigned.
pub const ASSIGN_TTL: i64 = 60;

/// Seconds added to the assignment clock per activity signal.
pub const ACTIVITY_BONUS: i64 = 6;

#[derive(Clone)]
pub struct ConversationModel {
    kv: Kv,
    lock: Arc<DistLock>,
}

impl ConversationModel {
    pub fn new(kv: Kv, lock: Arc<DistLock>) -> Self {
        Self { kv, lock }
    }

    /// Appends a work item to the queue, allocating its monotonic id.
    pub async fn push(&self, mut entry: QueueEntry) -> Result<i64> {
        let guard = self.lock.lock().await?;
        let res = self.push_locked(&mut entry).await;
        self.lock.unlock(guard).await;
        res
    }

    async fn push_locked(&self, entry: &mut QueueEntry) -> Result<i64> {
        let id = self.kv.incr(keys::CONVERSATION_COUNT).await?;
        entry.id = id;
        self.kv
            .rpush(keys::CONVERSATION_QUEUE, &serde_json::to_string(entry)?)
            .await?;
        Ok(id)
    }

    /// Stores the details blob keyed by the item's guid.
    pub async fn add(&self, details: &ReviewRequest) -> Result<()> {
        let blob = serde_json::to_string(details)?;
        let guard = self.lock.lock().await?;
        let res = self
            .kv
            .set_string(&keys::conversation(&details.conversation_id), &blob)
            .await;
        self.lock.unlock(guard).await;
        res
    }

    /// Remaining seconds on a reviewer's assignment clock; 0 when absent.
    pub async fn get_time(&self, sid: &str) -> Result<i64> {
        let ttl = self.kv.ttl_secs(&keys::assignment_ttl(sid)).await?;
        Ok(ttl.max(0))
    }

    /// Adds the activity bonus to the assignment clock, clamped at
    /// [`ASSIGN_TTL`]. Returns the new remaining time, or 0 when the clock
    /// has already expired.
    pub async fn earn_bonus(&self, sid: &str) -> Result<i64> {
        let guard = self.lock.lock().await?;
        let res = self.earn_bonus_locked(sid).await;
        self.lock.unlock(guard).await;
        res
    }

    async fn earn_bonus_locked(&self, sid: &str) -> Result<i64> {
        let key = keys::assignment_ttl(sid);
        let ttl = self.kv.ttl_secs(&key).await?;
        if ttl < 0 {
            return Ok(0);
        }
        let new_ttl = (ttl + ACTIVITY_BONUS).min(ASSIGN_TTL);
        self.kv.expire(&key, new_ttl).await?;
        Ok(new_ttl)
    }

    /// Assigns the earliest unassigned queue entry to `sid`. First-fit over
    /// insertion order, never jumping an unassigned entry.
    pub async fn assign_free(&self, sid: &str) -> Result<Option<String>> {
        let guard = self.lock.lock().await?;
        let res = self.assign_free_locked(sid).await;
        self.lock.unlock(guard).await;
        res
    }

    async fn assign_free_locked(&self, sid: &str) -> Result<Option<String>> {
        let queue = self.queue_locked().await?;
        for (i, mut entry) in queue.into_iter().enumerate() {
            if entry.is_assigned() {
                continue;
            }
            entry.assigned_to = sid.to_string();
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lset(
                    self.kv.key(keys::CONVERSATION_QUEUE),
                    i as isize,
                    serde_json::to_string(&entry)?,
                )
                .hset(self.kv.key(keys::CONVERSATION_ASSIGNMENT), sid, &entry.guid)
                .set_ex(
                    self.kv.key(&keys::assignment_ttl(sid)),
                    &entry.guid,
                    ASSIGN_TTL as u64,
                );
            let _: ((), i64, ()) = self.kv.exec(&pipe).await?;
            return Ok(Some(entry.guid));
        }
        Ok(None)
    }

    /// The guid currently assigned to a reviewer, if any.
    pub async fn get_assignment(&self, sid: &str) -> Result<Option<String>> {
        let guard = self.lock.lock().await?;
        let res = self.kv.hget(keys::CONVERSATION_ASSIGNMENT, sid).await;
        self.lock.unlock(guard).await;
        res
    }

    /// Clears assignments held by any of the given reviewers. Entries keep
    /// their queue position.
    pub async fn unassign_review(&self, sids: &[String]) -> Result<()> {
        let guard = self.lock.lock().await?;
        let res = self.unassign_review_locked(sids).await;
        self.lock.unlock(guard).await;
        res
    }

    async fn unassign_review_locked(&self, sids: &[String]) -> Result<()> {
        let queue = self.queue_locked().await?;
        for (i, mut entry) in queue.into_iter().enumerate() {
            if !entry.is_assigned() || !sids.contains(&entry.assigned_to) {
                continue;
            }
            let sid = std::mem::take(&mut entry.assigned_to);
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lset(
                    self.kv.key(keys::CONVERSATION_QUEUE),
                    i as isize,
                    serde_json::to_string(&entry)?,
                )
                .hdel(self.kv.key(keys::CONVERSATION_ASSIGNMENT), &sid)
                .del(self.kv.key(&keys::assignment_ttl(&sid)));
            let _: ((), i64, i64) = self.kv.exec(&pipe).await?;
        }
        Ok(())
    }

    /// Reverts every assigned entry whose assignment clock has expired.
    /// Returns the reviewers that lost their assignment. Idempotent: once an
    /// entry is reverted its TTL key is gone and it no longer matches.
    pub async fn unassign_expired(&self) -> Result<Vec<String>> {
        let guard = self.lock.lock().await?;
        let res = self.unassign_expired_locked().await;
        self.lock.unlock(guard).await;
        res
    }

    async fn unassign_expired_locked(&self) -> Result<Vec<String>> {
        let mut expired = Vec::new();
        let queue = self.queue_locked().await?;
        for (i, mut entry) in queue.into_iter().enumerate() {
            if !entry.is_assigned() {
                continue;
            }
            let ttl = self
                .kv
                .ttl_secs(&keys::assignment_ttl(&entry.assigned_to))
                .await?;
            if ttl >= 0 {
                continue;
            }
            let sid = std::mem::take(&mut entry.assigned_to);
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lset(
                    self.kv.key(keys::CONVERSATION_QUEUE),
                    i as isize,
                    serde_json::to_string(&entry)?,
                )
                .hdel(self.kv.key(keys::CONVERSATION_ASSIGNMENT), &sid)
                .del(self.kv.key(&keys::assignment_ttl(&sid)));
            let _: ((), i64, i64) = self.kv.exec(&pipe).await?;
            expired.push(sid);
        }
        Ok(expired)
    }

    /// Removes a scored work item: queue entry, details blob, assignment
    /// map entry and TTL key, in one pipeline.
    pub async fn remove(&self, guid: &str, sid: &str) -> Result<()> {
        let guard = self.lock.lock().await?;
        let res = self.remove_locked(guid, sid).await;
        self.lock.unlock(guard).await;
        res
    }

    async fn remove_locked(&self, guid: &str, sid: &str) -> Result<()> {
        let queue = self.queue_locked().await?;
        for entry in queue {
            if entry.guid != guid {
                continue;
            }
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(
                    self.kv.key(keys::CONVERSATION_QUEUE),
                    0,
                    serde_json::to_string(&entry)?,
                )
                .del(self.kv.key(&keys::conversation(guid)))
                .hdel(self.kv.key(keys::CONVERSATION_ASSIGNMENT), sid)
                .del(self.kv.key(&keys::assignment_ttl(sid)));
            let _: (i64, i64, i64, i64) = self.kv.exec(&pipe).await?;
            break;
        }
        Ok(())
    }

    pub async fn get_conversation(&self, guid: &str) -> Result<Option<ReviewRequest>> {
        let guard = self.lock.lock().await?;
        let res = self.kv.get_string(&keys::conversation(guid)).await;
        self.lock.unlock(guard).await;
        match res? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Snapshot of the full queue in FIFO order.
    pub async fn get_queue(&self) -> Result<Vec<QueueEntry>> {
        let guard = self.lock.lock().await?;
        let res = self.queue_locked().await;
        self.lock.unlock(guard).await;
        res
    }

    async fn queue_locked(&self) -> Result<Vec<QueueEntry>> {
        let raw = self.kv.lrange(keys::CONVERSATION_QUEUE).await?;
        let mut queue = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str::<QueueEntry>(&item) {
                Ok(entry) => queue.push(entry),
                // A corrupt entry would wedge every scan; skip it loudly.
                Err(e) => warn!(error = %e, raw = %item, "Dropping undecodable queue entry"),
            }
        }
        Ok(queue)
    }
}
