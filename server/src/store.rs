//! Redis driver for all shared dispatcher state.
//!
//! Every worker process talks to the same Redis instance; this module is the
//! only place that issues commands. [`Kv`] is a thin, typed adapter -- it
//! contains no scheduling logic. All intelligence (queue rewrites, liveness
//! sweeps, assignment TTLs) lives in the models.
//!
//! # Key Schema
//!
//! All keys share a configurable prefix (`review` by default). Tests use a
//! unique prefix per run for isolation.
//!
//! | Key | Type | Purpose |
//! |-----|------|---------|
//! | `{prefix}:connection.count` | String (int) | Authoritative reviewer count |
//! | `{prefix}:connection.set` | Hash | Membership set of known sessions |
//! | `{prefix}:connection.{sid}` | String, TTL | Reviewer liveness key |
//! | `{prefix}:connection.pool` | List | Waiting pool of idle reviewers |
//! | `{prefix}:conversation.queue` | List (JSON) | FIFO review queue |
//! | `{prefix}:conversation.count` | String (int) | Monotonic work-item id |
//! | `{prefix}:conversation.assignment` | Hash | sid -> guid assignment map |
//! | `{prefix}:conversation.{guid}` | String (JSON) | Review details blob |
//! | `{prefix}:conversation.key.ttl.{sid}` | String, TTL | Assignment clock |
//! | `{prefix}:lock.op` | String, TTL | Queue-rewrite mutex |
//! | `{prefix}:lock.leader` | String, TTL | Sweeper leader key |
//! | `{prefix}:events` | Pub/sub channel | Cross-worker event fan-out |

use std::collections::HashMap;
use std::num::NonZeroUsize;

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

use crate::error::Result;

/// Key suffixes, composed under the store prefix.
pub mod keys {
    pub const CONNECTION_COUNT: &str = "connection.count";
    pub const CONNECTION_SET: &str = "connection.set";
    pub const CONNECTION_POOL: &str = "connection.pool";

    pub const CONVERSATION_QUEUE: &str = "conversation.queue";
    pub const CONVERSATION_COUNT: &str = "conversation.count";
    pub const CONVERSATION_ASSIGNMENT: &str = "conversation.assignment";

    pub const LOCK_NAME: &str = "lock";
    pub const EVENT_CHANNEL: &str = "events";

    /// Per-session liveness key.
    pub fn liveness(sid: &str) -> String {
        format!("connection.{sid}")
    }

    /// Review details blob for a work item.
    pub fn conversation(guid: &str) -> String {
        format!("conversation.{guid}")
    }

    /// Assignment TTL clock for a reviewer.
    pub fn assignment_ttl(sid: &str) -> String {
        format!("conversation.key.ttl.{sid}")
    }
}

// ---------------------------------------------------------------------------
// Kv
// ---------------------------------------------------------------------------

/// Cloneable handle to the shared KV store.
#[derive(Clone)]
pub struct Kv {
    client: redis::Client,
    conn: MultiplexedConnection,
    prefix: String,
}

impl Kv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            conn,
            prefix: "review".to_string(),
        })
    }

    /// Sets a custom key prefix (builder pattern). Tests give every run a
    /// unique prefix so they do not interfere with each other.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Full key under this store's prefix. Public so callers composing raw
    /// pipelines can address the same keyspace.
    pub fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    /// The underlying client, for connections the multiplexed handle cannot
    /// serve (pub/sub subscriptions).
    pub fn client(&self) -> redis::Client {
        self.client.clone()
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    pub async fn ping(&self) -> Result<()> {
        let _: () = redis::cmd("PING").query_async(&mut self.conn()).await?;
        Ok(())
    }

    // -- Strings and counters ----------------------------------------------

    pub async fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.conn().get(self.key(key)).await?)
    }

    pub async fn set_i64(&self, key: &str, value: i64) -> Result<()> {
        Ok(self.conn().set(self.key(key), value).await?)
    }

    pub async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.conn().get(self.key(key)).await?)
    }

    pub async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        Ok(self.conn().set(self.key(key), value).await?)
    }

    pub async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> Result<()> {
        Ok(self.conn().set_ex(self.key(key), value, seconds).await?)
    }

    /// `SET key value NX PX millis`; true when the key was set.
    pub async fn set_nx_px(&self, key: &str, value: &str, millis: u64) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        Ok(self.conn().incr(self.key(key), 1).await?)
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.conn().exists(self.key(key)).await?)
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        Ok(self.conn().del(self.key(key)).await?)
    }

    // -- TTLs --------------------------------------------------------------

    /// Remaining TTL in seconds. Redis semantics are preserved: -2 when the
    /// key is absent, -1 when it has no expiry.
    pub async fn ttl_secs(&self, key: &str) -> Result<i64> {
        Ok(self.conn().ttl(self.key(key)).await?)
    }

    pub async fn expire(&self, key: &str, seconds: i64) -> Result<bool> {
        Ok(self.conn().expire(self.key(key), seconds).await?)
    }

    // -- Hashes ------------------------------------------------------------

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: i64 = self.conn().hset(self.key(key), field, value).await?;
        Ok(())
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.conn().hget(self.key(key), field).await?)
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let _: i64 = self.conn().hdel(self.key(key), field).await?;
        Ok(())
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.conn().hgetall(self.key(key)).await?)
    }

    // -- Lists -------------------------------------------------------------

    pub async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let _: i64 = self.conn().lpush(self.key(key), value).await?;
        Ok(())
    }

    pub async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let _: i64 = self.conn().rpush(self.key(key), value).await?;
        Ok(())
    }

    pub async fn rpop(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn()
            .rpop(self.key(key), None::<NonZeroUsize>)
            .await?)
    }

    pub async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.conn().lrange(self.key(key), 0, -1).await?)
    }

    pub async fn lset(&self, key: &str, index: isize, value: &str) -> Result<()> {
        Ok(self.conn().lset(self.key(key), index, value).await?)
    }

    /// Removes all occurrences of `value` from the list.
    pub async fn lrem(&self, key: &str, value: &str) -> Result<i64> {
        Ok(self.conn().lrem(self.key(key), 0, value).await?)
    }

    // -- Pipelines, scripts, pub/sub ---------------------------------------

    /// Executes a pipeline. Callers build keys with [`Kv::key`].
    pub async fn exec<T: redis::FromRedisValue>(&self, pipe: &redis::Pipeline) -> Result<T> {
        Ok(pipe.query_async(&mut self.conn()).await?)
    }

    /// Runs a Lua script against one prefixed key with one argument.
    pub async fn script_i64(&self, script: &Script, key: &str, arg: &str) -> Result<i64> {
        Ok(script
            .key(self.key(key))
            .arg(arg)
            .invoke_async(&mut self.conn())
            .await?)
    }

    /// Runs a Lua script against one prefixed key with two arguments.
    pub async fn script_i64_2(
        &self,
        script: &Script,
        key: &str,
        arg1: &str,
        arg2: &str,
    ) -> Result<i64> {
        Ok(script
            .key(self.key(key))
            .arg(arg1)
            .arg(arg2)
            .invoke_async(&mut self.conn())
            .await?)
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let _: i64 = self.conn().publish(self.key(channel), payload).await?;
        Ok(())
    }
}
