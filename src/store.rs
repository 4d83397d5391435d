//! Coordination store client.
//!
//! Thin typed wrapper over the shared key/value store (redis). Every
//! cross-process concern in the crate — rate-limit windows, SMS codes,
//! usage-buffer lists, distributed locks — goes through this interface
//! and nothing else talks to redis directly.
//!
//! Compound check-then-act operations (compare-and-delete, increment
//! with TTL, read-and-trim, lock release) run as server-side Lua scripts
//! so they are atomic across worker processes.

use crate::logging::{log_debug, log_warn};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use thiserror::Error;
use tokio_stream::Stream;

/// Failures a store operation can produce.
///
/// Callers decide whether a failure is fatal or degrades gracefully:
/// the global rate limiter fails closed, the usage buffer falls back to
/// an in-process queue, the SMS service surfaces 503.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Store unreachable: network refusal, timeout, broken connection.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// Store reachable but the response was malformed for the operation.
    #[error("coordination store returned corrupt data: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_timeout() || err.is_connection_refusal() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Corrupt(err.to_string())
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// Atomic scripts. KEYS/ARGV layouts are documented inline; each script
// is the single authority for its compound operation.

/// GET key, compare to ARGV[1], DEL on match. Returns 1 iff consumed.
const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// INCR key; set TTL (ARGV[1] seconds) only when the key was created.
const INCR_WITH_TTL: &str = r#"
local value = redis.call('INCR', KEYS[1])
if value == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return value
"#;

/// LRANGE the first ARGV[1] items and LTRIM them off, atomically.
const READ_AND_TRIM: &str = r#"
local batch = redis.call('LRANGE', KEYS[1], 0, ARGV[1] - 1)
if #batch > 0 then
    redis.call('LTRIM', KEYS[1], #batch, -1)
end
return batch
"#;

/// DEL the lock key only if it still carries our holder token.
const RELEASE_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Typed client over the coordination store.
///
/// Cheap to clone; all clones share one multiplexed connection that
/// reconnects on failure.
#[derive(Clone)]
pub struct CoordinationStore {
    conn: ConnectionManager,
    client: redis::Client,
}

impl std::fmt::Debug for CoordinationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationStore").finish_non_exhaustive()
    }
}

impl CoordinationStore {
    /// Connect to the store at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the initial connection
    /// cannot be established.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid store url: {e}")))?;
        let conn = ConnectionManager::new(client.clone()).await?;
        log_debug!(url = url, "Coordination store connected");
        Ok(Self { conn, client })
    }

    // ------------------------------------------------------------------
    // Strings and counters
    // ------------------------------------------------------------------

    /// Store `value` under `key`, deleting automatically after `ttl`.
    /// Overwrites any existing value.
    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    /// Store `value` under `key` with `ttl` only if the key is absent.
    /// Returns `true` if the value was stored.
    pub async fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    /// Fetch the value under `key`, or `None`.
    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    /// Delete `key`. Missing keys are not an error.
    pub async fn del(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    /// Remaining TTL of `key` in seconds; `None` when the key is absent
    /// or carries no TTL.
    pub async fn ttl(&self, key: &str) -> StoreResult<Option<u64>> {
        let mut conn = self.conn.clone();
        let ttl: i64 = conn.ttl(key).await?;
        Ok(if ttl > 0 { Some(ttl as u64) } else { None })
    }

    /// Atomically delete `key` iff it currently holds `expected`.
    /// Returns `true` when the value was present, equal, and consumed.
    pub async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let consumed: i64 = redis::Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(consumed == 1)
    }

    /// Atomic increment; the TTL is applied only when the key is created,
    /// so the counter expires `ttl` after its first bump regardless of
    /// later traffic.
    pub async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::Script::new(INCR_WITH_TTL)
            .key(key)
            .arg(ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    /// Plain atomic increment.
    pub async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1).await?)
    }

    /// Plain atomic decrement.
    pub async fn decr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, -1).await?)
    }

    /// Set a TTL on an existing key.
    pub async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sorted sets (rate-limiter sliding windows)
    // ------------------------------------------------------------------

    /// Add `member` with `score` to the sorted set at `key`.
    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    /// Remove `member` from the sorted set at `key`.
    pub async fn zrem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    /// Remove members with scores in `[min, max]`.
    pub async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.zrembyscore::<_, _, _, ()>(key, min, max).await?;
        Ok(())
    }

    /// Count members with scores in `[min, max]`.
    pub async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.zcount(key, min, max).await?)
    }

    /// Cardinality of the sorted set.
    pub async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(key).await?)
    }

    /// Members with scores, ascending, in index range `[start, stop]`.
    pub async fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        Ok(conn.zrange_withscores(key, start, stop).await?)
    }

    // ------------------------------------------------------------------
    // Lists (token-usage buffer)
    // ------------------------------------------------------------------

    /// Append `value` to the list at `key`. Returns the new length.
    pub async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.rpush(key, value).await?)
    }

    /// Push `values` back onto the front of the list, preserving their
    /// relative order. Used to restore a failed flush batch.
    pub async fn lpush_front(&self, key: &str, values: &[String]) -> StoreResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        // LPUSH reverses its arguments, so feed them reversed.
        let reversed: Vec<&String> = values.iter().rev().collect();
        conn.lpush::<_, _, ()>(key, reversed).await?;
        Ok(())
    }

    /// Elements in index range `[start, stop]`.
    pub async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, start, stop).await?)
    }

    /// Trim the list to index range `[start, stop]`.
    pub async fn ltrim(&self, key: &str, start: isize, stop: isize) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.ltrim::<_, ()>(key, start, stop).await?;
        Ok(())
    }

    /// Length of the list.
    pub async fn llen(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(key).await?)
    }

    /// Atomically read up to `max` items off the front of the list and
    /// trim them away. The batch is removed exactly once even with
    /// multiple flusher processes racing.
    pub async fn read_and_trim(&self, key: &str, max: usize) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let batch: Vec<String> = redis::Script::new(READ_AND_TRIM)
            .key(key)
            .arg(max)
            .invoke_async(&mut conn)
            .await?;
        Ok(batch)
    }

    // ------------------------------------------------------------------
    // Hashes (aggregate counters, session activity)
    // ------------------------------------------------------------------

    /// Set `field` of the hash at `key`.
    pub async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    /// Fetch `field` of the hash at `key`.
    pub async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    /// Atomically add `delta` to `field` of the hash at `key`.
    pub async fn hincrby(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.hincr(key, field, delta).await?)
    }

    // ------------------------------------------------------------------
    // Distributed lock
    // ------------------------------------------------------------------

    /// Try to acquire the mutual-exclusion lease at `lock:<name>`.
    ///
    /// The holder is identified by a random token, so a crashed holder's
    /// lease simply expires and a stale release can never delete another
    /// holder's lock. Returns `None` when someone else holds the lease.
    pub async fn acquire_lock(&self, name: &str, ttl: Duration) -> StoreResult<Option<StoreLock>> {
        let key = format!("lock:{name}");
        let token = uuid::Uuid::new_v4().to_string();
        if self.set_nx_with_ttl(&key, &token, ttl).await? {
            log_debug!(lock = %key, "Distributed lock acquired");
            Ok(Some(StoreLock {
                store: self.clone(),
                key,
                token,
            }))
        } else {
            Ok(None)
        }
    }

    // ------------------------------------------------------------------
    // Pub/sub
    // ------------------------------------------------------------------

    /// Publish `payload` on `channel`.
    pub async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    /// Subscribe to `channel`, yielding message payloads.
    ///
    /// The subscription lives on its own connection; dropping the stream
    /// closes it.
    pub async fn subscribe(&self, channel: &str) -> StoreResult<impl Stream<Item = String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() }))
    }
}

/// A held distributed-lock lease.
///
/// Call [`release`](Self::release) when done; if the holder crashes the
/// lease expires on its own.
#[derive(Debug)]
pub struct StoreLock {
    store: CoordinationStore,
    key: String,
    token: String,
}

impl StoreLock {
    /// Release the lease. A no-op if the lease already expired or was
    /// taken over after expiry (the holder token no longer matches).
    pub async fn release(self) {
        let mut conn = self.store.conn.clone();
        let result: Result<i64, redis::RedisError> = redis::Script::new(RELEASE_LOCK)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(1) => log_debug!(lock = %self.key, "Distributed lock released"),
            Ok(_) => log_debug!(lock = %self.key, "Lock already expired at release"),
            Err(e) => log_warn!(lock = %self.key, error = %e, "Lock release failed"),
        }
    }
}
