//! Token-usage buffer.
//!
//! Asynchronous accounting pipeline: the hot path appends one record to
//! a shared list in the coordination store and returns; a background
//! worker drains the list in batches and persists each batch to the
//! relational store in a single transaction. The request path never
//! waits on a database write.
//!
//! Delivery is at-least-once: a batch whose transaction fails is pushed
//! back onto the front of the list and retried with exponential backoff.
//! Records that cannot even be re-queued are logged as dropped, so every
//! record is either persisted or explicitly accounted for in the logs.

use crate::config::UsageBufferConfig;
use crate::db::Db;
use crate::error::{AppError, AppResult};
use crate::logging::{log_debug, log_error, log_info, log_warn};
use crate::store::CoordinationStore;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared pending list in the coordination store.
const LIST_KEY: &str = "token_buf:pending";

/// Pub/sub channel that nudges the flusher when the threshold trips.
const FLUSH_CHANNEL: &str = "token_buf:flush";

/// Hash prefix for per-model aggregate counters.
const AGG_KEY_PREFIX: &str = "token_buf:agg:";

/// Where the facade reports accounting records.
///
/// The production implementation is [`TokenUsageBuffer`]; tests collect
/// records in memory.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait UsageSink: Send + Sync {
    /// Append one record. Must return quickly and never block the
    /// caller on persistence.
    async fn enqueue(&self, record: UsageRecord);
}

/// One row of per-call accounting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub user_id: i64,
    pub org_id: Option<i64>,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub request_type: String,
    pub succeeded: bool,
    pub created_at: DateTime<Utc>,
}

/// Buffered accounting pipeline. One per worker process.
#[derive(Debug)]
pub struct TokenUsageBuffer {
    store: CoordinationStore,
    config: UsageBufferConfig,
    /// Holds records the store refused; drained opportunistically by the
    /// flusher. Bounded only by the store outage duration.
    fallback: Mutex<VecDeque<UsageRecord>>,
}

impl TokenUsageBuffer {
    pub fn new(store: CoordinationStore, config: UsageBufferConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            fallback: Mutex::new(VecDeque::new()),
        })
    }

    /// Append one record. Returns after a single store round-trip; on
    /// store unavailability the record parks in the in-process queue and
    /// a warning is logged.
    async fn push(&self, record: UsageRecord) {
        let payload = match serde_json::to_string(&record) {
            Ok(payload) => payload,
            Err(e) => {
                log_error!(error = %e, "Usage record serialization failed, record dropped");
                return;
            }
        };

        match self.store.rpush(LIST_KEY, &payload).await {
            Ok(len) => {
                if len as usize >= self.config.flush_threshold {
                    // Fire-and-forget nudge; the interval tick is the
                    // fallback if the message is lost.
                    let _ = self.store.publish(FLUSH_CHANNEL, "threshold").await;
                }
            }
            Err(e) => {
                log_warn!(
                    error = %e,
                    "Coordination store refused usage record, parking in-process"
                );
                self.fallback
                    .lock()
                    .expect("usage fallback mutex poisoned")
                    .push_back(record);
            }
        }
    }

    /// Records currently parked in the in-process fallback queue.
    pub fn fallback_len(&self) -> usize {
        self.fallback
            .lock()
            .expect("usage fallback mutex poisoned")
            .len()
    }

    /// Start the background flush worker. Runs until `cancel` fires,
    /// then performs one final drain.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        db: Db,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(buffer.config.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            // Pub/sub nudge is best-effort; on subscribe failure the
            // interval alone drives the loop.
            let mut nudges = match buffer.store.subscribe(FLUSH_CHANNEL).await {
                Ok(stream) => Some(Box::pin(stream)),
                Err(e) => {
                    log_warn!(error = %e, "Flush channel subscribe failed, polling only");
                    None
                }
            };

            log_info!(
                interval_secs = buffer.config.flush_interval.as_secs(),
                threshold = buffer.config.flush_threshold,
                "Usage flusher started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    Some(_) = async {
                        match nudges.as_mut() {
                            Some(stream) => stream.next().await,
                            None => std::future::pending().await,
                        }
                    } => {}
                }

                // At most one worker drains per cycle; the others skip.
                match buffer
                    .store
                    .acquire_lock("token_buf:flush", Duration::from_secs(30))
                    .await
                {
                    Ok(Some(lock)) => {
                        if let Err(e) = buffer.flush_once(&db).await {
                            log_warn!(error = %e, "Usage flush cycle failed");
                        }
                        lock.release().await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log_warn!(error = %e, "Flush lock unavailable, skipping cycle");
                    }
                }
            }

            // Final drain so a clean shutdown loses nothing reachable.
            if let Err(e) = buffer.flush_once(&db).await {
                log_warn!(error = %e, "Final usage flush failed");
            }
            log_info!("Usage flusher stopped");
        })
    }

    /// Drain and persist one batch. Returns the number of rows persisted.
    pub async fn flush_once(&self, db: &Db) -> AppResult<usize> {
        // Re-home parked records first so they rejoin the shared list.
        let parked: Vec<UsageRecord> = {
            let mut fallback = self.fallback.lock().expect("usage fallback mutex poisoned");
            fallback.drain(..).collect()
        };
        for record in &parked {
            if let Ok(payload) = serde_json::to_string(record) {
                if self.store.rpush(LIST_KEY, &payload).await.is_err() {
                    // Store still down; put the rest back and move on.
                    self.fallback
                        .lock()
                        .expect("usage fallback mutex poisoned")
                        .push_back(record.clone());
                }
            }
        }

        let raw_batch = self
            .store
            .read_and_trim(LIST_KEY, self.config.batch_size)
            .await
            .map_err(|_| AppError::unavailable("coordination store"))?;
        if raw_batch.is_empty() {
            return Ok(0);
        }

        let mut records = Vec::with_capacity(raw_batch.len());
        for raw in &raw_batch {
            match serde_json::from_str::<UsageRecord>(raw) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // Corrupt entries cannot be persisted or restored.
                    log_error!(error = %e, raw = %raw, "Dropping corrupt usage record");
                }
            }
        }

        let persist = backoff::future::retry(flush_backoff(), || async {
            db.insert_usage_batch(&records)
                .await
                .map_err(backoff::Error::transient)
        })
        .await;

        match persist {
            Ok(()) => {
                self.update_aggregates(&records).await;
                log_debug!(rows = records.len(), "Usage batch flushed");
                Ok(records.len())
            }
            Err(e) => {
                // Restore the batch to the front so ordering survives and
                // the next cycle retries it.
                if let Err(restore_err) = self.store.lpush_front(LIST_KEY, &raw_batch).await {
                    log_error!(
                        rows = raw_batch.len(),
                        error = %restore_err,
                        "Usage batch restore failed, records dropped"
                    );
                }
                Err(e)
            }
        }
    }

    /// Bump per-model aggregate counters so dashboards read O(1) hashes
    /// instead of scanning the usage table.
    async fn update_aggregates(&self, records: &[UsageRecord]) {
        let mut per_model: HashMap<&str, (i64, i64, i64)> = HashMap::new();
        for record in records {
            let entry = per_model.entry(record.model.as_str()).or_default();
            entry.0 += 1;
            if record.succeeded {
                entry.1 += 1;
            }
            entry.2 += i64::from(record.prompt_tokens) + i64::from(record.completion_tokens);
        }

        for (model, (requests, success, tokens)) in per_model {
            let key = format!("{AGG_KEY_PREFIX}{model}");
            let results = [
                self.store.hincrby(&key, "requests", requests).await,
                self.store.hincrby(&key, "success", success).await,
                self.store.hincrby(&key, "tokens", tokens).await,
            ];
            for result in results {
                if let Err(e) = result {
                    log_warn!(model = model, error = %e, "Aggregate counter update failed");
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl UsageSink for TokenUsageBuffer {
    async fn enqueue(&self, record: UsageRecord) {
        self.push(record).await;
    }
}

fn flush_backoff() -> backoff::ExponentialBackoff {
    backoff::ExponentialBackoff {
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(5),
        max_elapsed_time: Some(Duration::from_secs(20)),
        ..Default::default()
    }
}
