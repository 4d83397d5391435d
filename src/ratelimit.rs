//! Per-provider admission control.
//!
//! Combines the two axes of provider rate limiting: a sliding-window QPM
//! counter (requests within any trailing 60 seconds) and a concurrent-slot
//! bound (requests in flight at any instant). Request paths obtain a
//! [`Permit`] before invoking an LLM and the permit releases its slot on
//! drop, so every exit path — success, error, panic unwind, cancellation —
//! returns the slot.
//!
//! Two coordination scopes exist per provider:
//!
//! - [`LimitScope::Process`]: a `tokio` semaphore plus a local deque of
//!   request instants. No store round-trips. Correct for single-worker
//!   deployments.
//! - [`LimitScope::Global`]: the sliding window lives in a store sorted
//!   set (`rl:<provider>:ts`) and the in-flight count in a store counter
//!   (`rl:<provider>:conc`), shared by every worker process. If the store
//!   is unreachable the limiter fails closed and callers see the outage
//!   as a transient upstream error.
//!
//! FIFO is not guaranteed; cooperative sleeps are short (100 ms–1 s) and
//! starvation is bounded by the QPM period.

use crate::config::{LimitScope, ProviderSettings};
use crate::error::{AppError, AppResult};
use crate::logging::{log_debug, log_warn};
use crate::store::CoordinationStore;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Width of the QPM window.
const WINDOW: Duration = Duration::from_secs(60);

/// Bounds for cooperative retry sleeps while waiting on a full window
/// or a full slot set.
const POLL_MIN: Duration = Duration::from_millis(100);
const POLL_MAX: Duration = Duration::from_secs(1);

/// Safety TTL on global limiter keys so abandoned state self-cleans.
const KEY_TTL: Duration = Duration::from_secs(120);

/// Default time budget for [`RateLimiter::acquire`].
const DEFAULT_ACQUIRE_DEADLINE: Duration = Duration::from_secs(30);

/// Per-provider admission controller. One instance per worker process,
/// injected wherever LLM calls are made.
#[derive(Debug)]
pub struct RateLimiter {
    providers: HashMap<String, Arc<ProviderLimiter>>,
}

#[derive(Debug)]
struct ProviderLimiter {
    id: String,
    qpm_limit: u32,
    concurrent_limit: u32,
    scope: LimitScope,
    /// Process-scope slot pool.
    slots: Arc<Semaphore>,
    /// Process-scope sliding window of admission instants.
    window: Mutex<VecDeque<Instant>>,
    /// Store handle for global scope.
    store: Option<CoordinationStore>,
}

impl RateLimiter {
    /// Build a limiter for the given providers.
    ///
    /// `store` must be `Some` if any provider uses [`LimitScope::Global`];
    /// a global provider without a store fails closed on every acquire.
    pub fn new(providers: &[ProviderSettings], store: Option<CoordinationStore>) -> Self {
        let providers = providers
            .iter()
            .map(|p| {
                (
                    p.id.clone(),
                    Arc::new(ProviderLimiter {
                        id: p.id.clone(),
                        qpm_limit: p.qpm_limit,
                        concurrent_limit: p.concurrent_limit,
                        scope: p.scope,
                        slots: Arc::new(Semaphore::new(p.concurrent_limit as usize)),
                        window: Mutex::new(VecDeque::with_capacity(p.qpm_limit as usize)),
                        store: store.clone(),
                    }),
                )
            })
            .collect();
        Self { providers }
    }

    /// Acquire a permit with the default 30-second budget.
    pub async fn acquire(&self, provider_id: &str, cancel: &CancellationToken) -> AppResult<Permit> {
        self.acquire_with_deadline(provider_id, cancel, DEFAULT_ACQUIRE_DEADLINE)
            .await
    }

    /// Block (cooperatively) until both a concurrent slot is free and the
    /// sliding-window QPM count is below the limit, then return a permit.
    ///
    /// # Errors
    ///
    /// - [`AppError::RateLimited`] if the budget elapses first.
    /// - [`AppError::Cancelled`] if `cancel` fires; no partial state is
    ///   left behind (any added timestamp is removed, any bumped counter
    ///   decremented).
    /// - [`AppError::Unavailable`] if the provider is global-scoped and
    ///   the store is unreachable (fail closed).
    pub async fn acquire_with_deadline(
        &self,
        provider_id: &str,
        cancel: &CancellationToken,
        deadline: Duration,
    ) -> AppResult<Permit> {
        let limiter = self
            .providers
            .get(provider_id)
            .ok_or_else(|| AppError::internal(format!("unknown provider: {provider_id}")))?;
        let deadline_at = Instant::now() + deadline;

        match limiter.scope {
            LimitScope::Process => limiter.acquire_process(cancel, deadline_at).await,
            LimitScope::Global => limiter.acquire_global(cancel, deadline_at).await,
        }
    }

    /// Current in-flight count for a provider, as this worker sees it.
    pub async fn in_flight(&self, provider_id: &str) -> AppResult<u64> {
        let limiter = self
            .providers
            .get(provider_id)
            .ok_or_else(|| AppError::internal(format!("unknown provider: {provider_id}")))?;
        match limiter.scope {
            LimitScope::Process => Ok(
                (limiter.concurrent_limit as usize - limiter.slots.available_permits()) as u64,
            ),
            LimitScope::Global => {
                let store = limiter.store()?;
                let raw = store
                    .get(&limiter.conc_key())
                    .await
                    .map_err(|_| AppError::unavailable("coordination store"))?;
                Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
            }
        }
    }
}

impl ProviderLimiter {
    fn ts_key(&self) -> String {
        format!("rl:{}:ts", self.id)
    }

    fn conc_key(&self) -> String {
        format!("rl:{}:conc", self.id)
    }

    fn store(&self) -> AppResult<&CoordinationStore> {
        self.store
            .as_ref()
            .ok_or_else(|| AppError::unavailable("coordination store"))
    }

    /// Sleep `wait` (clamped to the polling bounds), racing cancellation
    /// and the deadline.
    async fn poll_sleep(
        &self,
        wait: Duration,
        cancel: &CancellationToken,
        deadline_at: Instant,
    ) -> AppResult<()> {
        let wait = wait.clamp(POLL_MIN, POLL_MAX);
        tokio::select! {
            _ = cancel.cancelled() => Err(AppError::cancelled("rate limiter acquire")),
            _ = tokio::time::sleep_until((deadline_at).into()) => {
                Err(AppError::rate_limited(&self.id, WINDOW.as_secs()))
            }
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Process scope
    // ------------------------------------------------------------------

    async fn acquire_process(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        deadline_at: Instant,
    ) -> AppResult<Permit> {
        // Slot first: an owned permit is dropped automatically on every
        // failure path below, so no cleanup is needed.
        let slot = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AppError::cancelled("rate limiter acquire"));
            }
            _ = tokio::time::sleep_until(deadline_at.into()) => {
                return Err(AppError::rate_limited(&self.id, WINDOW.as_secs()));
            }
            slot = Arc::clone(&self.slots).acquire_owned() => {
                slot.map_err(|_| AppError::internal("rate limiter semaphore closed"))?
            }
        };

        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                while window
                    .front()
                    .is_some_and(|&oldest| now.duration_since(oldest) >= WINDOW)
                {
                    window.pop_front();
                }
                if (window.len() as u32) < self.qpm_limit {
                    window.push_back(now);
                    None
                } else {
                    // Sleep until the oldest admission leaves the window.
                    window
                        .front()
                        .map(|&oldest| WINDOW.saturating_sub(now.duration_since(oldest)))
                }
            };

            match wait {
                None => {
                    log_debug!(provider = %self.id, "Permit acquired (process scope)");
                    return Ok(Permit {
                        provider: self.id.clone(),
                        inner: PermitInner::Process { _slot: slot },
                    });
                }
                Some(wait) => self.poll_sleep(wait, cancel, deadline_at).await?,
            }
        }
    }

    // ------------------------------------------------------------------
    // Global scope
    // ------------------------------------------------------------------

    async fn acquire_global(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        deadline_at: Instant,
    ) -> AppResult<Permit> {
        let store = self.store()?.clone();
        let ts_key = self.ts_key();
        let conc_key = self.conc_key();

        loop {
            if cancel.is_cancelled() {
                return Err(AppError::cancelled("rate limiter acquire"));
            }

            let now_ms = unix_millis();
            let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());

            // Claim a window entry, trim expired ones, then check whether
            // we fit. Over the limit we withdraw our own entry and sleep
            // until the oldest entry ages out.
            let admitted: AppResult<bool> = async {
                store.zadd(&ts_key, now_ms as f64, &member).await?;
                store
                    .zremrangebyscore(&ts_key, f64::MIN, (now_ms - WINDOW.as_millis() as u64) as f64)
                    .await?;
                store.expire(&ts_key, KEY_TTL).await?;
                let count = store.zcard(&ts_key).await?;
                if count > self.qpm_limit as u64 {
                    store.zrem(&ts_key, &member).await?;
                    return Ok(false);
                }
                Ok(true)
            }
            .await
            .map_err(|e: crate::store::StoreError| {
                log_warn!(provider = %self.id, error = %e, "Store failure in rate limiter, failing closed");
                AppError::unavailable("coordination store")
            });

            if !admitted? {
                let wait = self.window_wait(&store, &ts_key, now_ms).await;
                self.poll_sleep(wait, cancel, deadline_at).await?;
                continue;
            }

            // Window entry held; now claim an in-flight slot.
            let in_flight = match store.incr_with_ttl(&conc_key, KEY_TTL).await {
                Ok(v) => v,
                Err(e) => {
                    let _ = store.zrem(&ts_key, &member).await;
                    log_warn!(provider = %self.id, error = %e, "Store failure in rate limiter, failing closed");
                    return Err(AppError::unavailable("coordination store"));
                }
            };

            if in_flight > self.concurrent_limit as i64 {
                // Withdraw both claims before sleeping so waiting does not
                // consume QPM budget.
                let _ = store.decr(&conc_key).await;
                let _ = store.zrem(&ts_key, &member).await;
                if let Err(e) = self.poll_sleep(POLL_MIN, cancel, deadline_at).await {
                    return Err(e);
                }
                continue;
            }

            log_debug!(
                provider = %self.id,
                in_flight = in_flight,
                "Permit acquired (global scope)"
            );
            return Ok(Permit {
                provider: self.id.clone(),
                inner: PermitInner::Global {
                    state: Some(GlobalPermit { store, conc_key }),
                },
            });
        }
    }

    /// How long until the oldest window entry ages out.
    async fn window_wait(&self, store: &CoordinationStore, ts_key: &str, now_ms: u64) -> Duration {
        match store.zrange_with_scores(ts_key, 0, 0).await {
            Ok(entries) => entries
                .first()
                .map(|(_, score)| {
                    let expires_at = *score as u64 + WINDOW.as_millis() as u64;
                    Duration::from_millis(expires_at.saturating_sub(now_ms))
                })
                .unwrap_or(POLL_MIN),
            Err(_) => POLL_MAX,
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The right to make one outbound request to a rate-limited provider.
///
/// Held for the duration of the call (including the whole lifetime of a
/// streaming response). The slot is released on drop; release is
/// idempotent, so calling [`release`](Self::release) and then dropping is
/// safe.
#[derive(Debug)]
pub struct Permit {
    provider: String,
    inner: PermitInner,
}

#[derive(Debug)]
enum PermitInner {
    Process {
        _slot: OwnedSemaphorePermit,
    },
    Global {
        /// `None` once released.
        state: Option<GlobalPermit>,
    },
}

#[derive(Debug)]
struct GlobalPermit {
    store: CoordinationStore,
    conc_key: String,
}

impl Permit {
    /// The provider this permit admits a request to.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Release the slot eagerly instead of waiting for drop.
    pub async fn release(mut self) {
        if let PermitInner::Global { state } = &mut self.inner {
            if let Some(global) = state.take() {
                global.decrement().await;
            }
        }
        // Process permits release when the semaphore permit drops.
    }
}

impl GlobalPermit {
    async fn decrement(self) {
        if let Err(e) = self.store.decr(&self.conc_key).await {
            log_warn!(key = %self.conc_key, error = %e, "Failed to release global permit slot");
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let PermitInner::Global { state } = &mut self.inner {
            if let Some(global) = state.take() {
                // Permits drop on arbitrary paths (errors, cancellations,
                // stream teardown); the decrement must not require an
                // async context at the drop site.
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move { global.decrement().await });
                } else {
                    log_warn!(
                        key = %global.conc_key,
                        "Global permit dropped outside a runtime; slot expires via TTL"
                    );
                }
            }
        }
    }
}
