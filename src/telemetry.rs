//! Telemetry sink.
//!
//! Records latencies, outcomes, and slow-request warnings per request
//! type. The sink is a small in-process metrics map; it exists so the
//! facade can report every attempt without the request path depending on
//! any external telemetry system.

use crate::error::AppError;
use crate::logging::log_warn;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Default latency above which a request is logged as slow.
const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_secs(8);

/// Aggregated counters for one request type.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestStats {
    /// Attempts recorded.
    pub count: u64,
    /// Attempts that ended in an error.
    pub errors: u64,
    /// Attempts cancelled by the client.
    pub cancelled: u64,
    /// Sum of latencies, for mean computation.
    pub total_latency_ms: u64,
    /// Worst latency seen.
    pub max_latency_ms: u64,
}

/// Process-wide telemetry sink. One per worker, injected explicitly.
#[derive(Debug)]
pub struct TelemetrySink {
    slow_threshold: Duration,
    metrics: Mutex<HashMap<String, RequestStats>>,
}

impl Default for TelemetrySink {
    fn default() -> Self {
        Self::new(DEFAULT_SLOW_THRESHOLD)
    }
}

impl TelemetrySink {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            slow_threshold,
            metrics: Mutex::new(HashMap::new()),
        }
    }

    /// Record one attempt. `outcome` is `Ok(())` for success, or the
    /// error the attempt produced.
    pub fn record(
        &self,
        request_type: &str,
        provider: &str,
        latency: Duration,
        outcome: Result<(), &AppError>,
    ) {
        let latency_ms = latency.as_millis() as u64;
        {
            let mut metrics = self.metrics.lock().expect("telemetry mutex poisoned");
            let stats = metrics.entry(request_type.to_string()).or_default();
            stats.count += 1;
            stats.total_latency_ms += latency_ms;
            stats.max_latency_ms = stats.max_latency_ms.max(latency_ms);
            match outcome {
                Ok(()) => {}
                Err(AppError::Cancelled { .. }) => stats.cancelled += 1,
                Err(_) => stats.errors += 1,
            }
        }

        if latency >= self.slow_threshold {
            log_warn!(
                request_type = request_type,
                provider = provider,
                latency_ms = latency_ms,
                threshold_ms = self.slow_threshold.as_millis() as u64,
                outcome = outcome.map_or_else(|e| e.code(), |()| "ok"),
                "Slow request"
            );
        }
    }

    /// Copy of the current metrics map, for the debug surface.
    pub fn snapshot(&self) -> HashMap<String, RequestStats> {
        self.metrics
            .lock()
            .expect("telemetry mutex poisoned")
            .clone()
    }
}
