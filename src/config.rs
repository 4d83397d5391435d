//! Configuration types for the service core.
//!
//! Everything is environment-driven. [`AppConfig::from_env`] reads the
//! recognized keys, applies defaults, and validates the result; nothing
//! else in the crate touches the process environment.
//!
//! # Recognized keys
//!
//! | Key | Default | Meaning |
//! |-----|---------|---------|
//! | `BIND_ADDR` | `0.0.0.0:9000` | HTTP listen address |
//! | `DATABASE_URL` | — (required) | Postgres connection string |
//! | `COORDINATION_STORE_URL` | `redis://127.0.0.1:6379` | shared store |
//! | `DB_POOL_SIZE` | `5` | base connections per worker |
//! | `DB_POOL_OVERFLOW` | `10` | burst connections per worker |
//! | `<PROVIDER>_API_KEY` | — | enables that provider |
//! | `<PROVIDER>_QPM_LIMIT` | `200` | trailing-60s request budget |
//! | `<PROVIDER>_CONCURRENT_LIMIT` | `20` | max in-flight requests |
//! | `<PROVIDER>_SCOPE` | `process` | limiter coordination (`process`/`global`) |
//! | `<PROVIDER>_TIMEOUT_SECONDS` | `60` | per-attempt request timeout |
//! | `SMS_CODE_TTL_SECONDS` | `300` | code lifetime |
//! | `SMS_RESEND_COOLDOWN_SECONDS` | `60` | min gap between sends |
//! | `SMS_HOURLY_CAP` | `5` | sends per phone per hour |
//! | `SMS_MAX_ATTEMPTS` | `5` | wrong guesses before force-delete |
//! | `SMS_GATEWAY_URL` | — | SMS gateway endpoint |
//! | `SMS_GATEWAY_SECRET` | — | SMS gateway signing secret |
//! | `TOKEN_BUFFER_FLUSH_INTERVAL_SECONDS` | `10` | flush cadence |
//! | `TOKEN_BUFFER_FLUSH_THRESHOLD` | `1000` | early-flush list length |
//!
//! Provider names are upper-cased for key lookup: the `qwen` provider
//! reads `QWEN_API_KEY`, `QWEN_QPM_LIMIT`, `QWEN_CONCURRENT_LIMIT`.

use crate::error::{AppError, AppResult};
use crate::logging::{log_debug, log_info};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rate-limiter coordination scope for one provider.
///
/// `Process` keeps all limiter state in this worker's memory; `Global`
/// coordinates through the shared store and is required when more than
/// one worker process serves traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LimitScope {
    /// In-process semaphore and sliding window, no store round-trips.
    #[default]
    Process,
    /// Store-coordinated sorted set and counter, shared across workers.
    Global,
}

/// Transport variant a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderVariant {
    /// Single HTTP request, full response body returned.
    #[default]
    OneShot,
    /// HTTP response with event-per-token framing.
    Stream,
    /// Persistent bidirectional WebSocket (realtime/voice scenarios).
    Duplex,
}

/// Static description of one upstream LLM provider.
///
/// The built-in catalog ([`ProviderSettings::catalog`]) covers the
/// providers the service ships with; a provider is active only when its
/// API key is present in the environment.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Stable provider id ("qwen", "deepseek", ...). Used in rate-limit
    /// keys, telemetry buckets, and client-visible provider tags.
    pub id: String,
    /// Bearer credential for the provider's API.
    pub api_key: String,
    /// Base URL, no trailing slash.
    pub base_url: String,
    /// Model identifier sent with each request.
    pub model: String,
    /// Transport variant.
    pub variant: ProviderVariant,
    /// Requests permitted within any trailing 60-second window.
    pub qpm_limit: u32,
    /// Max in-flight requests at any instant.
    pub concurrent_limit: u32,
    /// Rate-limiter coordination scope.
    pub scope: LimitScope,
    /// Per-attempt request timeout.
    pub request_timeout: Duration,
}

impl ProviderSettings {
    /// The providers this build knows how to talk to, with their wire
    /// variants and default endpoints.
    fn catalog() -> &'static [(&'static str, &'static str, &'static str, ProviderVariant)] {
        &[
            (
                "qwen",
                "https://dashscope.aliyuncs.com/compatible-mode",
                "qwen-plus",
                ProviderVariant::Stream,
            ),
            (
                "deepseek",
                "https://api.deepseek.com",
                "deepseek-chat",
                ProviderVariant::Stream,
            ),
            (
                "kimi",
                "https://api.moonshot.cn",
                "moonshot-v1-8k",
                ProviderVariant::OneShot,
            ),
            (
                "hunyuan",
                "https://api.hunyuan.cloud.tencent.com",
                "hunyuan-turbo",
                ProviderVariant::OneShot,
            ),
        ]
    }

    /// Load every catalog provider whose API key is present.
    fn from_env() -> Vec<Self> {
        Self::catalog()
            .iter()
            .filter_map(|(id, base_url, model, variant)| {
                let upper = id.to_uppercase();
                let api_key = std::env::var(format!("{upper}_API_KEY")).ok()?;
                // Scope is a per-provider axis, like the two limits.
                let scope = match std::env::var(format!("{upper}_SCOPE")).as_deref() {
                    Ok("global") => LimitScope::Global,
                    _ => LimitScope::Process,
                };
                Some(Self {
                    id: (*id).to_string(),
                    api_key,
                    base_url: (*base_url).to_string(),
                    model: (*model).to_string(),
                    variant: *variant,
                    qpm_limit: env_parse(&format!("{upper}_QPM_LIMIT"), 200),
                    concurrent_limit: env_parse(&format!("{upper}_CONCURRENT_LIMIT"), 20),
                    scope,
                    request_timeout: Duration::from_secs(env_parse(
                        &format!("{upper}_TIMEOUT_SECONDS"),
                        60,
                    )),
                })
            })
            .collect()
    }

    /// Validate limits are usable.
    fn validate(&self) -> AppResult<()> {
        if self.qpm_limit == 0 {
            return Err(AppError::validation(format!(
                "provider {}: qpm_limit must be at least 1",
                self.id
            )));
        }
        if self.concurrent_limit == 0 {
            return Err(AppError::validation(format!(
                "provider {}: concurrent_limit must be at least 1",
                self.id
            )));
        }
        Ok(())
    }
}

/// Relational pool sizing.
///
/// For W workers the database must sustain `W * (size + overflow)`
/// simultaneous connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbPoolConfig {
    /// Base connections held per worker.
    pub size: u32,
    /// Additional burst connections per worker.
    pub overflow: u32,
}

impl Default for DbPoolConfig {
    fn default() -> Self {
        Self {
            size: 5,
            overflow: 10,
        }
    }
}

impl DbPoolConfig {
    /// Total connections this worker may open.
    pub fn max_connections(&self) -> u32 {
        self.size + self.overflow
    }
}

/// SMS one-time-code parameters.
#[derive(Debug, Clone)]
pub struct SmsConfig {
    /// Code lifetime.
    pub code_ttl: Duration,
    /// Minimum gap between two sends to the same phone.
    pub resend_cooldown: Duration,
    /// Sends per phone within a rolling hour.
    pub hourly_cap: u32,
    /// Wrong guesses before the code is force-deleted.
    pub max_attempts: u32,
    /// Gateway endpoint.
    pub gateway_url: String,
    /// Gateway signing secret.
    pub gateway_secret: String,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            code_ttl: Duration::from_secs(300),
            resend_cooldown: Duration::from_secs(60),
            hourly_cap: 5,
            max_attempts: 5,
            gateway_url: String::new(),
            gateway_secret: String::new(),
        }
    }
}

/// Token-usage buffer tuning.
#[derive(Debug, Clone)]
pub struct UsageBufferConfig {
    /// Periodic flush cadence.
    pub flush_interval: Duration,
    /// List length that triggers an early flush.
    pub flush_threshold: usize,
    /// Rows per persistence transaction.
    pub batch_size: usize,
}

impl Default for UsageBufferConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(10),
            flush_threshold: 1000,
            batch_size: 500,
        }
    }
}

/// Node-palette streamer tuning.
#[derive(Debug, Clone)]
pub struct PaletteConfig {
    /// Parallel provider calls per batch.
    pub providers_per_batch: usize,
    /// Fresh nodes requested from each provider.
    pub nodes_per_provider: usize,
    /// Whole-batch deadline.
    pub overall_deadline: Duration,
    /// Grace period after cancellation before streams are force-closed.
    pub cancel_grace: Duration,
    /// Idle session lifetime.
    pub idle_expiry: Duration,
}

impl Default for PaletteConfig {
    fn default() -> Self {
        Self {
            providers_per_batch: 4,
            nodes_per_provider: 15,
            overall_deadline: Duration::from_secs(45),
            cancel_grace: Duration::from_millis(500),
            idle_expiry: Duration::from_secs(600),
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP listen address.
    pub bind_addr: String,
    /// Postgres connection string.
    pub database_url: String,
    /// Coordination store (redis) URL.
    pub store_url: String,
    /// Relational pool sizing.
    pub db_pool: DbPoolConfig,
    /// Active providers (catalog entries with an API key present).
    pub providers: Vec<ProviderSettings>,
    /// SMS code service parameters.
    pub sms: SmsConfig,
    /// Token-usage buffer tuning.
    pub usage_buffer: UsageBufferConfig,
    /// Node-palette streamer tuning.
    pub palette: PaletteConfig,
}

impl AppConfig {
    /// Load configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Validation`] if `DATABASE_URL` is missing, no
    /// provider API key is configured, or any provider limit is zero.
    pub fn from_env() -> AppResult<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| AppError::validation("DATABASE_URL is required"))?;

        let providers = ProviderSettings::from_env();

        let config = Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:9000".to_string()),
            database_url,
            store_url: std::env::var("COORDINATION_STORE_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            db_pool: DbPoolConfig {
                size: env_parse("DB_POOL_SIZE", 5),
                overflow: env_parse("DB_POOL_OVERFLOW", 10),
            },
            providers,
            sms: SmsConfig {
                code_ttl: Duration::from_secs(env_parse("SMS_CODE_TTL_SECONDS", 300)),
                resend_cooldown: Duration::from_secs(env_parse("SMS_RESEND_COOLDOWN_SECONDS", 60)),
                hourly_cap: env_parse("SMS_HOURLY_CAP", 5),
                max_attempts: env_parse("SMS_MAX_ATTEMPTS", 5),
                gateway_url: std::env::var("SMS_GATEWAY_URL").unwrap_or_default(),
                gateway_secret: std::env::var("SMS_GATEWAY_SECRET").unwrap_or_default(),
            },
            usage_buffer: UsageBufferConfig {
                flush_interval: Duration::from_secs(env_parse(
                    "TOKEN_BUFFER_FLUSH_INTERVAL_SECONDS",
                    10,
                )),
                flush_threshold: env_parse("TOKEN_BUFFER_FLUSH_THRESHOLD", 1000),
                ..Default::default()
            },
            palette: PaletteConfig::default(),
        };

        config.validate()?;

        log_info!(
            bind_addr = %config.bind_addr,
            providers = config.providers.len(),
            db_pool_max = config.db_pool.max_connections(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> AppResult<()> {
        if self.providers.is_empty() {
            return Err(AppError::validation(
                "no provider configured: set at least one <PROVIDER>_API_KEY",
            ));
        }
        for provider in &self.providers {
            provider.validate()?;
        }
        if self.usage_buffer.flush_threshold == 0 {
            return Err(AppError::validation(
                "TOKEN_BUFFER_FLUSH_THRESHOLD must be at least 1",
            ));
        }
        Ok(())
    }

    /// Look up one provider's settings by id.
    pub fn provider(&self, id: &str) -> Option<&ProviderSettings> {
        self.providers.iter().find(|p| p.id == id)
    }
}

/// Parse an env var, falling back to a default on absence or garbage.
fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            log_debug!(key = key, raw = %raw, "Unparseable env value, using default");
            default
        }),
        Err(_) => default,
    }
}
