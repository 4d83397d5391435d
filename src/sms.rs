//! SMS one-time-code service.
//!
//! Issues short-lived numeric codes, stores them in the coordination
//! store, and consumes them atomically on verification. Cooldowns,
//! hourly caps, and attempt counters also live in the store, so they
//! hold across worker processes and survive restarts.
//!
//! The verify path has no check-then-act window: the compare-and-delete
//! runs as one server-side script, so two concurrent verifies with the
//! correct code produce exactly one `Verified`.

use crate::config::SmsConfig;
use crate::error::{AppError, AppResult};
use crate::logging::{log_info, log_warn};
use crate::store::CoordinationStore;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

/// Mainland mobile number: 11 digits, 1[3-9] prefix.
static PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^1[3-9]\d{9}$").expect("phone regex"));

/// Whether `phone` is a deliverable mobile number.
pub fn is_valid_phone(phone: &str) -> bool {
    PHONE_RE.is_match(phone)
}

/// Outcome of a send request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Code stored and delivered.
    Sent,
    /// A send happened too recently; wait this many seconds.
    CooldownActive { wait_seconds: u64 },
    /// The rolling-hour send budget for this phone is spent.
    HourlyCapReached,
    /// The phone number is not a valid mobile number.
    InvalidPhone,
    /// The SMS gateway refused or failed; the stored code was rolled
    /// back so a fresh send works after the cooldown.
    GatewayUnavailable,
}

/// Outcome of a verify request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    /// Correct code; it is now consumed.
    Verified,
    /// Wrong code; the stored code is untouched.
    Incorrect,
    /// No code is active for this phone and purpose.
    NoActiveCode,
    /// Too many wrong guesses; the code was force-deleted and a new
    /// send is required.
    TooManyAttempts,
}

/// Outbound SMS delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SmsGateway: Send + Sync {
    /// Deliver `code` to `phone` using the configured template.
    async fn deliver(&self, phone: &str, code: &str) -> AppResult<()>;
}

/// Production gateway: signed HTTP POST per the gateway's protocol.
#[derive(Debug)]
pub struct HttpSmsGateway {
    http: reqwest::Client,
    url: String,
    secret: String,
}

impl HttpSmsGateway {
    pub fn new(config: &SmsConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::internal(format!("sms http client build failed: {e}")))?;
        Ok(Self {
            http,
            url: config.gateway_url.clone(),
            secret: config.gateway_secret.clone(),
        })
    }
}

#[async_trait]
impl SmsGateway for HttpSmsGateway {
    async fn deliver(&self, phone: &str, code: &str) -> AppResult<()> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.secret)
            .json(&serde_json::json!({
                "phone": phone,
                "template": "verification_code",
                "params": { "code": code },
            }))
            .send()
            .await
            .map_err(|e| {
                AppError::upstream_error("sms_gateway", format!("delivery failed: {e}"), true, None)
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(AppError::upstream_error(
                "sms_gateway",
                format!("gateway rejected send (HTTP {status})"),
                status >= 500,
                None,
            ));
        }
        Ok(())
    }
}

/// The code service. One per worker, injected into the HTTP layer.
pub struct SmsCodeService {
    store: CoordinationStore,
    gateway: Arc<dyn SmsGateway>,
    config: SmsConfig,
}

impl SmsCodeService {
    pub fn new(store: CoordinationStore, gateway: Arc<dyn SmsGateway>, config: SmsConfig) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    fn code_key(phone: &str, purpose: &str) -> String {
        format!("sms:{phone}:{purpose}")
    }

    fn cooldown_key(phone: &str) -> String {
        format!("sms:cooldown:{phone}")
    }

    fn hourly_key(phone: &str) -> String {
        format!("sms:hourly:{phone}")
    }

    fn attempts_key(phone: &str, purpose: &str) -> String {
        format!("sms:attempts:{phone}:{purpose}")
    }

    /// Issue a code to `phone`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Unavailable`] when the coordination store is
    /// unreachable. Business outcomes (cooldown, cap, bad phone,
    /// gateway failure) are values, not errors.
    pub async fn send_code(&self, phone: &str, purpose: &str) -> AppResult<SendStatus> {
        if !is_valid_phone(phone) {
            return Ok(SendStatus::InvalidPhone);
        }

        // Cooldown stamp doubles as the check: a failed SET NX means one
        // is already active.
        let cooldown_key = Self::cooldown_key(phone);
        let stamped = self
            .store
            .set_nx_with_ttl(&cooldown_key, "1", self.config.resend_cooldown)
            .await
            .map_err(store_unavailable)?;
        if !stamped {
            let wait_seconds = self
                .store
                .ttl(&cooldown_key)
                .await
                .map_err(store_unavailable)?
                .unwrap_or(self.config.resend_cooldown.as_secs());
            return Ok(SendStatus::CooldownActive { wait_seconds });
        }

        let sends = self
            .store
            .incr_with_ttl(&Self::hourly_key(phone), Duration::from_secs(3600))
            .await
            .map_err(store_unavailable)?;
        if sends > i64::from(self.config.hourly_cap) {
            return Ok(SendStatus::HourlyCapReached);
        }

        // rand::rng() is a CSPRNG; codes must not be predictable.
        let code = format!("{:06}", rand::rng().random_range(0..1_000_000u32));

        let code_key = Self::code_key(phone, purpose);
        self.store
            .set_with_ttl(&code_key, &code, self.config.code_ttl)
            .await
            .map_err(store_unavailable)?;
        // New code, fresh guess budget.
        self.store
            .del(&Self::attempts_key(phone, purpose))
            .await
            .map_err(store_unavailable)?;

        if let Err(e) = self.gateway.deliver(phone, &code).await {
            log_warn!(phone = phone, error = %e, "SMS gateway delivery failed, rolling back code");
            // Roll back so a fresh send is possible after the cooldown,
            // and refund the hourly slot the failed send consumed.
            let _ = self.store.del(&code_key).await;
            let _ = self.store.decr(&Self::hourly_key(phone)).await;
            return Ok(SendStatus::GatewayUnavailable);
        }

        log_info!(phone = phone, purpose = purpose, "SMS code sent");
        Ok(SendStatus::Sent)
    }

    /// Verify a code. At most one concurrent caller can consume it.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Unavailable`] when the coordination store is
    /// unreachable.
    pub async fn verify_code(
        &self,
        phone: &str,
        purpose: &str,
        provided_code: &str,
    ) -> AppResult<VerifyStatus> {
        if !is_valid_phone(phone) {
            return Ok(VerifyStatus::NoActiveCode);
        }

        let code_key = Self::code_key(phone, purpose);
        let attempts_key = Self::attempts_key(phone, purpose);

        let attempts = self
            .store
            .incr_with_ttl(&attempts_key, self.config.code_ttl)
            .await
            .map_err(store_unavailable)?;
        if attempts > i64::from(self.config.max_attempts) {
            // The code cannot be guessed further; force a new send.
            self.store.del(&code_key).await.map_err(store_unavailable)?;
            log_warn!(phone = phone, attempts = attempts, "SMS verify attempt cap hit");
            return Ok(VerifyStatus::TooManyAttempts);
        }

        if self
            .store
            .compare_and_delete(&code_key, provided_code)
            .await
            .map_err(store_unavailable)?
        {
            let _ = self.store.del(&attempts_key).await;
            log_info!(phone = phone, purpose = purpose, "SMS code verified");
            return Ok(VerifyStatus::Verified);
        }

        let active = self.store.get(&code_key).await.map_err(store_unavailable)?;
        Ok(if active.is_some() {
            VerifyStatus::Incorrect
        } else {
            VerifyStatus::NoActiveCode
        })
    }
}

impl std::fmt::Debug for SmsCodeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmsCodeService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn store_unavailable(err: crate::store::StoreError) -> AppError {
    log_warn!(error = %err, "Coordination store failure in SMS service");
    AppError::unavailable("coordination store")
}
