//! Relational layer.
//!
//! The pool is a scarce shared resource. Every method here acquires a
//! connection, runs its SQL, and returns the connection to the pool
//! before the caller does any network I/O — no connection is ever held
//! across an LLM call or an SSE stream. The entity types returned are
//! detached values; no SQL handle escapes this module.

use crate::config::DbPoolConfig;
use crate::error::{AppError, AppResult};
use crate::logging::{log_debug, log_info};
use crate::usage::UsageRecord;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder, Row};

/// Detached user row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub phone: String,
    pub is_admin: bool,
    pub is_active: bool,
    pub org_id: Option<i64>,
}

/// Detached organization row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Organization {
    pub id: i64,
    pub name: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub locked: bool,
}

impl Organization {
    /// An org is effectively disabled when locked or past expiry, which
    /// disables all its members.
    pub fn is_disabled(&self, now: DateTime<Utc>) -> bool {
        self.locked || self.expires_at.is_some_and(|expiry| expiry < now)
    }
}

/// Detached API key row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKey {
    pub id: i64,
    pub secret: String,
    pub org_id: Option<i64>,
    pub quota_limit: Option<i64>,
    pub usage_count: i64,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// Whether the key may be used right now.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && !self.expires_at.is_some_and(|expiry| expiry < now)
            && !self
                .quota_limit
                .is_some_and(|limit| self.usage_count >= limit)
    }
}

/// Handle to the relational store. Cheap to clone (pool is internally
/// shared).
#[derive(Debug, Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect and size the pool from configuration.
    pub async fn connect(url: &str, pool_config: &DbPoolConfig) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(pool_config.size)
            .max_connections(pool_config.max_connections())
            .connect(url)
            .await
            .map_err(|_| AppError::unavailable("database"))?;
        log_info!(
            max_connections = pool_config.max_connections(),
            "Database pool ready"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Number of connections currently checked out of the pool.
    pub fn connections_in_use(&self) -> u32 {
        self.pool.size() - self.pool.num_idle() as u32
    }

    /// Round-trip health check.
    pub async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Look up an API key by its opaque secret.
    pub async fn fetch_api_key(&self, secret: &str) -> AppResult<Option<ApiKey>> {
        let key = sqlx::query_as::<_, ApiKey>(
            "SELECT id, secret, org_id, quota_limit, usage_count, is_active, expires_at \
             FROM api_keys WHERE secret = $1",
        )
        .bind(secret)
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    /// Look up a user by id.
    pub async fn fetch_user(&self, id: i64) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, phone, is_admin, is_active, org_id FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    /// Look up a user by phone number.
    pub async fn fetch_user_by_phone(&self, phone: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, phone, is_admin, is_active, org_id FROM users WHERE phone = $1",
        )
        .bind(phone)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    /// Look up an organization by id.
    pub async fn fetch_organization(&self, id: i64) -> AppResult<Option<Organization>> {
        let org = sqlx::query_as::<_, Organization>(
            "SELECT id, name, expires_at, locked FROM organizations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(org)
    }

    /// Increment an API key's usage counter.
    pub async fn bump_api_key_usage(&self, id: i64) -> AppResult<()> {
        sqlx::query("UPDATE api_keys SET usage_count = usage_count + 1 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist a batch of usage records in a single transaction.
    ///
    /// Either the whole batch lands or none of it does; the buffer
    /// restores the batch and retries on failure.
    pub async fn insert_usage_batch(&self, records: &[UsageRecord]) -> AppResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let mut builder = QueryBuilder::new(
            "INSERT INTO token_usage \
             (user_id, org_id, model, prompt_tokens, completion_tokens, request_type, succeeded, created_at) ",
        );
        builder.push_values(records, |mut row, record| {
            row.push_bind(record.user_id)
                .push_bind(record.org_id)
                .push_bind(&record.model)
                .push_bind(record.prompt_tokens as i64)
                .push_bind(record.completion_tokens as i64)
                .push_bind(&record.request_type)
                .push_bind(record.succeeded)
                .push_bind(record.created_at);
        });
        builder.build().execute(&mut *tx).await?;
        tx.commit().await?;

        log_debug!(rows = records.len(), "Usage batch persisted");
        Ok(())
    }

    /// Total persisted usage rows for a user (admin/debug surface).
    pub async fn count_usage_rows(&self, user_id: i64) -> AppResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM token_usage WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }
}
