//! Request authenticator.
//!
//! Maps an incoming credential — `X-API-Key` for machine callers, a
//! bearer session token for interactive users — to a detached
//! [`AuthContext`] before any core component is touched. The SQL here is
//! the only SQL a request runs before its LLM work, and the connection
//! returns to the pool when each query finishes: no handle survives into
//! the context value, so nothing downstream can hold the pool across an
//! LLM call or an SSE stream.

use crate::db::Db;
use crate::error::{AppError, AppResult};
use crate::store::CoordinationStore;
use axum::http::HeaderMap;
use chrono::Utc;

/// Detached authorization record for one request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Authenticated user id; 0 for pure machine (API key) callers.
    pub user_id: i64,
    pub org_id: Option<i64>,
    pub is_admin: bool,
    /// Set when the credential was an API key.
    pub api_key_id: Option<i64>,
}

/// One per worker; thin and stateless beyond its handles.
#[derive(Debug, Clone)]
pub struct Authenticator {
    db: Db,
    store: CoordinationStore,
}

impl Authenticator {
    pub fn new(db: Db, store: CoordinationStore) -> Self {
        Self { db, store }
    }

    /// Authenticate a request from its headers.
    ///
    /// # Errors
    ///
    /// - [`AppError::Auth`] for a missing, unknown, expired, or disabled
    ///   credential, and for members of locked or expired organizations.
    /// - [`AppError::QuotaExceeded`] for an API key past its quota.
    pub async fn authenticate(&self, headers: &HeaderMap) -> AppResult<AuthContext> {
        if let Some(api_key) = header_str(headers, "x-api-key") {
            return self.authenticate_api_key(api_key).await;
        }
        if let Some(token) = bearer_token(headers) {
            return self.authenticate_bearer(token).await;
        }
        Err(AppError::auth("no credential presented"))
    }

    /// Like [`authenticate`](Self::authenticate), but requires the
    /// admin role.
    pub async fn authenticate_admin(&self, headers: &HeaderMap) -> AppResult<AuthContext> {
        let token =
            bearer_token(headers).ok_or_else(|| AppError::auth("admin requires bearer auth"))?;
        let ctx = self.authenticate_bearer(token).await?;
        if !ctx.is_admin {
            return Err(AppError::auth("admin role required"));
        }
        Ok(ctx)
    }

    async fn authenticate_api_key(&self, secret: &str) -> AppResult<AuthContext> {
        let key = self
            .db
            .fetch_api_key(secret)
            .await?
            .ok_or_else(|| AppError::auth("unknown API key"))?;

        let now = Utc::now();
        if !key.is_active {
            return Err(AppError::auth("API key revoked"));
        }
        if key.expires_at.is_some_and(|expiry| expiry < now) {
            return Err(AppError::auth("API key expired"));
        }
        if key
            .quota_limit
            .is_some_and(|limit| key.usage_count >= limit)
        {
            return Err(AppError::quota_exceeded("API key quota exhausted"));
        }

        if let Some(org_id) = key.org_id {
            self.check_org(org_id).await?;
        }

        self.db.bump_api_key_usage(key.id).await?;

        Ok(AuthContext {
            user_id: 0,
            org_id: key.org_id,
            is_admin: false,
            api_key_id: Some(key.id),
        })
    }

    async fn authenticate_bearer(&self, token: &str) -> AppResult<AuthContext> {
        // Interactive sessions are minted at login and live in the
        // coordination store with a TTL.
        let session_key = format!("session:token:{token}");
        let user_id: i64 = self
            .store
            .get(&session_key)
            .await
            .map_err(|_| AppError::unavailable("coordination store"))?
            .ok_or_else(|| AppError::auth("unknown or expired session token"))?
            .parse()
            .map_err(|_| AppError::auth("malformed session record"))?;

        let user = self
            .db
            .fetch_user(user_id)
            .await?
            .ok_or_else(|| AppError::auth("unknown user"))?;
        if !user.is_active {
            return Err(AppError::auth("user disabled"));
        }

        if let Some(org_id) = user.org_id {
            self.check_org(org_id).await?;
        }

        Ok(AuthContext {
            user_id: user.id,
            org_id: user.org_id,
            is_admin: user.is_admin,
            api_key_id: None,
        })
    }

    /// A locked or expired organization disables all its members.
    async fn check_org(&self, org_id: i64) -> AppResult<()> {
        let org = self
            .db
            .fetch_organization(org_id)
            .await?
            .ok_or_else(|| AppError::auth("unknown organization"))?;
        if org.is_disabled(Utc::now()) {
            return Err(AppError::auth("organization locked or expired"));
        }
        Ok(())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "authorization")?.strip_prefix("Bearer ")
}
