//! HTTP surface.
//!
//! axum router over the core services. The state is built once per
//! worker ([`AppState::from_config`]) and injected into every handler —
//! the services have exactly one lifecycle and no handler reaches a
//! singleton through the runtime.
//!
//! Connection discipline: handlers authenticate (short SQL, connection
//! returned immediately), then do their LLM or store work with only
//! detached values in hand. The streaming endpoint holds zero database
//! connections for the lifetime of its SSE response.

use crate::auth::{AuthContext, Authenticator};
use crate::config::AppConfig;
use crate::db::Db;
use crate::diagram::{self, DiagramKind, DiagramSpec};
use crate::error::{AppError, AppResult};
use crate::facade::{CallContext, LlmFacade};
use crate::logging::{log_info, log_warn};
use crate::palette::{BatchHandle, PaletteStreamer, SessionManager};
use crate::providers::ChatRequest;
use crate::ratelimit::RateLimiter;
use crate::sms::{HttpSmsGateway, SendStatus, SmsCodeService, VerifyStatus};
use crate::store::CoordinationStore;
use crate::telemetry::TelemetrySink;
use crate::usage::TokenUsageBuffer;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter as GovernorLimiter};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Per-IP budget for the SMS endpoints.
const SMS_REQUESTS_PER_MINUTE: u32 = 10;

/// Everything a handler needs, built once per worker.
pub struct AppState {
    pub config: AppConfig,
    pub store: CoordinationStore,
    pub db: Db,
    pub auth: Authenticator,
    pub limiter: Arc<RateLimiter>,
    pub facade: Arc<LlmFacade>,
    pub sessions: Arc<SessionManager>,
    pub streamer: Arc<PaletteStreamer>,
    pub usage: Arc<TokenUsageBuffer>,
    pub sms: Arc<SmsCodeService>,
    pub telemetry: Arc<TelemetrySink>,
    /// Root of the worker's cancellation tree; background tasks run on
    /// children of it.
    pub shutdown: CancellationToken,
    sms_ip_limiter: DefaultKeyedRateLimiter<IpAddr>,
    provider_rr: AtomicUsize,
}

impl AppState {
    /// Wire the whole worker: store, database, limiter, facade, palette,
    /// buffer, SMS, telemetry, and the background tasks (usage flusher,
    /// session expiry sweep).
    pub async fn from_config(config: AppConfig) -> AppResult<Arc<Self>> {
        let store = CoordinationStore::connect(&config.store_url)
            .await
            .map_err(|_| AppError::unavailable("coordination store"))?;
        let db = Db::connect(&config.database_url, &config.db_pool).await?;

        let telemetry = Arc::new(TelemetrySink::default());
        let limiter = Arc::new(RateLimiter::new(&config.providers, Some(store.clone())));
        let usage = TokenUsageBuffer::new(store.clone(), config.usage_buffer.clone());
        let facade = Arc::new(LlmFacade::new(
            &config.providers,
            Arc::clone(&limiter),
            Arc::clone(&usage) as Arc<dyn crate::usage::UsageSink>,
            Arc::clone(&telemetry),
        )?);
        let sessions = SessionManager::new(config.palette.clone());
        let streamer = Arc::new(PaletteStreamer::new(
            Arc::clone(&facade),
            config.palette.clone(),
        ));
        let gateway = Arc::new(HttpSmsGateway::new(&config.sms)?);
        let sms = Arc::new(SmsCodeService::new(
            store.clone(),
            gateway,
            config.sms.clone(),
        ));
        let auth = Authenticator::new(db.clone(), store.clone());

        let shutdown = CancellationToken::new();
        usage.spawn_flusher(db.clone(), shutdown.child_token());
        sessions.spawn_expiry_sweep(shutdown.child_token());

        let quota = Quota::per_minute(
            NonZeroU32::new(SMS_REQUESTS_PER_MINUTE).expect("nonzero sms quota"),
        );

        Ok(Arc::new(Self {
            config,
            store,
            db,
            auth,
            limiter,
            facade,
            sessions,
            streamer,
            usage,
            sms,
            telemetry,
            shutdown,
            sms_ip_limiter: GovernorLimiter::keyed(quota),
            provider_rr: AtomicUsize::new(0),
        }))
    }

    /// Round-robin provider pick for one-shot generation.
    fn next_provider(&self) -> AppResult<String> {
        let mut ids = self.facade.provider_ids();
        ids.sort();
        if ids.is_empty() {
            return Err(AppError::unavailable("llm providers"));
        }
        let index = self.provider_rr.fetch_add(1, Ordering::Relaxed) % ids.len();
        Ok(ids.swap_remove(index))
    }
}

/// Build the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate_diagram", post(generate_diagram))
        .route("/node_palette/start", post(palette_start))
        .route("/node_palette/next_batch", post(palette_next_batch))
        .route("/node_palette/advance_stage", post(palette_advance_stage))
        .route("/node_palette/close", post(palette_close))
        .route("/sms/send", post(sms_send))
        .route("/sms/verify", post(sms_verify))
        .route("/debug/metrics", get(debug_metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Serve until ctrl-c, then cancel background tasks and drain.
pub async fn serve(state: Arc<AppState>) -> AppResult<()> {
    let bind_addr = state.config.bind_addr.clone();
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| AppError::internal(format!("bind {bind_addr} failed: {e}")))?;
    log_info!(addr = %bind_addr, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        log_info!("Shutdown signal received");
        shutdown.cancel();
    })
    .await
    .map_err(|e| AppError::internal(format!("server error: {e}")))?;

    Ok(())
}

// ============================================================================
// Error mapping
// ============================================================================

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "code": self.code(),
            "message": self.user_message(),
        }));
        (status, body).into_response()
    }
}

// ============================================================================
// Health
// ============================================================================

async fn health(State(state): State<Arc<AppState>>) -> Response {
    // The probe reflects infrastructure availability.
    let db_ok = state.db.ping().await.is_ok();
    let store_ok = state.store.get("health:probe").await.is_ok();

    let (status, word) = if db_ok && store_ok {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        status,
        Json(json!({
            "status": word,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
        .into_response()
}

// ============================================================================
// Diagram generation
// ============================================================================

#[derive(Debug, Deserialize)]
struct GenerateDiagramRequest {
    prompt: String,
    #[serde(default)]
    kind: Option<DiagramKind>,
    #[serde(default)]
    language: Option<String>,
}

async fn generate_diagram(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<GenerateDiagramRequest>,
) -> AppResult<Json<DiagramSpec>> {
    let auth = state.auth.authenticate(&headers).await?;
    if body.prompt.trim().is_empty() {
        return Err(AppError::validation("prompt must not be empty"));
    }
    if body.prompt.len() > 8000 {
        return Err(AppError::validation("prompt too long"));
    }

    let kind = body.kind.unwrap_or_else(|| DiagramKind::infer(&body.prompt));
    let language = body.language.as_deref().unwrap_or("en");
    let provider_id = state.next_provider()?;

    let (system, user) = diagram::diagram_prompt(kind, &body.prompt, language);
    let request = ChatRequest::new(user).with_system(system);

    // If the client disconnects, axum drops this future; the in-flight
    // permit and provider call clean up through their drop paths.
    let ctx = call_context(&auth, "generate_diagram");
    let response = state.facade.chat(&provider_id, &request, &ctx).await?;
    let spec = diagram::parse_diagram_output(&provider_id, &response.content)?;

    Ok(Json(DiagramSpec {
        kind: kind.as_str(),
        spec,
    }))
}

// ============================================================================
// Node palette
// ============================================================================

#[derive(Debug, Deserialize)]
struct PaletteStartRequest {
    topic: String,
    #[serde(default)]
    kind: Option<DiagramKind>,
    /// Earlier-stage content when reopening a palette on a diagram that
    /// already has some; the session starts at the next stage with one
    /// tab per item.
    #[serde(default)]
    existing_items: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PaletteStartResponse {
    session_id: String,
    stage: &'static str,
    tabs: Vec<String>,
}

async fn palette_start(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PaletteStartRequest>,
) -> AppResult<Json<PaletteStartResponse>> {
    let auth = state.auth.authenticate(&headers).await?;
    if body.topic.trim().is_empty() {
        return Err(AppError::validation("topic must not be empty"));
    }

    let kind = body.kind.unwrap_or(DiagramKind::BubbleMap);
    let session = state
        .sessions
        .open(auth.user_id, body.topic, kind, body.existing_items)
        .await;

    Ok(Json(PaletteStartResponse {
        session_id: session.id.clone(),
        stage: session.current_stage(),
        tabs: session.tabs(),
    }))
}

#[derive(Debug, Deserialize)]
struct PaletteBatchRequest {
    session_id: String,
    /// Which tab / category the batch expands, for staged kinds.
    #[serde(default)]
    stage_data: Option<String>,
}

/// Cancels the batch when the SSE response is dropped (client
/// disconnect) or finishes.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

async fn palette_next_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PaletteBatchRequest>,
) -> AppResult<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>> {
    let auth = state.auth.authenticate(&headers).await?;
    let session = state
        .sessions
        .get(&body.session_id)
        .await
        .ok_or_else(|| AppError::validation("unknown or expired session"))?;
    if auth.user_id != 0 && session.user_id != auth.user_id {
        return Err(AppError::auth("session belongs to another user"));
    }

    let BatchHandle { events, cancel } = state
        .streamer
        .next_batch(session, body.stage_data)
        .await?;

    // Moving the guard into the stream ties the batch's lifetime to the
    // response: when the client goes away the stream drops, the guard
    // cancels, and every provider permit releases.
    let guard = CancelOnDrop(cancel);
    let stream = ReceiverStream::new(events).map(move |event| {
        let _ = &guard;
        let sse_event = Event::default()
            .event(event.event_name())
            .json_data(&event)
            .unwrap_or_else(|e| {
                log_warn!(error = %e, "SSE event serialization failed");
                Event::default().event("error").data("{}")
            });
        Ok(sse_event)
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

#[derive(Debug, Deserialize)]
struct PaletteAdvanceRequest {
    session_id: String,
    /// The items the client settled on for the finished stage; they
    /// become the tabs of the next stage.
    #[serde(default)]
    items: Vec<String>,
}

async fn palette_advance_stage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PaletteAdvanceRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let auth = state.auth.authenticate(&headers).await?;
    let session = state
        .sessions
        .get(&body.session_id)
        .await
        .ok_or_else(|| AppError::validation("unknown or expired session"))?;
    if auth.user_id != 0 && session.user_id != auth.user_id {
        return Err(AppError::auth("session belongs to another user"));
    }

    let next = session.advance_stage(body.items)?;
    Ok(Json(json!({ "stage": next, "epoch": session.epoch() })))
}

#[derive(Debug, Deserialize)]
struct PaletteCloseRequest {
    session_id: String,
}

async fn palette_close(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PaletteCloseRequest>,
) -> AppResult<StatusCode> {
    state.auth.authenticate(&headers).await?;
    state.sessions.close(&body.session_id).await;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// SMS
// ============================================================================

#[derive(Debug, Deserialize)]
struct SmsSendRequest {
    phone: String,
    #[serde(default = "default_purpose")]
    purpose: String,
}

#[derive(Debug, Deserialize)]
struct SmsVerifyRequest {
    phone: String,
    code: String,
    #[serde(default = "default_purpose")]
    purpose: String,
}

fn default_purpose() -> String {
    "login".to_string()
}

fn check_sms_ip(state: &AppState, addr: SocketAddr) -> AppResult<()> {
    if state.sms_ip_limiter.check_key(&addr.ip()).is_err() {
        return Err(AppError::quota_exceeded("too many SMS requests from this address"));
    }
    Ok(())
}

async fn sms_send(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<SmsSendRequest>,
) -> AppResult<Response> {
    check_sms_ip(&state, addr)?;

    let status = state.sms.send_code(&body.phone, &body.purpose).await?;
    let response = match status {
        SendStatus::Sent => (StatusCode::OK, Json(json!({ "status": "sent" }))),
        SendStatus::CooldownActive { wait_seconds } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "status": "cooldown_active", "wait": wait_seconds })),
        ),
        SendStatus::HourlyCapReached => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "status": "hourly_cap_reached" })),
        ),
        SendStatus::InvalidPhone => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "invalid_phone" })),
        ),
        SendStatus::GatewayUnavailable => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "status": "gateway_unavailable" })),
        ),
    };
    Ok(response.into_response())
}

async fn sms_verify(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<SmsVerifyRequest>,
) -> AppResult<Response> {
    check_sms_ip(&state, addr)?;

    let status = state
        .sms
        .verify_code(&body.phone, &body.purpose, &body.code)
        .await?;
    let response = match status {
        VerifyStatus::Verified => (StatusCode::OK, Json(json!({ "status": "verified" }))),
        VerifyStatus::Incorrect => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "incorrect" })),
        ),
        VerifyStatus::NoActiveCode => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "no_active_code" })),
        ),
        VerifyStatus::TooManyAttempts => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "status": "too_many_attempts" })),
        ),
    };
    Ok(response.into_response())
}

// ============================================================================
// Debug
// ============================================================================

async fn debug_metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<serde_json::Value>> {
    state.auth.authenticate_admin(&headers).await?;
    Ok(Json(json!({
        "requests": state.telemetry.snapshot(),
        "live_sessions": state.sessions.len().await,
        "usage_fallback_len": state.usage.fallback_len(),
        "db_connections_in_use": state.db.connections_in_use(),
    })))
}

fn call_context(auth: &AuthContext, request_type: &str) -> CallContext {
    CallContext {
        user_id: auth.user_id,
        org_id: auth.org_id,
        api_key_id: auth.api_key_id,
        request_type: request_type.to_string(),
        cancel: CancellationToken::new(),
    }
}
