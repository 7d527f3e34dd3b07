//! HTTP interface for collectors, the CLI, and dashboards.
//!
//! Collectors never see internal errors: the report endpoint always
//! answers with a decision, falling back to deny. Query endpoints expose
//! structured fields only, never raw error chains.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::Sentinel;
use crate::error::SentinelError;
use crate::types::{AttemptReport, Severity};

/// Build the sentinel router.
pub fn build_router(engine: Sentinel) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/attempts", post(report_attempt_handler))
        .route("/api/health", get(health_handler))
        .route("/api/alerts", get(alerts_handler))
        .route("/api/breakers", get(breakers_handler))
        .route("/api/plans", get(plans_handler))
        .route("/api/sources/{id}/allow", get(allow_handler))
        .route("/api/sources/{id}/test", post(test_handler))
        .route("/api/sources/{id}/reset", post(reset_handler))
        .route("/api/sources/{id}/history", get(history_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Serve the HTTP interface until the process exits.
pub async fn serve(engine: Sentinel, bind: &str) -> anyhow::Result<()> {
    let router = build_router(engine);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind = %bind, "Sentinel HTTP interface listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Structured error body; raw error chains never leave the process.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error_kind: &'static str,
    message: String,
}

impl IntoResponse for SentinelError {
    fn into_response(self) -> Response {
        let (status, error_kind) = match &self {
            SentinelError::UnknownSource(_) => (StatusCode::NOT_FOUND, "unknown_source"),
            SentinelError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            SentinelError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "persistence"),
        };
        (
            status,
            Json(ErrorBody {
                error_kind,
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn report_attempt_handler(
    State(engine): State<Sentinel>,
    Json(report): Json<AttemptReport>,
) -> impl IntoResponse {
    Json(engine.report_attempt(report).await)
}

#[derive(Debug, Deserialize)]
struct HealthParams {
    source_id: Option<String>,
}

async fn health_handler(
    State(engine): State<Sentinel>,
    Query(params): Query<HealthParams>,
) -> impl IntoResponse {
    Json(engine.get_health(params.source_id.as_deref()).await)
}

#[derive(Debug, Deserialize)]
struct AlertParams {
    severity: Option<String>,
}

async fn alerts_handler(
    State(engine): State<Sentinel>,
    Query(params): Query<AlertParams>,
) -> Result<Response, SentinelError> {
    let min_severity = params
        .severity
        .as_deref()
        .map(str::parse::<Severity>)
        .transpose()
        .map_err(SentinelError::InvalidRequest)?;
    Ok(Json(engine.get_active_alerts(min_severity).await).into_response())
}

async fn breakers_handler(State(engine): State<Sentinel>) -> impl IntoResponse {
    Json(engine.get_breaker_states().await)
}

async fn plans_handler(State(engine): State<Sentinel>) -> impl IntoResponse {
    Json(engine.get_recovery_plans().await)
}

async fn allow_handler(
    State(engine): State<Sentinel>,
    Path(source_id): Path<String>,
) -> impl IntoResponse {
    Json(engine.allow(&source_id).await)
}

async fn test_handler(
    State(engine): State<Sentinel>,
    Path(source_id): Path<String>,
) -> Result<Response, SentinelError> {
    let decision = engine.test_connection(&source_id).await?;
    Ok(Json(decision).into_response())
}

#[derive(Debug, Deserialize)]
struct ResetRequest {
    /// Operator identity for the audit log
    actor: String,
}

async fn reset_handler(
    State(engine): State<Sentinel>,
    Path(source_id): Path<String>,
    Json(request): Json<ResetRequest>,
) -> Result<Response, SentinelError> {
    if request.actor.trim().is_empty() {
        return Err(SentinelError::InvalidRequest(
            "actor identity is required for a break-glass reset".to_string(),
        ));
    }
    let state = engine.force_reset(&source_id, request.actor.trim()).await?;
    Ok(Json(state).into_response())
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    /// RFC 3339 lower bound; defaults to the last 24 hours
    since: Option<DateTime<Utc>>,
}

async fn history_handler(
    State(engine): State<Sentinel>,
    Path(source_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Response, SentinelError> {
    let since = params.since.unwrap_or_else(|| Utc::now() - Duration::hours(24));
    let attempts = engine.get_history(&source_id, since).await?;
    Ok(Json(attempts).into_response())
}
