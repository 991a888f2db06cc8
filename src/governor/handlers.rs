use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{
    AdjustEvaluation, Admission, Decision, FreshnessView, GovernorError, ModeState, ModeSummary,
    ModeTransition, OperatingMode, Priority, SpendOutcome, UsageReport,
};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AdmissionRequest {
    pub resource_class: String,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DecisionResponse {
    pub resource_class: String,
    pub priority: Priority,
    pub decision: Decision,
    pub allowed: bool,
    pub active_mode: OperatingMode,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SpendRequest {
    pub resource_class: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RecordFetchRequest {
    /// Defaults to the time the request is handled
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetModeRequest {
    pub mode: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AutoAdjustRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReconsiderResponse {
    /// `None` when the mode stays where it is
    pub transition: Option<ModeTransition>,
    pub evaluation: Option<AdjustEvaluation>,
}

/// Health check endpoint
///
/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Prometheus scrape endpoint
///
/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

/// Current usage, projection and mode
///
/// GET /api/v1/governor/status
pub async fn status(State(state): State<AppState>) -> Result<Json<UsageReport>, GovernorError> {
    Ok(Json(state.governor.report().await?))
}

/// Compare all operating modes
///
/// GET /api/v1/governor/modes
pub async fn modes(State(state): State<AppState>) -> Json<Vec<ModeSummary>> {
    Json(state.governor.modes().await)
}

/// Check whether a call may go upstream, without recording it
///
/// POST /api/v1/governor/evaluate
pub async fn evaluate(
    State(state): State<AppState>,
    Json(request): Json<AdmissionRequest>,
) -> Result<Json<DecisionResponse>, GovernorError> {
    let admission = state
        .governor
        .evaluate(&request.resource_class, request.priority)
        .await?;
    Ok(Json(decision_response(request, admission)))
}

/// Check and, when allowed, record the call in one step
///
/// POST /api/v1/governor/admit
pub async fn admit(
    State(state): State<AppState>,
    Json(request): Json<AdmissionRequest>,
) -> Result<Json<DecisionResponse>, GovernorError> {
    let admission = state
        .governor
        .admit(&request.resource_class, request.priority)
        .await?;
    Ok(Json(decision_response(request, admission)))
}

fn decision_response(request: AdmissionRequest, admission: Admission) -> DecisionResponse {
    DecisionResponse {
        resource_class: request.resource_class,
        priority: request.priority,
        decision: admission.decision,
        allowed: admission.decision.is_allowed(),
        active_mode: admission.mode,
    }
}

/// Record an upstream call that was made
///
/// POST /api/v1/governor/spend
pub async fn spend(
    State(state): State<AppState>,
    Json(request): Json<SpendRequest>,
) -> Result<(StatusCode, Json<SpendOutcome>), GovernorError> {
    let outcome = state.governor.record_spend(&request.resource_class).await?;
    let status = if outcome.is_recorded() {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    Ok((status, Json(outcome)))
}

/// Freshness of one cache key, and whether it needs a refresh
///
/// GET /api/v1/cache/{class}/{key}/freshness
pub async fn freshness(
    State(state): State<AppState>,
    Path((class, key)): Path<(String, String)>,
) -> Json<FreshnessView> {
    Json(state.governor.freshness(&key, &class))
}

/// Note a successful upstream fetch for a cache key
///
/// PUT /api/v1/cache/{class}/{key}
pub async fn record_fetch(
    State(state): State<AppState>,
    Path((class, key)): Path<(String, String)>,
    Json(request): Json<RecordFetchRequest>,
) -> Result<Json<FreshnessView>, GovernorError> {
    state
        .governor
        .record_fetch(&key, &class, request.fetched_at)
        .await?;
    Ok(Json(state.governor.freshness(&key, &class)))
}

/// Operator override of the active mode
///
/// PUT /api/v1/governor/mode
pub async fn set_mode(
    State(state): State<AppState>,
    Json(request): Json<SetModeRequest>,
) -> Result<Json<ModeTransition>, GovernorError> {
    let mode: OperatingMode = request.mode.parse()?;
    let reason = request.reason.unwrap_or_default();
    Ok(Json(state.governor.set_mode(mode, &reason).await?))
}

/// Turn the auto-adjuster on or off
///
/// PUT /api/v1/governor/auto-adjust
pub async fn set_auto_adjust(
    State(state): State<AppState>,
    Json(request): Json<AutoAdjustRequest>,
) -> Result<Json<ModeState>, GovernorError> {
    Ok(Json(state.governor.set_auto_adjust(request.enabled).await?))
}

/// Run the auto-adjuster now instead of waiting for the schedule
///
/// POST /api/v1/governor/reconsider
pub async fn reconsider(
    State(state): State<AppState>,
) -> Result<Json<ReconsiderResponse>, GovernorError> {
    let transition = state.governor.reconsider().await?;
    Ok(Json(ReconsiderResponse {
        transition,
        evaluation: state.governor.last_evaluation().await,
    }))
}
