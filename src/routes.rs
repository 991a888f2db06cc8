use axum::{
    error_handling::HandleErrorLayer,
    http::StatusCode,
    middleware,
    routing::{get, post, put},
    BoxError, Extension, Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::governor::handlers;
use crate::middleware::{require_operator_key, OperatorApiKey};
use crate::openapi::swagger_ui;
use crate::AppState;

const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Read and admission endpoints used by the fetchers
fn governor_routes() -> Router<AppState> {
    Router::new()
        .route("/governor/status", get(handlers::status))
        .route("/governor/modes", get(handlers::modes))
        .route("/governor/evaluate", post(handlers::evaluate))
        .route("/governor/admit", post(handlers::admit))
        .route("/governor/spend", post(handlers::spend))
}

/// Operator overrides (protected by API key auth)
fn operator_routes(api_key: Option<String>) -> Router<AppState> {
    Router::new()
        .route("/governor/mode", put(handlers::set_mode))
        .route("/governor/auto-adjust", put(handlers::set_auto_adjust))
        .route("/governor/reconsider", post(handlers::reconsider))
        .layer(middleware::from_fn(require_operator_key))
        .layer(Extension(OperatorApiKey(api_key)))
}

fn cache_routes() -> Router<AppState> {
    Router::new()
        .route("/cache/{class}/{key}", put(handlers::record_fetch))
        .route("/cache/{class}/{key}/freshness", get(handlers::freshness))
}

pub fn api_v1_routes(operator_api_key: Option<String>) -> Router<AppState> {
    Router::new()
        .merge(governor_routes())
        .merge(cache_routes())
        .merge(operator_routes(operator_api_key))
}

async fn handle_timeout_error(err: BoxError) -> (StatusCode, String) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::REQUEST_TIMEOUT, "Request timed out".to_string())
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal error: {}", err),
        )
    }
}

/// Build the complete application router
pub fn build_router(state: AppState, operator_api_key: Option<String>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .nest("/api/v1", api_v1_routes(operator_api_key))
        .merge(swagger_ui())
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
