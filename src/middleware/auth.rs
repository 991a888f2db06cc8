use axum::{
    body::Body,
    extract::Extension,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::error::ErrorResponse;

pub const API_KEY_HEADER: &str = "X-API-Key";

/// Key guarding the operator override endpoints
#[derive(Clone)]
pub struct OperatorApiKey(pub Option<String>);

/// Require the operator key on mode overrides.
///
/// With no key configured every request passes (development mode).
pub async fn require_operator_key(
    Extension(OperatorApiKey(expected_key)): Extension<OperatorApiKey>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = expected_key else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    let rejection = match provided {
        Some(key) if key == expected => return next.run(request).await,
        Some(_) => ErrorResponse::with_code("Invalid operator API key", "INVALID_API_KEY"),
        None => ErrorResponse::with_code(
            "Operator API key required. Provide X-API-Key header.",
            "MISSING_API_KEY",
        ),
    };

    tracing::warn!(
        path = %request.uri().path(),
        code = ?rejection.code,
        "Rejected operator request"
    );
    (StatusCode::UNAUTHORIZED, Json(rejection)).into_response()
}
