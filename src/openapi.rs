use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::error::ErrorResponse;
use crate::governor::handlers::{
    AdmissionRequest, AutoAdjustRequest, DecisionResponse, ReconsiderResponse, RecordFetchRequest,
    SetModeRequest, SpendRequest,
};
use crate::governor::reporter::UsageStatus;
use crate::governor::state::UnresolvedTransition;
use crate::governor::{
    AdjustEvaluation, CacheEntry, DailyCounter, Decision, FreshnessView, ModeState, ModeSummary,
    ModeTransition, OperatingMode, Priority, SpendOutcome, UsageReport,
};

/// OpenAPI documentation for the quotagate API
///
/// Covers the request and response schemas; handlers carry no path annotations yet.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Quotagate API",
        version = "1.0.0",
        description = "Adaptive request budget governor and cache freshness gate in front of a rate-limited football data API.",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    tags(
        (name = "governor", description = "Admission decisions, spend recording and usage status"),
        (name = "cache", description = "Cache entry freshness"),
        (name = "operator", description = "Mode overrides, guarded by X-API-Key")
    ),
    components(
        schemas(
            ErrorResponse,
            OperatingMode,
            Priority,
            Decision,
            AdmissionRequest,
            DecisionResponse,
            SpendRequest,
            SpendOutcome,
            UsageReport,
            UsageStatus,
            DailyCounter,
            AdjustEvaluation,
            UnresolvedTransition,
            ModeSummary,
            ModeState,
            ModeTransition,
            SetModeRequest,
            AutoAdjustRequest,
            ReconsiderResponse,
            CacheEntry,
            FreshnessView,
            RecordFetchRequest,
        )
    )
)]
pub struct ApiDoc;

/// Create the Swagger UI router
pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi())
}
