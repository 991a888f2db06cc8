pub mod adjuster;
pub mod admission;
pub mod clock;
pub mod freshness;
pub mod handlers;
pub mod ledger;
pub mod mode;
pub mod reporter;
pub mod state;

pub use adjuster::{AdjustEvaluation, AdjustPolicy, AutoAdjuster};
pub use admission::{Admission, AdmissionController, Decision};
pub use clock::{Clock, SystemClock};
pub use freshness::{CacheEntry, FreshnessPolicy};
pub use ledger::{
    BudgetLedger, BudgetPeriod, DailyCounter, LedgerStore, MemoryLedgerStore, SpendOutcome,
};
pub use mode::{ModeCatalog, OperatingMode, Priority};
pub use reporter::{StatusThresholds, UsageReport, UsageReporter};
pub use state::{MemoryModeStateStore, ModeState, ModeStateCell, ModeStateStore, ModeTransition};

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use utoipa::ToSchema;

use crate::cache::CacheIndex;
use crate::error::HttpError;
use crate::impl_into_response;

#[derive(Error, Debug)]
pub enum GovernorError {
    #[error("Budget ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Mode state unavailable: {0}")]
    ModeStateUnavailable(String),

    #[error("Unknown operating mode: {0}")]
    UnknownMode(String),

    #[error("Invalid mode catalog: {0}")]
    InvalidCatalog(String),

    #[error("Invalid governor configuration: {0}")]
    InvalidConfig(String),

    #[error("Cache index unavailable: {0}")]
    CacheUnavailable(String),
}

impl HttpError for GovernorError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::LedgerUnavailable(_)
            | Self::ModeStateUnavailable(_)
            | Self::CacheUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UnknownMode(_) => StatusCode::BAD_REQUEST,
            Self::InvalidCatalog(_) | Self::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::LedgerUnavailable(_) => Some("LEDGER_UNAVAILABLE"),
            Self::ModeStateUnavailable(_) => Some("MODE_STATE_UNAVAILABLE"),
            Self::UnknownMode(_) => Some("UNKNOWN_MODE"),
            Self::InvalidCatalog(_) => Some("INVALID_CATALOG"),
            Self::InvalidConfig(_) => Some("INVALID_CONFIG"),
            Self::CacheUnavailable(_) => Some("CACHE_UNAVAILABLE"),
        }
    }
}

impl_into_response!(GovernorError);

/// Tunables the governor is assembled from.
#[derive(Debug, Clone)]
pub struct GovernorSettings {
    pub catalog: ModeCatalog,
    pub freshness: FreshnessPolicy,
    pub period: BudgetPeriod,
    pub initial_mode: OperatingMode,
    pub store_timeout: Duration,
    pub adjust: AdjustPolicy,
    pub thresholds: StatusThresholds,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            catalog: ModeCatalog::builtin(),
            freshness: FreshnessPolicy::builtin(),
            period: BudgetPeriod::utc(),
            initial_mode: OperatingMode::Standard,
            store_timeout: Duration::from_secs(2),
            adjust: AdjustPolicy::default(),
            thresholds: StatusThresholds::default(),
        }
    }
}

/// Freshness answer for one cache key.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FreshnessView {
    pub resource_key: String,
    pub resource_class: String,
    pub fresh: bool,
    /// Callers seek admission for a fetch only when this is set
    pub needs_refresh: bool,
    pub fetched_at: Option<DateTime<Utc>>,
    pub ttl_secs: i64,
    pub age_secs: Option<i64>,
    /// Age divided by TTL; at or above 1.0 the entry is due for refresh
    pub age_ratio: Option<f64>,
}

/// One row of the mode comparison table.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ModeSummary {
    pub mode: OperatingMode,
    pub budget: u32,
    pub description: String,
    pub resource_classes: Vec<String>,
    pub includes_live_updates: bool,
    pub planned_calls: u32,
    pub active: bool,
}

/// Entry point tying the catalog, ledger, mode state, admission, auto-adjust,
/// reporting and cache freshness together.
pub struct Governor {
    catalog: Arc<ModeCatalog>,
    freshness: FreshnessPolicy,
    ledger: Arc<BudgetLedger>,
    state: Arc<ModeStateCell>,
    admission: AdmissionController,
    adjuster: Arc<AutoAdjuster>,
    reporter: UsageReporter,
    cache: Arc<CacheIndex>,
}

impl Governor {
    /// Assemble the governor, loading (or creating) the persisted mode state.
    pub async fn start(
        settings: GovernorSettings,
        ledger_store: Arc<dyn LedgerStore>,
        mode_store: Arc<dyn ModeStateStore>,
        cache: Arc<CacheIndex>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GovernorError> {
        settings.catalog.validate()?;

        let catalog = Arc::new(settings.catalog);
        let ledger = Arc::new(BudgetLedger::new(
            ledger_store,
            settings.period,
            catalog.hard_ceiling(),
            settings.store_timeout,
            clock,
        ));
        let state = Arc::new(
            ModeStateCell::load_or_init(mode_store, settings.initial_mode, settings.store_timeout)
                .await?,
        );
        let admission = AdmissionController::new(
            Arc::clone(&ledger),
            Arc::clone(&catalog),
            Arc::clone(&state),
        );
        let adjuster = Arc::new(AutoAdjuster::new(
            Arc::clone(&ledger),
            Arc::clone(&catalog),
            Arc::clone(&state),
            settings.adjust,
        ));
        let reporter = UsageReporter::new(
            Arc::clone(&ledger),
            Arc::clone(&catalog),
            Arc::clone(&state),
            Arc::clone(&adjuster),
            settings.thresholds,
        );

        tracing::info!(
            hard_ceiling = catalog.hard_ceiling(),
            timezone = %ledger.period().timezone(),
            "Governor started"
        );

        Ok(Self {
            catalog,
            freshness: settings.freshness,
            ledger,
            state,
            admission,
            adjuster,
            reporter,
            cache,
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.ledger.now()
    }

    pub async fn mode_state(&self) -> ModeState {
        self.state.snapshot().await
    }

    pub async fn evaluate(
        &self,
        resource_class: &str,
        priority: Priority,
    ) -> Result<Admission, GovernorError> {
        self.admission.evaluate(resource_class, priority).await
    }

    pub async fn admit(
        &self,
        resource_class: &str,
        priority: Priority,
    ) -> Result<Admission, GovernorError> {
        self.admission.admit(resource_class, priority).await
    }

    /// Record a call that was already made upstream.
    pub async fn record_spend(&self, resource_class: &str) -> Result<SpendOutcome, GovernorError> {
        self.ledger.try_record_spend(resource_class).await
    }

    pub fn freshness(&self, resource_key: &str, resource_class: &str) -> FreshnessView {
        let now = self.now();
        let entry = self.cache.get(resource_class, resource_key);
        let ttl = self.freshness.ttl(resource_class);

        FreshnessView {
            resource_key: resource_key.to_string(),
            resource_class: resource_class.to_string(),
            fresh: self.freshness.is_fresh(entry.as_ref(), resource_class, now),
            needs_refresh: self
                .freshness
                .needs_refresh(entry.as_ref(), resource_class, now),
            fetched_at: entry.as_ref().map(|e| e.fetched_at),
            ttl_secs: ttl.num_seconds(),
            age_secs: entry.as_ref().map(|e| (now - e.fetched_at).num_seconds()),
            age_ratio: self.freshness.age_ratio(entry.as_ref(), resource_class, now),
        }
    }

    /// Note a successful upstream fetch. Defaults to now when no time is given.
    pub async fn record_fetch(
        &self,
        resource_key: &str,
        resource_class: &str,
        fetched_at: Option<DateTime<Utc>>,
    ) -> Result<CacheEntry, GovernorError> {
        let fetched_at = fetched_at.unwrap_or_else(|| self.now());
        let entry = CacheEntry::new(resource_key, resource_class, fetched_at);
        self.cache.record(entry.clone()).await.map_err(|e| {
            tracing::error!(
                error = %e,
                resource_class = %resource_class,
                "Failed to persist cache entry"
            );
            GovernorError::CacheUnavailable(e.to_string())
        })?;
        Ok(entry)
    }

    pub async fn report(&self) -> Result<UsageReport, GovernorError> {
        self.reporter.report().await
    }

    /// Operator override of the active mode. Skips the projection; the hard
    /// ceiling still applies to every later admission.
    pub async fn set_mode(
        &self,
        mode: OperatingMode,
        reason: &str,
    ) -> Result<ModeTransition, GovernorError> {
        let writer = self.state.lock().await;
        let current = writer.current().await;
        let now = self.now();

        let reason = if reason.trim().is_empty() {
            "operator override".to_string()
        } else {
            reason.trim().to_string()
        };

        let next = ModeState {
            active_mode: mode,
            last_change_at: Some(now),
            last_change_reason: Some(reason.clone()),
            ..current.clone()
        };
        writer.commit(next).await?;
        writer.clear_unresolved().await;

        metrics::counter!("quotagate_mode_transitions_total", "source" => "operator")
            .increment(1);
        tracing::info!(
            from = %current.active_mode,
            to = %mode,
            reason = %reason,
            "Operator set operating mode"
        );

        Ok(ModeTransition {
            from: current.active_mode,
            to: mode,
            reason,
            at: now,
            applied: true,
        })
    }

    pub async fn set_auto_adjust(&self, enabled: bool) -> Result<ModeState, GovernorError> {
        let writer = self.state.lock().await;
        let current = writer.current().await;
        if current.auto_adjust_enabled == enabled {
            return Ok(current);
        }

        let next = ModeState {
            auto_adjust_enabled: enabled,
            ..current
        };
        let stored = writer.commit(next).await?;
        tracing::info!(enabled, "Operator toggled auto-adjust");
        Ok(stored)
    }

    /// Run the auto-adjuster against the current time.
    pub async fn reconsider(&self) -> Result<Option<ModeTransition>, GovernorError> {
        self.adjuster.reconsider(self.now()).await
    }

    pub async fn last_evaluation(&self) -> Option<AdjustEvaluation> {
        self.adjuster.last_evaluation().await
    }

    pub async fn modes(&self) -> Vec<ModeSummary> {
        let active = self.state.snapshot().await.active_mode;
        self.catalog
            .ordered()
            .iter()
            .map(|&mode| {
                let schedule = self.catalog.schedule(mode);
                ModeSummary {
                    mode,
                    budget: self.catalog.budget(mode),
                    description: self.catalog.description(mode).to_string(),
                    resource_classes: schedule.keys().cloned().collect(),
                    includes_live_updates: schedule.keys().any(|class| class.starts_with("live")),
                    planned_calls: self.catalog.planned_calls(mode),
                    active: mode == active,
                }
            })
            .collect()
    }
}
