use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use super::adjuster::{AdjustEvaluation, AutoAdjuster};
use super::ledger::{BudgetLedger, DailyCounter};
use super::mode::{ModeCatalog, OperatingMode};
use super::state::{ModeStateCell, UnresolvedTransition};
use super::GovernorError;

const HISTORY_DAYS: u32 = 7;

/// Coarse health of today's spend, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    /// Hard ceiling reached
    Critical,
    /// Usage past the emergency ratio of the hard ceiling
    Emergency,
    /// Projection says the hard ceiling will be exceeded
    Danger,
    /// Usage past the warning ratio of the hard ceiling
    Warning,
    Normal,
}

impl UsageStatus {
    pub fn classify(
        usage: u32,
        projected: Option<f64>,
        hard_ceiling: u32,
        thresholds: &StatusThresholds,
    ) -> Self {
        let ceiling = f64::from(hard_ceiling);
        let usage_f = f64::from(usage);
        if usage >= hard_ceiling {
            Self::Critical
        } else if usage_f >= ceiling * thresholds.emergency_ratio {
            Self::Emergency
        } else if projected.is_some_and(|p| p > ceiling) {
            Self::Danger
        } else if usage_f >= ceiling * thresholds.warning_ratio {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusThresholds {
    pub warning_ratio: f64,
    pub emergency_ratio: f64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            warning_ratio: 0.80,
            emergency_ratio: 0.90,
        }
    }
}

/// Usage snapshot for status and prediction endpoints.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UsageReport {
    pub date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub current_usage: u32,
    pub active_mode: OperatingMode,
    pub hard_ceiling: u32,
    pub mode_budget: u32,
    /// `None` until enough of the period has elapsed to project
    pub projected_end_of_period: Option<f64>,
    pub remaining_requests: u32,
    pub mode_budget_remaining: u32,
    pub usage_percentage: f64,
    pub mode_usage_percentage: f64,
    pub hourly_rate: f64,
    pub will_exceed_limit: bool,
    pub status: UsageStatus,
    pub auto_adjust_enabled: bool,
    pub last_change_at: Option<DateTime<Utc>>,
    pub last_change_reason: Option<String>,
    pub last_evaluation: Option<AdjustEvaluation>,
    pub unresolved_transition: Option<UnresolvedTransition>,
    pub by_class: IndexMap<String, u32>,
    pub history: Vec<DailyCounter>,
}

/// Read-only aggregation over the ledger and mode state.
pub struct UsageReporter {
    ledger: Arc<BudgetLedger>,
    catalog: Arc<ModeCatalog>,
    state: Arc<ModeStateCell>,
    adjuster: Arc<AutoAdjuster>,
    thresholds: StatusThresholds,
}

impl UsageReporter {
    pub fn new(
        ledger: Arc<BudgetLedger>,
        catalog: Arc<ModeCatalog>,
        state: Arc<ModeStateCell>,
        adjuster: Arc<AutoAdjuster>,
        thresholds: StatusThresholds,
    ) -> Self {
        Self {
            ledger,
            catalog,
            state,
            adjuster,
            thresholds,
        }
    }

    pub async fn report(&self) -> Result<UsageReport, GovernorError> {
        let now = self.ledger.now();
        let usage = self.ledger.current_usage().await?;
        let by_class = self.ledger.class_breakdown().await?;
        let history = self.ledger.usage_history(HISTORY_DAYS).await?;
        let state = self.state.snapshot().await;

        let hard_ceiling = self.ledger.hard_ceiling();
        let mode_budget = self.catalog.budget(state.active_mode);
        let projected = self.adjuster.projection_at(usage, now);

        let elapsed_hours = self.ledger.period().elapsed(now).num_seconds() as f64 / 3600.0;
        let hourly_rate = if elapsed_hours > 0.0 {
            f64::from(usage) / elapsed_hours
        } else {
            0.0
        };

        Ok(UsageReport {
            date: self.ledger.period().date_of(now),
            generated_at: now,
            current_usage: usage,
            active_mode: state.active_mode,
            hard_ceiling,
            mode_budget,
            projected_end_of_period: projected.map(round1),
            remaining_requests: hard_ceiling.saturating_sub(usage),
            mode_budget_remaining: mode_budget.saturating_sub(usage),
            usage_percentage: round1(percentage(usage, hard_ceiling)),
            mode_usage_percentage: round1(percentage(usage, mode_budget)),
            hourly_rate: round1(hourly_rate),
            will_exceed_limit: projected.is_some_and(|p| p > f64::from(hard_ceiling)),
            status: UsageStatus::classify(usage, projected, hard_ceiling, &self.thresholds),
            auto_adjust_enabled: state.auto_adjust_enabled,
            last_change_at: state.last_change_at,
            last_change_reason: state.last_change_reason,
            last_evaluation: self.adjuster.last_evaluation().await,
            unresolved_transition: self.state.unresolved().await,
            by_class,
            history,
        })
    }
}

fn percentage(part: u32, whole: u32) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    f64::from(part) / f64::from(whole) * 100.0
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
