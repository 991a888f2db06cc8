use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use super::ledger::{BudgetLedger, SpendOutcome};
use super::mode::{ModeCatalog, OperatingMode, Priority};
use super::state::ModeStateCell;
use super::GovernorError;

/// Outcome of an admission check. Denials are ordinary results that callers
/// branch on, typically by serving cached data instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    DeniedHardCeiling,
    DeniedModeBudget,
    DeniedNotInSchedule,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Self::Allowed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::DeniedHardCeiling => "denied_hard_ceiling",
            Self::DeniedModeBudget => "denied_mode_budget",
            Self::DeniedNotInSchedule => "denied_not_in_schedule",
        }
    }
}

/// A decision together with the mode it was made under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub decision: Decision,
    pub mode: OperatingMode,
}

/// The admission rules, in order, stopping at the first denial:
///
/// 1. usage at or above the hard ceiling is always denied, whatever the priority
/// 2. usage at or above the mode budget is denied unless the priority is the highest tier
/// 3. a class missing from the mode's schedule is denied
/// 4. everything else is allowed
pub fn decide(
    catalog: &ModeCatalog,
    mode: OperatingMode,
    usage: u32,
    resource_class: &str,
    priority: Priority,
) -> Decision {
    if usage >= catalog.hard_ceiling() {
        return Decision::DeniedHardCeiling;
    }

    if usage >= catalog.budget(mode) && !priority.is_highest() {
        return Decision::DeniedModeBudget;
    }

    if catalog.allowance(mode, resource_class).is_none() {
        return Decision::DeniedNotInSchedule;
    }

    Decision::Allowed
}

/// Synchronous gate in front of every upstream call.
pub struct AdmissionController {
    ledger: Arc<BudgetLedger>,
    catalog: Arc<ModeCatalog>,
    state: Arc<ModeStateCell>,
}

impl AdmissionController {
    pub fn new(
        ledger: Arc<BudgetLedger>,
        catalog: Arc<ModeCatalog>,
        state: Arc<ModeStateCell>,
    ) -> Self {
        Self {
            ledger,
            catalog,
            state,
        }
    }

    /// Decide whether a call for `resource_class` may go upstream now.
    ///
    /// Reads the ledger only. A ledger failure is returned as an error and must
    /// be treated as a denial.
    pub async fn evaluate(
        &self,
        resource_class: &str,
        priority: Priority,
    ) -> Result<Admission, GovernorError> {
        let usage = self.ledger.current_usage().await?;
        let mode = self.state.snapshot().await.active_mode;

        let decision = decide(&self.catalog, mode, usage, resource_class, priority);
        self.observe(decision, mode, usage, resource_class, priority);
        Ok(Admission { decision, mode })
    }

    /// Evaluate and, when allowed, record the spend right away.
    ///
    /// The ledger increment re-checks the hard ceiling atomically, so a call
    /// that passed evaluation but lost the race for the last slot comes back
    /// as `DeniedHardCeiling`.
    pub async fn admit(
        &self,
        resource_class: &str,
        priority: Priority,
    ) -> Result<Admission, GovernorError> {
        let admission = self.evaluate(resource_class, priority).await?;
        if !admission.decision.is_allowed() {
            return Ok(admission);
        }

        match self.ledger.try_record_spend(resource_class).await? {
            SpendOutcome::Recorded { .. } => Ok(admission),
            SpendOutcome::CeilingReached { .. } => {
                metrics::counter!(
                    "quotagate_decisions_total",
                    "decision" => "denied_hard_ceiling_on_record"
                )
                .increment(1);
                Ok(Admission {
                    decision: Decision::DeniedHardCeiling,
                    ..admission
                })
            }
        }
    }

    fn observe(
        &self,
        decision: Decision,
        mode: OperatingMode,
        usage: u32,
        resource_class: &str,
        priority: Priority,
    ) {
        metrics::counter!("quotagate_decisions_total", "decision" => decision.as_str())
            .increment(1);

        match decision {
            Decision::Allowed => tracing::debug!(
                resource_class = %resource_class,
                ?priority,
                mode = %mode,
                usage,
                "Admission allowed"
            ),
            Decision::DeniedHardCeiling => tracing::warn!(
                resource_class = %resource_class,
                ?priority,
                usage,
                ceiling = self.catalog.hard_ceiling(),
                "Admission denied: hard ceiling reached"
            ),
            Decision::DeniedModeBudget => tracing::info!(
                resource_class = %resource_class,
                ?priority,
                mode = %mode,
                usage,
                budget = self.catalog.budget(mode),
                "Admission denied: mode budget exceeded"
            ),
            Decision::DeniedNotInSchedule => tracing::info!(
                resource_class = %resource_class,
                mode = %mode,
                "Admission denied: class not in mode schedule"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::clock::{Clock, ManualClock};
    use crate::governor::ledger::tests::FailingLedgerStore;
    use crate::governor::ledger::{BudgetPeriod, LedgerStore, MemoryLedgerStore};
    use crate::governor::state::{MemoryModeStateStore, ModeStateStore};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    async fn controller_with(
        store: Arc<dyn LedgerStore>,
        mode: OperatingMode,
    ) -> (AdmissionController, Arc<BudgetLedger>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 15, 12, 0, 0).unwrap(),
        ));
        let catalog = Arc::new(ModeCatalog::builtin());
        let ledger = Arc::new(BudgetLedger::new(
            store,
            BudgetPeriod::utc(),
            catalog.hard_ceiling(),
            Duration::from_millis(200),
            clock,
        ));
        let state_store: Arc<dyn ModeStateStore> = Arc::new(MemoryModeStateStore::new());
        let state = Arc::new(
            ModeStateCell::load_or_init(state_store, mode, Duration::from_millis(200))
                .await
                .unwrap(),
        );
        (
            AdmissionController::new(Arc::clone(&ledger), catalog, state),
            ledger,
        )
    }

    async fn spend(ledger: &BudgetLedger, n: u32) {
        for _ in 0..n {
            ledger.try_record_spend("fixtures").await.unwrap();
        }
    }

    #[test]
    fn test_hard_ceiling_overrides_everything() {
        let catalog = ModeCatalog::builtin();
        for mode in OperatingMode::ALL {
            for priority in [Priority::Normal, Priority::High, Priority::Critical] {
                for class in ["fixtures", "live", "unknown"] {
                    assert_eq!(
                        decide(&catalog, mode, 1000, class, priority),
                        Decision::DeniedHardCeiling
                    );
                    assert_eq!(
                        decide(&catalog, mode, 1500, class, priority),
                        Decision::DeniedHardCeiling
                    );
                }
            }
        }
    }

    #[test]
    fn test_not_in_schedule_even_at_zero_usage() {
        let catalog = ModeCatalog::builtin();
        assert_eq!(
            decide(&catalog, OperatingMode::Minimal, 0, "lineups", Priority::Critical),
            Decision::DeniedNotInSchedule
        );
        assert_eq!(
            decide(&catalog, OperatingMode::Maximum, 0, "weather", Priority::Normal),
            Decision::DeniedNotInSchedule
        );
    }

    #[test]
    fn test_mode_budget_only_lets_critical_through() {
        let catalog = ModeCatalog::builtin();
        assert_eq!(
            decide(&catalog, OperatingMode::Low, 300, "fixtures", Priority::High),
            Decision::DeniedModeBudget
        );
        assert_eq!(
            decide(&catalog, OperatingMode::Low, 300, "live", Priority::Critical),
            Decision::Allowed
        );
        // Critical priority does not bypass the schedule
        assert_eq!(
            decide(&catalog, OperatingMode::Low, 300, "lineups", Priority::Critical),
            Decision::DeniedNotInSchedule
        );
        assert_eq!(
            decide(&catalog, OperatingMode::Low, 299, "fixtures", Priority::Normal),
            Decision::Allowed
        );
    }

    #[tokio::test]
    async fn test_low_mode_at_budget_scenario() {
        let (controller, ledger) =
            controller_with(Arc::new(MemoryLedgerStore::new()), OperatingMode::Low).await;
        spend(&ledger, 300).await;

        assert_eq!(
            controller.evaluate("fixtures", Priority::Normal).await.unwrap().decision,
            Decision::DeniedModeBudget
        );
        assert_eq!(
            controller.evaluate("live", Priority::Critical).await.unwrap().decision,
            Decision::Allowed
        );
    }

    #[tokio::test]
    async fn test_at_hard_ceiling_scenario() {
        let (controller, ledger) =
            controller_with(Arc::new(MemoryLedgerStore::new()), OperatingMode::Maximum).await;
        spend(&ledger, 1000).await;

        for priority in [Priority::Normal, Priority::High, Priority::Critical] {
            assert_eq!(
                controller.evaluate("live", priority).await.unwrap().decision,
                Decision::DeniedHardCeiling
            );
        }
        assert_eq!(
            controller.admit("live", Priority::Critical).await.unwrap().decision,
            Decision::DeniedHardCeiling
        );
        assert_eq!(ledger.current_usage().await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_admission_carries_mode_it_was_decided_under() {
        let (controller, _ledger) =
            controller_with(Arc::new(MemoryLedgerStore::new()), OperatingMode::High).await;

        let admission = controller.admit("lineups", Priority::Normal).await.unwrap();
        assert_eq!(
            admission,
            Admission {
                decision: Decision::Allowed,
                mode: OperatingMode::High,
            }
        );
        let admission = controller.evaluate("weather", Priority::Normal).await.unwrap();
        assert_eq!(admission.mode, OperatingMode::High);
    }

    #[tokio::test]
    async fn test_ledger_failure_is_not_permission() {
        let (controller, _ledger) =
            controller_with(Arc::new(FailingLedgerStore), OperatingMode::Maximum).await;

        let result = controller.evaluate("fixtures", Priority::Critical).await;
        assert!(matches!(result, Err(GovernorError::LedgerUnavailable(_))));

        let result = controller.admit("fixtures", Priority::Critical).await;
        assert!(matches!(result, Err(GovernorError::LedgerUnavailable(_))));
    }

    #[tokio::test]
    async fn test_admit_records_only_allowed_calls() {
        let (controller, ledger) =
            controller_with(Arc::new(MemoryLedgerStore::new()), OperatingMode::Minimal).await;

        assert_eq!(
            controller.admit("fixtures", Priority::Normal).await.unwrap().decision,
            Decision::Allowed
        );
        assert_eq!(
            controller.admit("lineups", Priority::Normal).await.unwrap().decision,
            Decision::DeniedNotInSchedule
        );
        assert_eq!(ledger.current_usage().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_evaluate_and_record_never_exceed_ceiling() {
        let (controller, ledger) =
            controller_with(Arc::new(MemoryLedgerStore::new()), OperatingMode::Maximum).await;
        let controller = Arc::new(controller);
        spend(&ledger, 990).await;

        let mut handles = Vec::new();
        for i in 0..50 {
            let controller = Arc::clone(&controller);
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                let class = ["live", "fixtures", "lineups"][i % 3];
                for _ in 0..5 {
                    // Two-step use: evaluate first, record after the upstream call
                    let admission = controller.evaluate(class, Priority::Critical).await.unwrap();
                    if admission.decision.is_allowed() {
                        tokio::task::yield_now().await;
                        ledger.try_record_spend(class).await.unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ledger.current_usage().await.unwrap(), 1000);
    }
}
