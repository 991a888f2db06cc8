use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use utoipa::ToSchema;

use super::ledger::BudgetLedger;
use super::mode::{ModeCatalog, OperatingMode};
use super::state::{ModeState, ModeStateCell, ModeTransition};
use super::GovernorError;

/// Tuning for the projection-driven mode selection.
///
/// Boundary values always resolve to the lower mode: reaching a downgrade
/// trigger exactly downgrades, and reaching an upgrade limit exactly does not
/// upgrade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdjustPolicy {
    /// Fraction above the active budget the projection may reach before a downgrade
    pub tolerance: f64,
    /// Fraction below the active budget the projection must fall before an upgrade
    pub hysteresis: f64,
    /// Fraction of the hard ceiling an upgraded mode's estimated spend must stay under
    pub upgrade_headroom: f64,
    /// Minimum elapsed time in the period before projecting at all
    pub min_elapsed: TimeDelta,
}

impl Default for AdjustPolicy {
    fn default() -> Self {
        Self {
            tolerance: 0.10,
            hysteresis: 0.25,
            upgrade_headroom: 0.90,
            min_elapsed: TimeDelta::hours(1),
        }
    }
}

/// End-of-period usage at the average rate observed so far.
///
/// `None` while there is not enough data: nothing elapsed yet, or less than
/// `min_elapsed`.
pub fn project(
    usage: u32,
    elapsed: TimeDelta,
    period: TimeDelta,
    min_elapsed: TimeDelta,
) -> Option<f64> {
    if elapsed <= TimeDelta::zero() || elapsed < min_elapsed {
        return None;
    }
    let elapsed_ms = elapsed.num_milliseconds() as f64;
    let period_ms = period.num_milliseconds() as f64;
    Some(f64::from(usage) * (period_ms / elapsed_ms))
}

/// Where the projection says the active mode should be, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub mode: OperatingMode,
    pub reason: String,
}

/// Choose the mode for a projected end-of-period usage.
///
/// Spend is assumed to scale with the mode budget, so the estimate for another
/// mode `m` is `projected * budget(m) / budget(current)`.
///
/// * projected at or above the hard ceiling: MINIMAL.
/// * projected at or above `budget(current) * (1 + tolerance)`: the highest lower
///   mode whose estimate falls back under the current budget, else MINIMAL.
/// * projected under `budget(current) * (1 - hysteresis)`: the highest higher
///   mode whose estimate stays under `upgrade_headroom * hard_ceiling`.
/// * otherwise the current mode stays.
pub fn choose_destination(
    catalog: &ModeCatalog,
    current: OperatingMode,
    projected: f64,
    policy: &AdjustPolicy,
) -> Destination {
    let ceiling = f64::from(catalog.hard_ceiling());
    let budget = f64::from(catalog.budget(current));
    let estimate = |mode: OperatingMode| projected * f64::from(catalog.budget(mode)) / budget;

    if projected >= ceiling {
        return Destination {
            mode: OperatingMode::Minimal,
            reason: format!(
                "Auto-downgrade: projected {:.0} requests reaches hard ceiling {:.0}",
                projected, ceiling
            ),
        };
    }

    if projected >= budget * (1.0 + policy.tolerance) {
        let mode = catalog
            .ordered()
            .iter()
            .rev()
            .copied()
            .filter(|m| *m < current)
            .find(|m| estimate(*m) < budget)
            .unwrap_or(OperatingMode::Minimal);
        return Destination {
            mode,
            reason: format!(
                "Auto-downgrade: projected {:.0} requests exceeds {} budget {:.0}",
                projected, current, budget
            ),
        };
    }

    if projected < budget * (1.0 - policy.hysteresis) {
        let limit = ceiling * policy.upgrade_headroom;
        if let Some(mode) = catalog
            .ordered()
            .iter()
            .rev()
            .copied()
            .filter(|m| *m > current)
            .find(|m| estimate(*m) < limit)
        {
            return Destination {
                mode,
                reason: format!(
                    "Auto-upgrade: projected {:.0} requests, estimated {:.0} in {} mode",
                    projected,
                    estimate(mode),
                    mode
                ),
            };
        }
    }

    Destination {
        mode: current,
        reason: format!("Projected {:.0} requests fits {} mode", projected, current),
    }
}

/// Last computation made by the adjuster, kept for the status report.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct AdjustEvaluation {
    pub at: DateTime<Utc>,
    pub usage: u32,
    pub projected: Option<f64>,
    pub current_mode: OperatingMode,
    pub recommended_mode: OperatingMode,
    pub applied: bool,
}

/// Periodically re-evaluates the ledger and moves the active mode to keep the
/// projected usage under the hard ceiling.
pub struct AutoAdjuster {
    ledger: Arc<BudgetLedger>,
    catalog: Arc<ModeCatalog>,
    state: Arc<ModeStateCell>,
    policy: AdjustPolicy,
    last_evaluation: RwLock<Option<AdjustEvaluation>>,
}

impl AutoAdjuster {
    pub fn new(
        ledger: Arc<BudgetLedger>,
        catalog: Arc<ModeCatalog>,
        state: Arc<ModeStateCell>,
        policy: AdjustPolicy,
    ) -> Self {
        Self {
            ledger,
            catalog,
            state,
            policy,
            last_evaluation: RwLock::new(None),
        }
    }

    /// Projected end-of-period usage for `usage` at `now`.
    pub fn projection_at(&self, usage: u32, now: DateTime<Utc>) -> Option<f64> {
        let period = self.ledger.period();
        project(
            usage,
            period.elapsed(now),
            period.length(now),
            self.policy.min_elapsed,
        )
    }

    pub async fn last_evaluation(&self) -> Option<AdjustEvaluation> {
        self.last_evaluation.read().await.clone()
    }

    /// Re-evaluate the projection and apply the resulting transition.
    ///
    /// Holds the mode state write lock for the whole read-decide-write, so
    /// overlapping calls run one after another. With auto-adjust disabled the
    /// transition is returned with `applied: false` and nothing is written.
    pub async fn reconsider(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<ModeTransition>, GovernorError> {
        let writer = self.state.lock().await;
        let current = writer.current().await;
        let usage = self.ledger.current_usage().await?;

        let Some(projected) = self.projection_at(usage, now) else {
            tracing::debug!(usage, "Not enough of the period elapsed to project usage");
            self.remember(now, usage, None, &current, current.active_mode, false)
                .await;
            return Ok(None);
        };

        let destination =
            choose_destination(&self.catalog, current.active_mode, projected, &self.policy);
        tracing::debug!(
            usage,
            projected,
            mode = %current.active_mode,
            recommended = %destination.mode,
            "Usage projection evaluated"
        );

        if destination.mode == current.active_mode {
            self.remember(
                now,
                usage,
                Some(projected),
                &current,
                destination.mode,
                false,
            )
            .await;
            return Ok(None);
        }

        let mut transition = ModeTransition {
            from: current.active_mode,
            to: destination.mode,
            reason: destination.reason,
            at: now,
            applied: false,
        };

        if !current.auto_adjust_enabled {
            tracing::info!(
                from = %transition.from,
                to = %transition.to,
                reason = %transition.reason,
                "Auto-adjust disabled, transition not applied"
            );
            self.remember(now, usage, Some(projected), &current, transition.to, false)
                .await;
            return Ok(Some(transition));
        }

        let next = ModeState {
            active_mode: transition.to,
            last_change_at: Some(now),
            last_change_reason: Some(transition.reason.clone()),
            ..current.clone()
        };

        match writer.commit(next).await {
            Ok(_) => {
                writer.clear_unresolved().await;
                transition.applied = true;
                metrics::counter!("quotagate_mode_transitions_total", "source" => "auto")
                    .increment(1);
                tracing::info!(
                    from = %transition.from,
                    to = %transition.to,
                    reason = %transition.reason,
                    "Auto-adjusted operating mode"
                );
                self.remember(now, usage, Some(projected), &current, transition.to, true)
                    .await;
                Ok(Some(transition))
            }
            Err(e) => {
                writer.mark_unresolved(transition, &e).await;
                self.remember(
                    now,
                    usage,
                    Some(projected),
                    &current,
                    destination.mode,
                    false,
                )
                .await;
                Err(e)
            }
        }
    }

    async fn remember(
        &self,
        at: DateTime<Utc>,
        usage: u32,
        projected: Option<f64>,
        current: &ModeState,
        recommended: OperatingMode,
        applied: bool,
    ) {
        *self.last_evaluation.write().await = Some(AdjustEvaluation {
            at,
            usage,
            projected,
            current_mode: current.active_mode,
            recommended_mode: recommended,
            applied,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::clock::{Clock, ManualClock};
    use crate::governor::ledger::{BudgetPeriod, MemoryLedgerStore};
    use crate::governor::state::tests::FlakyModeStateStore;
    use crate::governor::state::ModeStateStore;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn policy() -> AdjustPolicy {
        AdjustPolicy::default()
    }

    fn day_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap()
    }

    struct Fixture {
        adjuster: AutoAdjuster,
        ledger: Arc<BudgetLedger>,
        state: Arc<ModeStateCell>,
        store: Arc<FlakyModeStateStore>,
        clock: Arc<ManualClock>,
    }

    async fn fixture(mode: OperatingMode) -> Fixture {
        let clock = Arc::new(ManualClock::new(day_start()));
        let catalog = Arc::new(ModeCatalog::builtin());
        let ledger = Arc::new(BudgetLedger::new(
            Arc::new(MemoryLedgerStore::new()),
            BudgetPeriod::utc(),
            catalog.hard_ceiling(),
            Duration::from_millis(200),
            Arc::clone(&clock) as Arc<dyn Clock>,
        ));
        let store = Arc::new(FlakyModeStateStore::default());
        let state = Arc::new(
            ModeStateCell::load_or_init(
                Arc::clone(&store) as Arc<dyn ModeStateStore>,
                mode,
                Duration::from_millis(200),
            )
            .await
            .unwrap(),
        );
        let adjuster =
            AutoAdjuster::new(Arc::clone(&ledger), catalog, Arc::clone(&state), policy());
        Fixture {
            adjuster,
            ledger,
            state,
            store,
            clock,
        }
    }

    async fn spend(ledger: &BudgetLedger, n: u32) {
        for _ in 0..n {
            ledger.try_record_spend("fixtures").await.unwrap();
        }
    }

    #[test]
    fn test_projection_scales_by_elapsed_fraction() {
        let projected = project(
            400,
            TimeDelta::hours(6),
            TimeDelta::hours(24),
            TimeDelta::hours(1),
        )
        .unwrap();
        assert!((projected - 1600.0).abs() < 1e-9);
    }

    #[test]
    fn test_projection_needs_elapsed_time() {
        assert_eq!(
            project(10, TimeDelta::zero(), TimeDelta::hours(24), TimeDelta::zero()),
            None
        );
        assert_eq!(
            project(10, TimeDelta::minutes(30), TimeDelta::hours(24), TimeDelta::hours(1)),
            None
        );
    }

    #[test]
    fn test_projection_above_every_budget_goes_minimal() {
        let catalog = ModeCatalog::builtin();
        for mode in OperatingMode::ALL {
            let dest = choose_destination(&catalog, mode, 1600.0, &policy());
            assert_eq!(dest.mode, OperatingMode::Minimal);
        }
    }

    #[test]
    fn test_boundary_values_resolve_to_lower_mode() {
        let catalog = ModeCatalog::builtin();
        let policy = AdjustPolicy {
            tolerance: 0.25,
            hysteresis: 0.5,
            ..AdjustPolicy::default()
        };
        // Exactly the hard ceiling
        assert_eq!(
            choose_destination(&catalog, OperatingMode::Maximum, 1000.0, &policy).mode,
            OperatingMode::Minimal
        );
        // Exactly the downgrade trigger for STANDARD (600 * 1.25)
        assert_eq!(
            choose_destination(&catalog, OperatingMode::Standard, 750.0, &policy).mode,
            OperatingMode::Low
        );
        // Exactly the upgrade threshold for STANDARD (600 * 0.5) does not upgrade
        assert_eq!(
            choose_destination(&catalog, OperatingMode::Standard, 300.0, &policy).mode,
            OperatingMode::Standard
        );
    }

    #[test]
    fn test_hysteresis_band_keeps_mode() {
        let catalog = ModeCatalog::builtin();
        for projected in [460.0, 550.0, 600.0, 640.0, 659.0] {
            assert_eq!(
                choose_destination(&catalog, OperatingMode::Standard, projected, &policy()).mode,
                OperatingMode::Standard,
                "projected {projected}"
            );
        }
    }

    #[test]
    fn test_downgrade_depth_follows_overshoot() {
        let catalog = ModeCatalog::builtin();
        // Mild overshoot: one step down
        assert_eq!(
            choose_destination(&catalog, OperatingMode::High, 900.0, &policy()).mode,
            OperatingMode::Standard
        );
        // LOW projecting twice its budget: nothing but MINIMAL gets back under 300
        assert_eq!(
            choose_destination(&catalog, OperatingMode::Low, 600.0, &policy()).mode,
            OperatingMode::Minimal
        );
    }

    #[test]
    fn test_upgrade_can_skip_modes() {
        let catalog = ModeCatalog::builtin();
        // 200 in STANDARD estimates 333 in MAXIMUM, well under 900
        assert_eq!(
            choose_destination(&catalog, OperatingMode::Standard, 200.0, &policy()).mode,
            OperatingMode::Maximum
        );
        // 400 in STANDARD: MAXIMUM estimate 667, still under 900
        assert_eq!(
            choose_destination(&catalog, OperatingMode::Standard, 400.0, &policy()).mode,
            OperatingMode::Maximum
        );
        // 200 in LOW: MAXIMUM estimate 667, fine
        assert_eq!(
            choose_destination(&catalog, OperatingMode::Low, 200.0, &policy()).mode,
            OperatingMode::Maximum
        );
        // 70 in MINIMAL: MAXIMUM estimate 700
        assert_eq!(
            choose_destination(&catalog, OperatingMode::Minimal, 70.0, &policy()).mode,
            OperatingMode::Maximum
        );
    }

    #[test]
    fn test_upgrade_limited_by_headroom() {
        let catalog = ModeCatalog::builtin();
        let policy = AdjustPolicy {
            upgrade_headroom: 0.5,
            ..AdjustPolicy::default()
        };
        // 200 in LOW: MAXIMUM estimate 667 and HIGH 533 exceed 500, STANDARD 400 fits
        assert_eq!(
            choose_destination(&catalog, OperatingMode::Low, 200.0, &policy).mode,
            OperatingMode::Standard
        );
    }

    proptest! {
        #[test]
        fn prop_never_upgrades_past_tolerance(
            rank in 0usize..5,
            overshoot in 0.0f64..5.0,
        ) {
            let catalog = ModeCatalog::builtin();
            let policy = AdjustPolicy::default();
            let current = OperatingMode::ALL[rank];
            let budget = f64::from(catalog.budget(current));
            let projected = budget * (1.0 + policy.tolerance) + overshoot * budget;

            let dest = choose_destination(&catalog, current, projected, &policy);
            prop_assert!(dest.mode <= current);
        }

        #[test]
        fn prop_destination_is_deterministic_and_in_catalog(
            rank in 0usize..5,
            projected in 0.0f64..3000.0,
        ) {
            let catalog = ModeCatalog::builtin();
            let policy = AdjustPolicy::default();
            let current = OperatingMode::ALL[rank];

            let a = choose_destination(&catalog, current, projected, &policy);
            let b = choose_destination(&catalog, current, projected, &policy);
            prop_assert_eq!(&a, &b);
            prop_assert!(catalog.budget(a.mode) <= catalog.hard_ceiling());
            if projected >= f64::from(catalog.hard_ceiling()) {
                prop_assert_eq!(a.mode, OperatingMode::Minimal);
            }
        }
    }

    #[tokio::test]
    async fn test_reconsider_six_hours_in_with_heavy_usage_goes_minimal() {
        let f = fixture(OperatingMode::Standard).await;
        spend(&f.ledger, 400).await;
        f.clock.set(day_start() + TimeDelta::hours(6));

        let transition = f.adjuster.reconsider(f.clock.now()).await.unwrap().unwrap();
        assert_eq!(transition.from, OperatingMode::Standard);
        assert_eq!(transition.to, OperatingMode::Minimal);
        assert!(transition.applied);

        let state = f.state.snapshot().await;
        assert_eq!(state.active_mode, OperatingMode::Minimal);
        assert_eq!(state.version, 1);
        assert!(state.last_change_reason.unwrap().contains("Auto-downgrade"));
    }

    #[tokio::test]
    async fn test_reconsider_skips_at_period_start() {
        let f = fixture(OperatingMode::Standard).await;
        spend(&f.ledger, 50).await;
        f.clock.set(day_start() + TimeDelta::minutes(10));

        assert_eq!(f.adjuster.reconsider(f.clock.now()).await.unwrap(), None);
        assert_eq!(f.state.snapshot().await.version, 0);
        let eval = f.adjuster.last_evaluation().await.unwrap();
        assert_eq!(eval.projected, None);
    }

    #[tokio::test]
    async fn test_reconsider_reports_only_when_auto_adjust_disabled() {
        let f = fixture(OperatingMode::Standard).await;
        {
            let writer = f.state.lock().await;
            let mut next = writer.current().await;
            next.auto_adjust_enabled = false;
            writer.commit(next).await.unwrap();
        }
        spend(&f.ledger, 400).await;
        f.clock.set(day_start() + TimeDelta::hours(6));

        let transition = f.adjuster.reconsider(f.clock.now()).await.unwrap().unwrap();
        assert_eq!(transition.to, OperatingMode::Minimal);
        assert!(!transition.applied);
        assert_eq!(f.state.snapshot().await.active_mode, OperatingMode::Standard);

        let eval = f.adjuster.last_evaluation().await.unwrap();
        assert_eq!(eval.recommended_mode, OperatingMode::Minimal);
        assert!(!eval.applied);
    }

    #[tokio::test]
    async fn test_failed_write_is_surfaced_as_unresolved() {
        let f = fixture(OperatingMode::High).await;
        spend(&f.ledger, 400).await;
        f.clock.set(day_start() + TimeDelta::hours(6));
        f.store.fail_writes.store(true, Ordering::SeqCst);

        let err = f.adjuster.reconsider(f.clock.now()).await.unwrap_err();
        assert!(matches!(err, GovernorError::ModeStateUnavailable(_)));
        assert_eq!(f.state.snapshot().await.active_mode, OperatingMode::High);

        let unresolved = f.state.unresolved().await.unwrap();
        assert_eq!(unresolved.transition.to, OperatingMode::Minimal);

        // Once the store recovers the next run applies and clears it
        f.store.fail_writes.store(false, Ordering::SeqCst);
        let transition = f.adjuster.reconsider(f.clock.now()).await.unwrap().unwrap();
        assert!(transition.applied);
        assert!(f.state.unresolved().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_reconsiders_apply_once() {
        let f = fixture(OperatingMode::Maximum).await;
        spend(&f.ledger, 400).await;
        f.clock.set(day_start() + TimeDelta::hours(6));
        let adjuster = Arc::new(f.adjuster);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let adjuster = Arc::clone(&adjuster);
            let now = f.clock.now();
            handles.push(tokio::spawn(async move { adjuster.reconsider(now).await }));
        }

        let mut applied = 0;
        for handle in handles {
            if let Some(t) = handle.await.unwrap().unwrap() {
                assert!(t.applied);
                applied += 1;
            }
        }

        assert_eq!(applied, 1);
        let state = f.state.snapshot().await;
        assert_eq!(state.active_mode, OperatingMode::Minimal);
        assert_eq!(state.version, 1);
    }
}
