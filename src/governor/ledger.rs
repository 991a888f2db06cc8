use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use utoipa::ToSchema;

use super::clock::Clock;
use super::GovernorError;
use crate::db::DbError;

/// DST gaps are whole multiples of 15 minutes and never longer than 3 hours.
const GAP_STEP_MINUTES: i64 = 15;
const MAX_GAP_STEPS: i64 = 12;

/// Calls spent on one budgeting day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct DailyCounter {
    pub date: NaiveDate,
    pub count: u32,
}

/// Durable storage for daily counters.
///
/// `try_increment` must check and increment in one atomic step: concurrent
/// callers can never push a day's count past `ceiling`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Count for `date`, zero if no counter exists yet
    async fn usage_on(&self, date: NaiveDate) -> Result<u32, DbError>;

    /// Increment the counter for `date` unless it already reached `ceiling`.
    /// Returns the new count, or `None` when the ceiling blocked the spend.
    async fn try_increment(
        &self,
        date: NaiveDate,
        ceiling: u32,
        resource_class: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<u32>, DbError>;

    /// Spend per resource class on `date`
    async fn class_breakdown(&self, date: NaiveDate) -> Result<IndexMap<String, u32>, DbError>;

    /// Counters between `from` and `to` inclusive, oldest first
    async fn history(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailyCounter>, DbError>;
}

/// In-process ledger store.
#[derive(Default)]
pub struct MemoryLedgerStore {
    counters: DashMap<NaiveDate, AtomicU32>,
    by_class: DashMap<(NaiveDate, String), u32>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn usage_on(&self, date: NaiveDate) -> Result<u32, DbError> {
        Ok(self
            .counters
            .get(&date)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0))
    }

    async fn try_increment(
        &self,
        date: NaiveDate,
        ceiling: u32,
        resource_class: &str,
        _at: DateTime<Utc>,
    ) -> Result<Option<u32>, DbError> {
        let counter = self
            .counters
            .entry(date)
            .or_insert_with(|| AtomicU32::new(0))
            .downgrade();

        let mut current = counter.load(Ordering::Acquire);
        let next = loop {
            if current >= ceiling {
                return Ok(None);
            }
            match counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break current + 1,
                Err(actual) => current = actual,
            }
        };
        drop(counter);

        *self
            .by_class
            .entry((date, resource_class.to_string()))
            .or_insert(0) += 1;

        Ok(Some(next))
    }

    async fn class_breakdown(&self, date: NaiveDate) -> Result<IndexMap<String, u32>, DbError> {
        let mut breakdown: IndexMap<String, u32> = self
            .by_class
            .iter()
            .filter(|entry| entry.key().0 == date)
            .map(|entry| (entry.key().1.clone(), *entry.value()))
            .collect();
        breakdown.sort_keys();
        Ok(breakdown)
    }

    async fn history(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailyCounter>, DbError> {
        let mut days: Vec<DailyCounter> = self
            .counters
            .iter()
            .filter(|entry| *entry.key() >= from && *entry.key() <= to)
            .map(|entry| DailyCounter {
                date: *entry.key(),
                count: entry.value().load(Ordering::Acquire),
            })
            .collect();
        days.sort_by_key(|d| d.date);
        Ok(days)
    }
}

/// The budgeting period: one calendar day in a fixed timezone.
#[derive(Debug, Clone, Copy)]
pub struct BudgetPeriod {
    tz: Tz,
}

impl BudgetPeriod {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn utc() -> Self {
        Self::new(chrono_tz::UTC)
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Calendar day `now` falls on, which keys the ledger counter.
    pub fn date_of(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    pub fn start_of(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.midnight(self.date_of(now))
    }

    pub fn end_of(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = self.date_of(now);
        match date.succ_opt() {
            Some(next) => self.midnight(next),
            None => self.midnight(date) + TimeDelta::days(1),
        }
    }

    /// Period length; 23 or 25 hours on DST transition days.
    pub fn length(&self, now: DateTime<Utc>) -> TimeDelta {
        self.end_of(now) - self.start_of(now)
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.start_of(now)
    }

    /// First instant of `date`. Where a DST gap swallows local midnight the
    /// day starts at the end of the gap.
    fn midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        let naive = date.and_time(NaiveTime::MIN);
        (0..=MAX_GAP_STEPS)
            .find_map(|step| {
                let local = naive + TimeDelta::minutes(GAP_STEP_MINUTES * step);
                self.tz.from_local_datetime(&local).earliest()
            })
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
    }
}

impl Default for BudgetPeriod {
    fn default() -> Self {
        Self::utc()
    }
}

/// Result of recording one upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SpendOutcome {
    Recorded { count: u32 },
    CeilingReached { ceiling: u32 },
}

impl SpendOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded { .. })
    }
}

/// Single source of truth for how many upstream calls were spent today.
///
/// Every store round trip is bounded by `timeout`; an error or an elapsed
/// timeout surfaces as [`GovernorError::LedgerUnavailable`], which callers must
/// treat as a denial.
pub struct BudgetLedger {
    store: Arc<dyn LedgerStore>,
    period: BudgetPeriod,
    hard_ceiling: u32,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl BudgetLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        period: BudgetPeriod,
        hard_ceiling: u32,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            period,
            hard_ceiling,
            timeout,
            clock,
        }
    }

    pub fn hard_ceiling(&self) -> u32 {
        self.hard_ceiling
    }

    pub fn period(&self) -> &BudgetPeriod {
        &self.period
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn today(&self) -> NaiveDate {
        self.period.date_of(self.clock.now())
    }

    /// Calls spent today, zero if nothing was spent yet.
    pub async fn current_usage(&self) -> Result<u32, GovernorError> {
        let today = self.today();
        self.bounded(self.store.usage_on(today)).await
    }

    /// Atomically record one upstream call against today's counter, refusing
    /// once the hard ceiling is reached.
    pub async fn try_record_spend(
        &self,
        resource_class: &str,
    ) -> Result<SpendOutcome, GovernorError> {
        let now = self.clock.now();
        let today = self.period.date_of(now);

        let outcome = self
            .bounded(
                self.store
                    .try_increment(today, self.hard_ceiling, resource_class, now),
            )
            .await?;

        match outcome {
            Some(count) => {
                metrics::counter!(
                    "quotagate_spend_total",
                    "resource_class" => resource_class.to_string()
                )
                .increment(1);
                metrics::gauge!("quotagate_usage_today").set(f64::from(count));
                tracing::debug!(
                    resource_class = %resource_class,
                    count,
                    date = %today,
                    "Recorded upstream call"
                );
                Ok(SpendOutcome::Recorded { count })
            }
            None => {
                tracing::warn!(
                    resource_class = %resource_class,
                    ceiling = self.hard_ceiling,
                    date = %today,
                    "Hard ceiling reached, spend not recorded"
                );
                Ok(SpendOutcome::CeilingReached {
                    ceiling: self.hard_ceiling,
                })
            }
        }
    }

    /// Today's spend per resource class.
    pub async fn class_breakdown(&self) -> Result<IndexMap<String, u32>, GovernorError> {
        let today = self.today();
        self.bounded(self.store.class_breakdown(today)).await
    }

    /// Daily counters for the last `days` days including today.
    pub async fn usage_history(&self, days: u32) -> Result<Vec<DailyCounter>, GovernorError> {
        let today = self.today();
        let from = today - TimeDelta::days(i64::from(days.saturating_sub(1)));
        self.bounded(self.store.history(from, today)).await
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, GovernorError>
    where
        F: Future<Output = Result<T, DbError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Ledger store error");
                Err(GovernorError::LedgerUnavailable(e.to_string()))
            }
            Err(_) => {
                tracing::error!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Ledger store timed out"
                );
                Err(GovernorError::LedgerUnavailable(format!(
                    "store did not answer within {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}
