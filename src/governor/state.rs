use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use utoipa::ToSchema;

use super::mode::OperatingMode;
use super::GovernorError;
use crate::db::DbError;

/// The process-wide operating state. Only the active mode reference and the
/// auto-adjust flag ever change; `version` increases by one on every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ModeState {
    pub active_mode: OperatingMode,
    pub auto_adjust_enabled: bool,
    pub last_change_at: Option<DateTime<Utc>>,
    pub last_change_reason: Option<String>,
    pub version: i64,
}

impl ModeState {
    pub fn initial(mode: OperatingMode) -> Self {
        Self {
            active_mode: mode,
            auto_adjust_enabled: true,
            last_change_at: None,
            last_change_reason: None,
            version: 0,
        }
    }
}

/// A change of the active mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ModeTransition {
    pub from: OperatingMode,
    pub to: OperatingMode,
    pub reason: String,
    pub at: DateTime<Utc>,
    /// False when the transition was only computed (auto-adjust disabled)
    pub applied: bool,
}

/// A transition that was decided but could not be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct UnresolvedTransition {
    pub transition: ModeTransition,
    pub error: String,
}

/// Durable storage for the single ModeState record.
#[async_trait]
pub trait ModeStateStore: Send + Sync {
    async fn load(&self) -> Result<Option<ModeState>, DbError>;

    /// Store `initial` unless a record already exists; returns the stored record
    async fn init(&self, initial: &ModeState) -> Result<ModeState, DbError>;

    /// Replace the record only if its version is still `expected_version`
    async fn compare_and_swap(
        &self,
        expected_version: i64,
        next: &ModeState,
    ) -> Result<bool, DbError>;
}

#[derive(Default)]
pub struct MemoryModeStateStore {
    record: Mutex<Option<ModeState>>,
}

impl MemoryModeStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModeStateStore for MemoryModeStateStore {
    async fn load(&self) -> Result<Option<ModeState>, DbError> {
        Ok(self.record.lock().await.clone())
    }

    async fn init(&self, initial: &ModeState) -> Result<ModeState, DbError> {
        let mut record = self.record.lock().await;
        Ok(record.get_or_insert_with(|| initial.clone()).clone())
    }

    async fn compare_and_swap(
        &self,
        expected_version: i64,
        next: &ModeState,
    ) -> Result<bool, DbError> {
        let mut record = self.record.lock().await;
        match record.as_ref() {
            Some(current) if current.version == expected_version => {
                *record = Some(next.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// In-process view of the ModeState.
///
/// Readers clone a snapshot behind a `RwLock` and never wait on writers for
/// longer than the swap itself. Writers serialize on `write_lock` for the whole
/// read-decide-write, and the snapshot is only replaced after the durable
/// compare-and-swap succeeded.
pub struct ModeStateCell {
    store: Arc<dyn ModeStateStore>,
    snapshot: RwLock<ModeState>,
    write_lock: Mutex<()>,
    unresolved: RwLock<Option<UnresolvedTransition>>,
    timeout: Duration,
}

impl ModeStateCell {
    /// Load the persisted state, creating it with `initial_mode` on first start.
    pub async fn load_or_init(
        store: Arc<dyn ModeStateStore>,
        initial_mode: OperatingMode,
        timeout: Duration,
    ) -> Result<Self, GovernorError> {
        let initial = ModeState::initial(initial_mode);
        let state = bounded(timeout, store.init(&initial)).await?;

        tracing::info!(
            mode = %state.active_mode,
            auto_adjust = state.auto_adjust_enabled,
            version = state.version,
            "Mode state loaded"
        );

        Ok(Self {
            store,
            snapshot: RwLock::new(state),
            write_lock: Mutex::new(()),
            unresolved: RwLock::new(None),
            timeout,
        })
    }

    /// Consistent, possibly momentarily stale, copy of the current state.
    pub async fn snapshot(&self) -> ModeState {
        self.snapshot.read().await.clone()
    }

    /// Acquire exclusive write access. Only one writer may hold it at a time.
    pub async fn lock(&self) -> ModeStateWriter<'_> {
        ModeStateWriter {
            cell: self,
            _permit: self.write_lock.lock().await,
        }
    }

    pub async fn unresolved(&self) -> Option<UnresolvedTransition> {
        self.unresolved.read().await.clone()
    }
}

/// Exclusive writer handle returned by [`ModeStateCell::lock`].
pub struct ModeStateWriter<'a> {
    cell: &'a ModeStateCell,
    _permit: MutexGuard<'a, ()>,
}

impl ModeStateWriter<'_> {
    pub async fn current(&self) -> ModeState {
        self.cell.snapshot().await
    }

    /// Durably write `next` on top of the current version and publish it.
    ///
    /// On failure the previous state stays active.
    pub async fn commit(&self, mut next: ModeState) -> Result<ModeState, GovernorError> {
        let current = self.current().await;
        next.version = current.version + 1;

        let swapped = bounded(
            self.cell.timeout,
            self.cell.store.compare_and_swap(current.version, &next),
        )
        .await?;

        if !swapped {
            // Someone else wrote the record; resync so the next attempt starts from it.
            if let Ok(Some(stored)) = bounded(self.cell.timeout, self.cell.store.load()).await {
                *self.cell.snapshot.write().await = stored;
            }
            return Err(GovernorError::ModeStateUnavailable(format!(
                "mode state changed underneath version {}",
                current.version
            )));
        }

        *self.cell.snapshot.write().await = next.clone();
        Ok(next)
    }

    pub async fn mark_unresolved(&self, transition: ModeTransition, error: &GovernorError) {
        tracing::warn!(
            from = %transition.from,
            to = %transition.to,
            error = %error,
            "Mode transition could not be applied"
        );
        *self.cell.unresolved.write().await = Some(UnresolvedTransition {
            transition,
            error: error.to_string(),
        });
    }

    pub async fn clear_unresolved(&self) {
        *self.cell.unresolved.write().await = None;
    }
}

async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, GovernorError>
where
    F: Future<Output = Result<T, DbError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Mode state store error");
            Err(GovernorError::ModeStateUnavailable(e.to_string()))
        }
        Err(_) => {
            tracing::error!(timeout_ms = timeout.as_millis() as u64, "Mode state store timed out");
            Err(GovernorError::ModeStateUnavailable(format!(
                "store did not answer within {}ms",
                timeout.as_millis()
            )))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory store whose writes can be switched off.
    #[derive(Default)]
    pub(crate) struct FlakyModeStateStore {
        inner: MemoryModeStateStore,
        pub(crate) fail_writes: AtomicBool,
    }

    #[async_trait]
    impl ModeStateStore for FlakyModeStateStore {
        async fn load(&self) -> Result<Option<ModeState>, DbError> {
            self.inner.load().await
        }

        async fn init(&self, initial: &ModeState) -> Result<ModeState, DbError> {
            self.inner.init(initial).await
        }

        async fn compare_and_swap(
            &self,
            expected_version: i64,
            next: &ModeState,
        ) -> Result<bool, DbError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(DbError::Sqlx(sqlx::Error::PoolTimedOut));
            }
            self.inner.compare_and_swap(expected_version, next).await
        }
    }

    fn timeout() -> Duration {
        Duration::from_millis(200)
    }

    #[tokio::test]
    async fn test_load_or_init_creates_initial_state_once() {
        let store = Arc::new(MemoryModeStateStore::new());
        let cell = ModeStateCell::load_or_init(store.clone(), OperatingMode::Standard, timeout())
            .await
            .unwrap();
        assert_eq!(cell.snapshot().await.active_mode, OperatingMode::Standard);

        // A restart with a different initial mode keeps the persisted one
        let cell = ModeStateCell::load_or_init(store, OperatingMode::Maximum, timeout())
            .await
            .unwrap();
        assert_eq!(cell.snapshot().await.active_mode, OperatingMode::Standard);
    }

    #[tokio::test]
    async fn test_commit_bumps_version_and_publishes() {
        let store = Arc::new(MemoryModeStateStore::new());
        let cell = ModeStateCell::load_or_init(store.clone(), OperatingMode::Standard, timeout())
            .await
            .unwrap();

        let writer = cell.lock().await;
        let mut next = writer.current().await;
        next.active_mode = OperatingMode::Low;
        let committed = writer.commit(next).await.unwrap();
        drop(writer);

        assert_eq!(committed.version, 1);
        assert_eq!(cell.snapshot().await.active_mode, OperatingMode::Low);
        assert_eq!(store.load().await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_state() {
        let store = Arc::new(FlakyModeStateStore::default());
        let cell = ModeStateCell::load_or_init(store.clone(), OperatingMode::High, timeout())
            .await
            .unwrap();
        store.fail_writes.store(true, Ordering::SeqCst);

        let writer = cell.lock().await;
        let mut next = writer.current().await;
        next.active_mode = OperatingMode::Minimal;
        let err = writer.commit(next).await.unwrap_err();
        drop(writer);

        assert!(matches!(err, GovernorError::ModeStateUnavailable(_)));
        assert_eq!(cell.snapshot().await.active_mode, OperatingMode::High);
    }

    #[tokio::test]
    async fn test_version_conflict_resyncs_snapshot() {
        let store = Arc::new(MemoryModeStateStore::new());
        let cell = ModeStateCell::load_or_init(store.clone(), OperatingMode::Standard, timeout())
            .await
            .unwrap();

        // Another process writes version 1 behind our back
        let mut foreign = ModeState::initial(OperatingMode::Maximum);
        foreign.version = 1;
        assert!(store.compare_and_swap(0, &foreign).await.unwrap());

        let writer = cell.lock().await;
        let mut next = writer.current().await;
        next.active_mode = OperatingMode::Low;
        assert!(writer.commit(next).await.is_err());
        drop(writer);

        assert_eq!(cell.snapshot().await.active_mode, OperatingMode::Maximum);
    }
}
