use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::governor::{ModeState, ModeStateStore, OperatingMode};

use super::DbError;

/// SQLite implementation of ModeStateStore, backed by the single
/// `request_mode_config` row.
pub struct SqliteModeStateRepository {
    pool: SqlitePool,
}

impl SqliteModeStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ModeStateRow {
    current_mode: String,
    auto_adjust_enabled: i32,
    last_mode_change: Option<i64>,
    reason_for_change: Option<String>,
    version: i64,
}

impl TryFrom<ModeStateRow> for ModeState {
    type Error = DbError;

    fn try_from(row: ModeStateRow) -> Result<Self, Self::Error> {
        let active_mode: OperatingMode = row.current_mode.parse().map_err(|_| {
            DbError::InvalidData(format!("unknown stored mode {:?}", row.current_mode))
        })?;

        let last_change_at = row
            .last_mode_change
            .map(|ts| {
                DateTime::<Utc>::from_timestamp(ts, 0)
                    .ok_or_else(|| DbError::InvalidData(format!("bad mode change timestamp {ts}")))
            })
            .transpose()?;

        Ok(ModeState {
            active_mode,
            auto_adjust_enabled: row.auto_adjust_enabled != 0,
            last_change_at,
            last_change_reason: row.reason_for_change,
            version: row.version,
        })
    }
}

#[async_trait]
impl ModeStateStore for SqliteModeStateRepository {
    async fn load(&self) -> Result<Option<ModeState>, DbError> {
        let row: Option<ModeStateRow> = sqlx::query_as(
            "SELECT current_mode, auto_adjust_enabled, last_mode_change, reason_for_change, version
             FROM request_mode_config WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(ModeState::try_from).transpose()
    }

    async fn init(&self, initial: &ModeState) -> Result<ModeState, DbError> {
        sqlx::query(
            "INSERT OR IGNORE INTO request_mode_config
                (id, current_mode, auto_adjust_enabled, last_mode_change,
                 reason_for_change, version)
             VALUES (1, ?, ?, ?, ?, ?)",
        )
        .bind(initial.active_mode.as_str())
        .bind(initial.auto_adjust_enabled as i32)
        .bind(initial.last_change_at.map(|t| t.timestamp()))
        .bind(&initial.last_change_reason)
        .bind(initial.version)
        .execute(&self.pool)
        .await?;

        self.load()
            .await?
            .ok_or_else(|| DbError::InvalidData("mode state row missing after init".to_string()))
    }

    async fn compare_and_swap(
        &self,
        expected_version: i64,
        next: &ModeState,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE request_mode_config SET
                current_mode = ?,
                auto_adjust_enabled = ?,
                last_mode_change = ?,
                reason_for_change = ?,
                version = ?
             WHERE id = 1 AND version = ?",
        )
        .bind(next.active_mode.as_str())
        .bind(next.auto_adjust_enabled as i32)
        .bind(next.last_change_at.map(|t| t.timestamp()))
        .bind(&next.last_change_reason)
        .bind(next.version)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
