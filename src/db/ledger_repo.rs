use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use sqlx::SqlitePool;

use crate::governor::{DailyCounter, LedgerStore};

use super::DbError;

/// SQLite implementation of LedgerStore
///
/// The increment is a single upsert guarded by `request_count < ceiling`, so
/// the check and the write cannot be split by a concurrent writer.
pub struct SqliteLedgerRepository {
    pool: SqlitePool,
}

impl SqliteLedgerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn date_key(date: NaiveDate) -> String {
        date.format("%Y-%m-%d").to_string()
    }

    fn parse_date(s: &str) -> Result<NaiveDate, DbError> {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| DbError::InvalidData(format!("bad counter date {s:?}: {e}")))
    }
}

#[derive(sqlx::FromRow)]
struct CounterRow {
    date: String,
    request_count: i64,
}

#[async_trait]
impl LedgerStore for SqliteLedgerRepository {
    async fn usage_on(&self, date: NaiveDate) -> Result<u32, DbError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT request_count FROM daily_request_counter WHERE date = ?")
                .bind(Self::date_key(date))
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(count,)| count as u32).unwrap_or(0))
    }

    async fn try_increment(
        &self,
        date: NaiveDate,
        ceiling: u32,
        resource_class: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<u32>, DbError> {
        if ceiling == 0 {
            return Ok(None);
        }

        let key = Self::date_key(date);
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO daily_request_counter (date, request_count, updated_at)
             VALUES (?, 1, ?)
             ON CONFLICT(date) DO UPDATE SET
                request_count = request_count + 1,
                updated_at = excluded.updated_at
             WHERE request_count < ?
             RETURNING request_count",
        )
        .bind(&key)
        .bind(at.timestamp())
        .bind(i64::from(ceiling))
        .fetch_optional(&mut *tx)
        .await?;

        let Some((count,)) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(
            "INSERT INTO api_request_log (date, resource_class, recorded_at) VALUES (?, ?, ?)",
        )
        .bind(&key)
        .bind(resource_class)
        .bind(at.timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(count as u32))
    }

    async fn class_breakdown(&self, date: NaiveDate) -> Result<IndexMap<String, u32>, DbError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT resource_class, COUNT(*) FROM api_request_log
             WHERE date = ? GROUP BY resource_class ORDER BY resource_class",
        )
        .bind(Self::date_key(date))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(class, count)| (class, count as u32))
            .collect())
    }

    async fn history(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailyCounter>, DbError> {
        let rows: Vec<CounterRow> = sqlx::query_as(
            "SELECT date, request_count FROM daily_request_counter
             WHERE date >= ? AND date <= ? ORDER BY date",
        )
        .bind(Self::date_key(from))
        .bind(Self::date_key(to))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DailyCounter {
                    date: Self::parse_date(&row.date)?,
                    count: row.request_count as u32,
                })
            })
            .collect()
    }
}
