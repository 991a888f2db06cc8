use chrono::{DateTime, TimeDelta, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::GovernorError;

/// Metadata for one cached upstream result. The payload itself lives with
/// whoever owns the cache; only the fetch time matters here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CacheEntry {
    pub resource_key: String,
    pub resource_class: String,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(
        resource_key: impl Into<String>,
        resource_class: impl Into<String>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            resource_key: resource_key.into(),
            resource_class: resource_class.into(),
            fetched_at,
        }
    }
}

/// Static per resource-class TTL table.
#[derive(Debug, Clone)]
pub struct FreshnessPolicy {
    ttls: IndexMap<String, TimeDelta>,
    default_ttl: TimeDelta,
}

impl FreshnessPolicy {
    pub fn new(ttls: IndexMap<String, TimeDelta>, default_ttl: TimeDelta) -> Self {
        Self { ttls, default_ttl }
    }

    /// TTLs used by the football data scrapers.
    pub fn builtin() -> Self {
        let ttls = [
            ("live", TimeDelta::minutes(5)),
            ("live_fixtures", TimeDelta::minutes(5)),
            ("live_events", TimeDelta::minutes(5)),
            ("goalscorers", TimeDelta::hours(1)),
            ("lineups", TimeDelta::hours(2)),
            ("fixtures", TimeDelta::hours(6)),
            ("current_gameweek", TimeDelta::hours(6)),
            ("standings", TimeDelta::hours(6)),
            ("probable_scorers", TimeDelta::hours(12)),
            ("team_stats", TimeDelta::hours(24)),
            ("teams", TimeDelta::days(7)),
            ("squads", TimeDelta::days(7)),
            ("h2h", TimeDelta::days(30)),
        ]
        .into_iter()
        .map(|(class, ttl)| (class.to_string(), ttl))
        .collect();

        Self::new(ttls, TimeDelta::hours(24))
    }

    /// Override TTLs (in seconds) per class, and optionally the fallback.
    pub fn with_overrides(
        mut self,
        ttls: &IndexMap<String, u64>,
        default_secs: Option<u64>,
    ) -> Result<Self, GovernorError> {
        for (class, secs) in ttls {
            self.ttls.insert(class.clone(), seconds(class, *secs)?);
        }
        if let Some(secs) = default_secs {
            self.default_ttl = seconds("default", secs)?;
        }
        Ok(self)
    }

    /// TTL for a class. Classes without an entry use the default TTL.
    pub fn ttl(&self, resource_class: &str) -> TimeDelta {
        self.ttls
            .get(resource_class)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// `now - fetched_at < ttl`. A cache miss is never fresh.
    pub fn is_fresh(
        &self,
        entry: Option<&CacheEntry>,
        resource_class: &str,
        now: DateTime<Utc>,
    ) -> bool {
        match entry {
            Some(entry) => now - entry.fetched_at < self.ttl(resource_class),
            None => false,
        }
    }

    pub fn needs_refresh(
        &self,
        entry: Option<&CacheEntry>,
        resource_class: &str,
        now: DateTime<Utc>,
    ) -> bool {
        !self.is_fresh(entry, resource_class, now)
    }

    /// Age as a fraction of the TTL: below 1.0 is fresh, larger means more overdue.
    pub fn age_ratio(
        &self,
        entry: Option<&CacheEntry>,
        resource_class: &str,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let entry = entry?;
        let ttl_ms = self.ttl(resource_class).num_milliseconds().max(1) as f64;
        let age_ms = (now - entry.fetched_at).num_milliseconds().max(0) as f64;
        Some(age_ms / ttl_ms)
    }

    pub fn ttls(&self) -> impl Iterator<Item = (&str, TimeDelta)> {
        self.ttls.iter().map(|(class, ttl)| (class.as_str(), *ttl))
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::builtin()
    }
}

fn seconds(class: &str, secs: u64) -> Result<TimeDelta, GovernorError> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| {
            GovernorError::InvalidConfig(format!("ttl for {class} out of range: {secs}s"))
        })
}
