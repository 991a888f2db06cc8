use config::{Case, Config, ConfigError, Environment, File};
use indexmap::IndexMap;
use serde::Deserialize;
use std::time::Duration;

use crate::governor::{
    AdjustPolicy, BudgetPeriod, FreshnessPolicy, GovernorError, GovernorSettings, ModeCatalog,
    OperatingMode, StatusThresholds,
};

/// `database_url` value that keeps every store in process memory
pub const MEMORY_DATABASE_URL: &str = "memory";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// API key for operator endpoints (optional - if not set, no auth required)
    #[serde(default)]
    pub operator_api_key: Option<String>,

    /// Database URL (SQLite connection string, or "memory")
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default)]
    pub governor: GovernorConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Periodic auto-adjust configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GovernorConfig {
    /// Budget overrides per mode; must stay strictly increasing
    #[serde(default)]
    pub mode_budgets: Option<IndexMap<String, u32>>,

    /// Mode used when no persisted state exists yet
    #[serde(default = "default_initial_mode")]
    pub initial_mode: String,

    /// IANA timezone whose calendar day is the budgeting period
    #[serde(default = "default_timezone")]
    pub period_timezone: String,

    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    #[serde(default = "default_tolerance")]
    pub adjust_tolerance: f64,

    #[serde(default = "default_hysteresis")]
    pub adjust_hysteresis: f64,

    #[serde(default = "default_min_elapsed_minutes")]
    pub min_elapsed_minutes: i64,

    #[serde(default = "default_upgrade_headroom")]
    pub upgrade_headroom: f64,

    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,

    #[serde(default = "default_emergency_ratio")]
    pub emergency_ratio: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            mode_budgets: None,
            initial_mode: default_initial_mode(),
            period_timezone: default_timezone(),
            store_timeout_ms: default_store_timeout_ms(),
            adjust_tolerance: default_tolerance(),
            adjust_hysteresis: default_hysteresis(),
            min_elapsed_minutes: default_min_elapsed_minutes(),
            upgrade_headroom: default_upgrade_headroom(),
            warning_ratio: default_warning_ratio(),
            emergency_ratio: default_emergency_ratio(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CacheConfig {
    /// Fallback TTL for classes without an entry
    #[serde(default)]
    pub default_ttl_secs: Option<u64>,

    /// TTL overrides per resource class, in seconds
    #[serde(default)]
    pub ttls: IndexMap<String, u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Whether the periodic reconsider job runs
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Six-field cron expression
    #[serde(default = "default_cron")]
    pub cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: default_cron(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_database_url() -> String {
    "sqlite:data/quotagate.db".to_string()
}

fn default_initial_mode() -> String {
    "standard".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_store_timeout_ms() -> u64 {
    2000
}

fn default_tolerance() -> f64 {
    0.10
}

fn default_hysteresis() -> f64 {
    0.25
}

fn default_min_elapsed_minutes() -> i64 {
    60
}

fn default_upgrade_headroom() -> f64 {
    0.90
}

fn default_warning_ratio() -> f64 {
    0.80
}

fn default_emergency_ratio() -> f64 {
    0.90
}

fn default_cron() -> String {
    "0 */15 * * * *".to_string()
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let config = Config::builder()
            .set_default("host", default_host())?
            .set_default("port", default_port())?
            // Load from config file if present
            .add_source(File::with_name("config").required(false))
            .add_source(File::with_name("config.local").required(false))
            // Override with environment variables (prefixed with QUOTAGATE_)
            .add_source(
                Environment::with_prefix("QUOTAGATE")
                    .prefix_separator("_")
                    .separator("__")
                    .convert_case(Case::Snake)
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn uses_memory_stores(&self) -> bool {
        self.database_url == MEMORY_DATABASE_URL
    }
}

impl GovernorConfig {
    /// Turn raw configuration into validated governor settings.
    pub fn settings(&self, cache: &CacheConfig) -> Result<GovernorSettings, GovernorError> {
        let catalog = match &self.mode_budgets {
            Some(raw) => {
                let mut budgets = IndexMap::new();
                for (name, budget) in raw {
                    budgets.insert(name.parse::<OperatingMode>()?, *budget);
                }
                ModeCatalog::builtin().with_budgets(&budgets)?
            }
            None => ModeCatalog::builtin(),
        };

        let tz = self.period_timezone.parse::<chrono_tz::Tz>().map_err(|e| {
            GovernorError::InvalidConfig(format!(
                "period_timezone {:?}: {}",
                self.period_timezone, e
            ))
        })?;

        for (name, value) in [
            ("adjust_tolerance", self.adjust_tolerance),
            ("adjust_hysteresis", self.adjust_hysteresis),
            ("upgrade_headroom", self.upgrade_headroom),
            ("warning_ratio", self.warning_ratio),
            ("emergency_ratio", self.emergency_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GovernorError::InvalidConfig(format!(
                    "{name} must be between 0 and 1, got {value}"
                )));
            }
        }
        if self.min_elapsed_minutes < 0 {
            return Err(GovernorError::InvalidConfig(
                "min_elapsed_minutes must not be negative".to_string(),
            ));
        }
        if self.store_timeout_ms == 0 {
            return Err(GovernorError::InvalidConfig(
                "store_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(GovernorSettings {
            catalog,
            freshness: FreshnessPolicy::builtin()
                .with_overrides(&cache.ttls, cache.default_ttl_secs)?,
            period: BudgetPeriod::new(tz),
            initial_mode: self.initial_mode.parse()?,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            adjust: AdjustPolicy {
                tolerance: self.adjust_tolerance,
                hysteresis: self.adjust_hysteresis,
                upgrade_headroom: self.upgrade_headroom,
                min_elapsed: chrono::TimeDelta::minutes(self.min_elapsed_minutes),
            },
            thresholds: StatusThresholds {
                warning_ratio: self.warning_ratio,
                emergency_ratio: self.emergency_ratio,
            },
        })
    }
}
