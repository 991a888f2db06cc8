use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use super::GovernorError;

/// Operating modes, ordered from the most frugal to the most generous.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    Minimal,
    Low,
    Standard,
    High,
    Maximum,
}

impl OperatingMode {
    /// All modes, ascending by budget.
    pub const ALL: [OperatingMode; 5] = [
        OperatingMode::Minimal,
        OperatingMode::Low,
        OperatingMode::Standard,
        OperatingMode::High,
        OperatingMode::Maximum,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Standard => "standard",
            Self::High => "high",
            Self::Maximum => "maximum",
        }
    }

    pub fn rank(self) -> usize {
        self as usize
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatingMode {
    type Err = GovernorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimal" => Ok(Self::Minimal),
            "low" => Ok(Self::Low),
            "standard" => Ok(Self::Standard),
            "high" => Ok(Self::High),
            "maximum" => Ok(Self::Maximum),
            _ => Err(GovernorError::UnknownMode(s.to_string())),
        }
    }
}

/// Request priority. `Critical` is the highest tier and the only one that may
/// spend past the active mode's budget.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const HIGHEST: Priority = Priority::Critical;

    pub fn is_highest(self) -> bool {
        self == Self::HIGHEST
    }
}

/// Planned spend for one resource class within a mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allowance {
    pub priority: Priority,
    pub expected_calls: u32,
    pub frequency: &'static str,
}

const fn allow(priority: Priority, expected_calls: u32, frequency: &'static str) -> Allowance {
    Allowance {
        priority,
        expected_calls,
        frequency,
    }
}

/// Budget, description and allowance schedule bound to one mode.
#[derive(Debug, Clone)]
pub struct ModeSpec {
    pub budget: u32,
    pub description: &'static str,
    pub schedule: IndexMap<String, Allowance>,
}

/// Immutable table of the five operating modes.
///
/// Built once at startup. Lookups by [`OperatingMode`] cannot fail; the only
/// place an unknown mode can show up is when parsing a name, which yields
/// [`GovernorError::UnknownMode`].
#[derive(Debug, Clone)]
pub struct ModeCatalog {
    modes: [ModeSpec; 5],
}

impl ModeCatalog {
    /// The built-in catalog for the football data API.
    pub fn builtin() -> Self {
        use Priority::{Critical, High, Normal};

        let schedule = |entries: &[(&str, Allowance)]| -> IndexMap<String, Allowance> {
            entries
                .iter()
                .map(|(class, allowance)| (class.to_string(), allowance.clone()))
                .collect()
        };

        let minimal = ModeSpec {
            budget: 100,
            description: "Basic fixtures and standings only",
            schedule: schedule(&[
                ("teams", allow(Normal, 1, "monthly")),
                ("fixtures", allow(High, 1, "daily")),
                ("standings", allow(Normal, 1, "daily")),
                ("current_gameweek", allow(High, 1, "daily")),
                ("live", allow(Critical, 50, "every_10_minutes")),
            ]),
        };

        let low = ModeSpec {
            budget: 300,
            description: "Essential data with basic match updates",
            schedule: schedule(&[
                ("teams", allow(Normal, 1, "weekly")),
                ("fixtures", allow(High, 2, "twice_daily")),
                ("standings", allow(Normal, 1, "daily")),
                ("current_gameweek", allow(High, 4, "every_6_hours")),
                ("goalscorers", allow(Normal, 20, "post_match_only")),
                ("live", allow(Critical, 60, "every_10_minutes")),
            ]),
        };

        let standard = ModeSpec {
            budget: 600,
            description: "Full coverage with moderate update frequency",
            schedule: schedule(&[
                ("teams", allow(Normal, 1, "weekly")),
                ("fixtures", allow(High, 2, "twice_daily")),
                ("standings", allow(Normal, 1, "daily")),
                ("current_gameweek", allow(High, 8, "every_3_hours")),
                ("lineups", allow(High, 60, "match_day_limited")),
                ("goalscorers", allow(High, 50, "post_match")),
                ("probable_scorers", allow(Normal, 20, "pre_match_daily")),
                ("live", allow(Critical, 120, "every_5_minutes")),
            ]),
        };

        let high = ModeSpec {
            budget: 800,
            description: "High frequency updates with live match tracking",
            schedule: schedule(&[
                ("teams", allow(Normal, 1, "weekly")),
                ("fixtures", allow(High, 3, "three_times_daily")),
                ("standings", allow(Normal, 2, "twice_daily")),
                ("current_gameweek", allow(High, 24, "hourly")),
                ("lineups", allow(Critical, 120, "match_day_frequent")),
                ("goalscorers", allow(High, 80, "during_and_post_match")),
                ("probable_scorers", allow(Normal, 40, "pre_match_frequent")),
                ("live", allow(Critical, 300, "every_5_minutes")),
                ("live_fixtures", allow(Critical, 500, "every_5_minutes")),
            ]),
        };

        let maximum = ModeSpec {
            budget: 1000,
            description: "Maximum frequency with real-time updates",
            schedule: schedule(&[
                ("teams", allow(Normal, 1, "weekly")),
                ("fixtures", allow(High, 4, "four_times_daily")),
                ("standings", allow(Normal, 3, "three_times_daily")),
                ("current_gameweek", allow(High, 48, "every_30_minutes")),
                ("lineups", allow(Critical, 200, "match_day_maximum")),
                ("goalscorers", allow(Critical, 100, "real_time")),
                ("probable_scorers", allow(Normal, 60, "pre_match_maximum")),
                ("live", allow(Critical, 500, "every_2_minutes")),
                ("live_fixtures", allow(Critical, 1000, "every_2_minutes")),
                ("live_events", allow(Critical, 500, "every_minute")),
            ]),
        };

        Self {
            modes: [minimal, low, standard, high, maximum],
        }
    }

    /// Replace budgets for the given modes, then validate the result.
    pub fn with_budgets(
        mut self,
        overrides: &IndexMap<OperatingMode, u32>,
    ) -> Result<Self, GovernorError> {
        for (mode, budget) in overrides {
            self.modes[mode.rank()].budget = *budget;
        }
        self.validate()?;
        Ok(self)
    }

    /// Budgets must be non-zero and strictly increasing across the ordered set.
    pub fn validate(&self) -> Result<(), GovernorError> {
        if self.modes[0].budget == 0 {
            return Err(GovernorError::InvalidCatalog(
                "minimal mode budget must be greater than zero".to_string(),
            ));
        }
        for pair in OperatingMode::ALL.windows(2) {
            let (lower, upper) = (pair[0], pair[1]);
            if self.budget(lower) >= self.budget(upper) {
                return Err(GovernorError::InvalidCatalog(format!(
                    "budget of {} ({}) must be below budget of {} ({})",
                    lower,
                    self.budget(lower),
                    upper,
                    self.budget(upper)
                )));
            }
        }
        Ok(())
    }

    pub fn budget(&self, mode: OperatingMode) -> u32 {
        self.modes[mode.rank()].budget
    }

    pub fn schedule(&self, mode: OperatingMode) -> &IndexMap<String, Allowance> {
        &self.modes[mode.rank()].schedule
    }

    pub fn description(&self, mode: OperatingMode) -> &'static str {
        self.modes[mode.rank()].description
    }

    /// Allowance for `resource_class` under `mode`, if the mode plans to spend on it.
    pub fn allowance(&self, mode: OperatingMode, resource_class: &str) -> Option<&Allowance> {
        self.schedule(mode).get(resource_class)
    }

    /// Modes ascending by budget.
    pub fn ordered(&self) -> &'static [OperatingMode] {
        &OperatingMode::ALL
    }

    /// System-wide absolute cap, independent of the active mode.
    pub fn hard_ceiling(&self) -> u32 {
        self.modes.iter().map(|m| m.budget).max().unwrap_or(0)
    }

    /// Sum of the calls the mode expects to make per period.
    pub fn planned_calls(&self, mode: OperatingMode) -> u32 {
        self.schedule(mode)
            .values()
            .map(|a| a.expected_calls)
            .sum()
    }
}

impl Default for ModeCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_budgets_strictly_increase() {
        let catalog = ModeCatalog::builtin();
        catalog.validate().unwrap();

        let budgets: Vec<u32> = catalog.ordered().iter().map(|m| catalog.budget(*m)).collect();
        assert_eq!(budgets, vec![100, 300, 600, 800, 1000]);
        assert_eq!(catalog.hard_ceiling(), 1000);
    }

    #[test]
    fn test_parse_mode_names() {
        assert_eq!("standard".parse::<OperatingMode>().unwrap(), OperatingMode::Standard);
        assert_eq!(" MAXIMUM ".parse::<OperatingMode>().unwrap(), OperatingMode::Maximum);

        let err = "turbo".parse::<OperatingMode>().unwrap_err();
        assert!(matches!(err, GovernorError::UnknownMode(name) if name == "turbo"));
    }

    #[test]
    fn test_mode_serde_roundtrip_uses_lowercase() {
        let json = serde_json::to_string(&OperatingMode::High).unwrap();
        assert_eq!(json, "\"high\"");
        assert!(serde_json::from_str::<OperatingMode>("\"bogus\"").is_err());
    }

    #[test]
    fn test_schedules_exclude_classes() {
        let catalog = ModeCatalog::builtin();
        assert!(catalog.allowance(OperatingMode::Minimal, "lineups").is_none());
        assert!(catalog.allowance(OperatingMode::Low, "live").is_some());
        assert!(catalog.allowance(OperatingMode::Standard, "live_events").is_none());
        assert!(catalog.allowance(OperatingMode::Maximum, "live_events").is_some());
    }

    #[test]
    fn test_budget_overrides_are_validated() {
        let mut overrides = IndexMap::new();
        overrides.insert(OperatingMode::Low, 50);
        let err = ModeCatalog::builtin().with_budgets(&overrides).unwrap_err();
        assert!(matches!(err, GovernorError::InvalidCatalog(_)));

        let mut overrides = IndexMap::new();
        overrides.insert(OperatingMode::Maximum, 7000);
        let catalog = ModeCatalog::builtin().with_budgets(&overrides).unwrap();
        assert_eq!(catalog.hard_ceiling(), 7000);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Critical.is_highest());
        assert!(!Priority::High.is_highest());
    }
}
