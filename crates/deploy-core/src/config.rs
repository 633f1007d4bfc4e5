//! Engine configuration: duration tables, tier bounds, quotas and dwell periods.
//!
//! Defaults reproduce the live game's constants. A YAML file may override any
//! subset of fields; missing fields keep their defaults.

use crate::clock::WeeklyBoundary;
use crate::model::{AssetCategory, ResourceKind};
use crate::progress::DwellPeriods;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Errors loading or validating an [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Mission durations in milliseconds indexed by Speed tier (tier 1 first).
///
/// Tiers past the end of the table use the last entry; tier 0 uses the first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationTable(pub Vec<u64>);

impl DurationTable {
    pub fn for_tier(&self, tier: u8) -> u64 {
        let idx = usize::from(tier.max(1) - 1);
        self.0
            .get(idx)
            .or_else(|| self.0.last())
            .copied()
            .unwrap_or(0)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.0.is_empty() || self.0.contains(&0) {
            return Err(ConfigError::Invalid(format!(
                "{name} durations must be non-empty and positive"
            )));
        }
        if self.0.windows(2).any(|w| w[1] > w[0]) {
            return Err(ConfigError::Invalid(format!(
                "{name} durations must not increase with speed tier"
            )));
        }
        Ok(())
    }
}

/// Upper bounds for each configuration tier (lower bound is always 1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierBounds {
    pub speed: u8,
    pub capacity: u8,
    pub power: u8,
}

impl Default for TierBounds {
    fn default() -> Self {
        Self {
            speed: 3,
            capacity: 3,
            power: 3,
        }
    }
}

/// Mining automaton rules.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomatonRules {
    pub durations_ms: DurationTable,
    pub weekly_limit: Option<u32>,
}

impl Default for AutomatonRules {
    fn default() -> Self {
        Self {
            durations_ms: DurationTable(vec![25_000, 15_000, 10_000]),
            weekly_limit: None,
        }
    }
}

/// Mining station accrual rules.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationRules {
    /// Resource credited on claim (item 11, coal).
    pub resource: ResourceKind,
    /// Units per whole elapsed second.
    pub rate_per_second: u64,
    /// Restart accrual at claim time instead of stopping the station.
    pub keep_running_on_claim: bool,
    pub weekly_limit: Option<u32>,
}

impl Default for StationRules {
    fn default() -> Self {
        Self {
            resource: ResourceKind::new("11"),
            rate_per_second: 2,
            keep_running_on_claim: false,
            weekly_limit: None,
        }
    }
}

/// Weather satellite rules.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SatelliteRules {
    pub durations_ms: DurationTable,
    /// Offsets from deployment start at which each mission step begins.
    pub milestones_ms: Vec<u64>,
    pub dwell: DwellPeriods,
    pub weekly_limit: Option<u32>,
}

impl Default for SatelliteRules {
    fn default() -> Self {
        const MINUTE: u64 = 60_000;
        Self {
            durations_ms: DurationTable(vec![40 * MINUTE]),
            milestones_ms: vec![0, 10 * MINUTE, 20 * MINUTE, 30 * MINUTE, 40 * MINUTE],
            dwell: DwellPeriods::default(),
            weekly_limit: Some(1),
        }
    }
}

/// Top-level engine configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tiers: TierBounds,
    pub automaton: AutomatonRules,
    pub station: StationRules,
    pub satellite: SatelliteRules,
    /// Minimum Power tier required to extract a resource.
    pub power_requirements: BTreeMap<ResourceKind, u8>,
    pub weekly_boundary: WeeklyBoundary,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut power_requirements = BTreeMap::new();
        power_requirements.insert(ResourceKind::new("water"), 2);
        power_requirements.insert(ResourceKind::new("21"), 2);
        Self {
            tiers: TierBounds::default(),
            automaton: AutomatonRules::default(),
            station: StationRules::default(),
            satellite: SatelliteRules::default(),
            power_requirements,
            weekly_boundary: WeeklyBoundary::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: EngineConfig = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load and validate a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let cfg = Self::from_yaml_str(&text)?;
        debug!(path = %path.display(), "loaded engine config");
        Ok(cfg)
    }

    /// Deployments allowed per weekly window, `None` when unlimited.
    pub fn weekly_limit(&self, category: AssetCategory) -> Option<u32> {
        match category {
            AssetCategory::MiningAutomaton => self.automaton.weekly_limit,
            AssetCategory::MiningStation => self.station.weekly_limit,
            AssetCategory::Satellite => self.satellite.weekly_limit,
        }
    }

    /// Minimum Power tier for a resource; 1 when unrestricted.
    pub fn required_power(&self, resource: &ResourceKind) -> u8 {
        self.power_requirements.get(resource).copied().unwrap_or(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.speed == 0 || self.tiers.capacity == 0 || self.tiers.power == 0 {
            return Err(ConfigError::Invalid("tier bounds must be >= 1".into()));
        }
        self.automaton.durations_ms.validate("automaton")?;
        self.satellite.durations_ms.validate("satellite")?;
        if self.satellite.milestones_ms.windows(2).any(|w| w[1] <= w[0]) {
            return Err(ConfigError::Invalid(
                "satellite milestones must be strictly increasing".into(),
            ));
        }
        let dwell = &self.satellite.dwell;
        if dwell.expire_after_ms < dwell.unlock_after_ms {
            return Err(ConfigError::Invalid(
                "satellite expiry must not precede unlock".into(),
            ));
        }
        if self.weekly_boundary.offset_minutes.abs() >= 24 * 60 {
            return Err(ConfigError::Invalid(
                "weekly boundary offset must be within +/-24h".into(),
            ));
        }
        if self.station.resource.0.trim().is_empty() {
            return Err(ConfigError::Invalid("station resource must be set".into()));
        }
        Ok(())
    }
}
