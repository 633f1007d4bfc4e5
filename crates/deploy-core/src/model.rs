//! Assets, deposits, holdings and deployment records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of a deployable asset (rover, station or satellite).
    AssetId
);
string_id!(
    /// Identifier of the user owning assets and holdings.
    OwnerId
);
string_id!(
    /// Identifier of the planet/anomaly an asset or deposit is located at.
    SiteId
);
string_id!(
    /// Identifier of a finite mineral deposit.
    DepositId
);
string_id!(
    /// Identifier of an anomaly observed by a satellite.
    AnomalyId
);
string_id!(
    /// Resource type, e.g. "water" or the item id "21".
    ResourceKind
);

/// Category of a deployable asset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssetCategory {
    /// Rover that hauls from a deposit on a bounded mission.
    MiningAutomaton,
    /// Passive producer that accrues until claimed.
    MiningStation,
    /// Weather satellite observing anomalies, weekly limited.
    Satellite,
}

impl AssetCategory {
    pub const ALL: [AssetCategory; 3] = [
        AssetCategory::MiningAutomaton,
        AssetCategory::MiningStation,
        AssetCategory::Satellite,
    ];

    /// Stable storage/wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetCategory::MiningAutomaton => "mining-automaton",
            AssetCategory::MiningStation => "mining-station",
            AssetCategory::Satellite => "satellite",
        }
    }

    /// Whether missions of this category have a fixed duration.
    pub fn is_bounded(&self) -> bool {
        !matches!(self, AssetCategory::MiningStation)
    }
}

impl fmt::Display for AssetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetCategory {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AssetCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownCategory(s.to_string()))
    }
}

/// Upgrade tiers of an asset. Missing tiers default to 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    /// Speed tier; higher tiers finish missions sooner.
    pub speed: u8,
    /// Capacity tier; caps the haul per mission.
    pub capacity: u8,
    /// Power tier; some resources require a minimum.
    pub power: u8,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            speed: 1,
            capacity: 1,
            power: 1,
        }
    }
}

/// A deployable unit owned by a user and located at a site.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub owner: OwnerId,
    pub site: SiteId,
    pub category: AssetCategory,
    pub config: AssetConfig,
}

/// What a deployment is aimed at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    Deposit(DepositId),
    Anomaly(AnomalyId),
    /// Passive production with no target.
    Passive,
}

impl Target {
    /// Storage discriminant.
    pub fn kind(&self) -> &'static str {
        match self {
            Target::Deposit(_) => "deposit",
            Target::Anomaly(_) => "anomaly",
            Target::Passive => "passive",
        }
    }

    /// Storage id, `None` for passive targets.
    pub fn id(&self) -> Option<&str> {
        match self {
            Target::Deposit(d) => Some(d.as_str()),
            Target::Anomaly(a) => Some(a.as_str()),
            Target::Passive => None,
        }
    }

    /// Rebuild a target from its storage parts.
    pub fn from_parts(kind: &str, id: Option<&str>) -> Result<Self, ValidationError> {
        match (kind, id) {
            ("deposit", Some(id)) => Ok(Target::Deposit(DepositId::new(id))),
            ("anomaly", Some(id)) => Ok(Target::Anomaly(AnomalyId::new(id))),
            ("passive", _) => Ok(Target::Passive),
            ("deposit" | "anomaly", None) => Err(ValidationError::MissingTargetId(kind.to_string())),
            _ => Err(ValidationError::UnknownTargetKind(kind.to_string())),
        }
    }
}

/// "This asset is currently busy." At most one exists per asset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub asset: AssetId,
    pub owner: OwnerId,
    pub category: AssetCategory,
    /// Mission start; the sole source of elapsed time.
    pub start: DateTime<Utc>,
    pub target: Target,
    /// Mission duration fixed at deploy time; `None` for accruing stations.
    pub duration_ms: Option<u64>,
    /// Automaton a satellite deployment is linked to, if any.
    pub linked_automaton: Option<AssetId>,
}

/// A finite-quantity resource at a site.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: DepositId,
    pub site: SiteId,
    pub resource: ResourceKind,
    /// Never negative; zero means depleted but still present.
    pub remaining: u64,
    /// Optional purity metadata in [0,1].
    pub purity: Option<f32>,
}

impl Deposit {
    pub fn is_depleted(&self) -> bool {
        self.remaining == 0
    }
}

/// Accumulated quantity of a resource for an owner at a site.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub owner: OwnerId,
    pub site: SiteId,
    pub resource: ResourceKind,
    pub quantity: u64,
}

/// Append-only log row written on every deployment start. Queried for
/// weekly quotas and satellite dwell state; never cleared on collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentLogEntry {
    pub owner: OwnerId,
    pub category: AssetCategory,
    pub asset: AssetId,
    pub target: Target,
    pub started_at: DateTime<Utc>,
}

impl From<&DeploymentRecord> for DeploymentLogEntry {
    fn from(r: &DeploymentRecord) -> Self {
        Self {
            owner: r.owner.clone(),
            category: r.category,
            asset: r.asset.clone(),
            target: r.target.clone(),
            started_at: r.start,
        }
    }
}

/// Validation errors for data-model invariants.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Identifier fields must not be blank.
    #[error("{0} id must not be empty")]
    EmptyId(&'static str),
    /// Tier outside `1..=max`.
    #[error("{tier} tier {value} is out of range [1, {max}]")]
    TierOutOfRange {
        tier: &'static str,
        value: u8,
        max: u8,
    },
    /// Purity must be within [0, 1].
    #[error("purity must be within [0,1]")]
    InvalidPurity,
    #[error("unknown asset category: {0}")]
    UnknownCategory(String),
    #[error("unknown target kind: {0}")]
    UnknownTargetKind(String),
    #[error("target kind {0} requires an id")]
    MissingTargetId(String),
}

fn check_tier(tier: &'static str, value: u8, max: u8) -> Result<(), ValidationError> {
    if value == 0 || value > max {
        return Err(ValidationError::TierOutOfRange { tier, value, max });
    }
    Ok(())
}

/// Validate an asset against the configured tier bounds.
pub fn validate_asset(
    asset: &Asset,
    bounds: &crate::config::TierBounds,
) -> Result<(), ValidationError> {
    if asset.id.0.trim().is_empty() {
        return Err(ValidationError::EmptyId("asset"));
    }
    if asset.owner.0.trim().is_empty() {
        return Err(ValidationError::EmptyId("owner"));
    }
    check_tier("speed", asset.config.speed, bounds.speed)?;
    check_tier("capacity", asset.config.capacity, bounds.capacity)?;
    check_tier("power", asset.config.power, bounds.power)?;
    Ok(())
}

/// Validate a deposit.
pub fn validate_deposit(deposit: &Deposit) -> Result<(), ValidationError> {
    if deposit.id.0.trim().is_empty() {
        return Err(ValidationError::EmptyId("deposit"));
    }
    if deposit.resource.0.trim().is_empty() {
        return Err(ValidationError::EmptyId("resource"));
    }
    if let Some(p) = deposit.purity {
        if !p.is_finite() || !(0.0..=1.0).contains(&p) {
            return Err(ValidationError::InvalidPurity);
        }
    }
    Ok(())
}
