//! Mission duration and yield calculator.
//!
//! Pure functions of asset configuration, target and elapsed time:
//! - duration from the category's Speed-tier table
//! - haul capped by Capacity tier and by what the deposit holds
//! - Power gate for resources with a minimum tier
//! - passive accrual for stations, uncapped until claimed

use crate::clock::Elapsed;
use crate::config::EngineConfig;
use crate::model::{AnomalyId, Asset, AssetCategory, AssetConfig, Deposit, ResourceKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a mission cannot be planned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MissionError {
    /// Asset Power tier below the resource's requirement.
    #[error("power tier {actual} is below the {required} required for {resource}")]
    PowerInsufficient {
        resource: ResourceKind,
        required: u8,
        actual: u8,
    },
    /// Category cannot be deployed against this kind of target.
    #[error("{category} cannot be deployed against a {target} target")]
    UnsupportedTarget {
        category: AssetCategory,
        target: &'static str,
    },
}

/// Resolved target handed to the calculator.
#[derive(Clone, Copy, Debug)]
pub enum MissionTarget<'a> {
    Deposit(&'a Deposit),
    Anomaly(&'a AnomalyId),
    Passive,
}

impl MissionTarget<'_> {
    fn kind(&self) -> &'static str {
        match self {
            MissionTarget::Deposit(_) => "deposit",
            MissionTarget::Anomaly(_) => "anomaly",
            MissionTarget::Passive => "passive",
        }
    }
}

/// Parameters of a mission about to start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionPlan {
    pub category: AssetCategory,
    /// Fixed duration; `None` for open-ended accrual.
    pub duration_ms: Option<u64>,
    /// Resource hauled or accrued, if any.
    pub resource: Option<ResourceKind>,
    /// Upper bound on the haul for bounded missions.
    pub haul_cap: Option<u64>,
}

/// Result of a collection against a deposit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Haul {
    pub resource: ResourceKind,
    pub amount: u64,
    pub updated_remaining: u64,
}

/// Fail with `PowerInsufficient` when `power` is below the resource's minimum.
pub fn check_power(
    config: &EngineConfig,
    power: u8,
    resource: &ResourceKind,
) -> Result<(), MissionError> {
    let required = config.required_power(resource);
    if power < required {
        return Err(MissionError::PowerInsufficient {
            resource: resource.clone(),
            required,
            actual: power,
        });
    }
    Ok(())
}

/// Plan a mission for `asset` against `target`.
pub fn compute_mission(
    config: &EngineConfig,
    asset: &Asset,
    target: &MissionTarget<'_>,
) -> Result<MissionPlan, MissionError> {
    let unsupported = || MissionError::UnsupportedTarget {
        category: asset.category,
        target: target.kind(),
    };
    match (asset.category, target) {
        (AssetCategory::MiningAutomaton, MissionTarget::Deposit(deposit)) => {
            check_power(config, asset.config.power, &deposit.resource)?;
            Ok(MissionPlan {
                category: asset.category,
                duration_ms: Some(config.automaton.durations_ms.for_tier(asset.config.speed)),
                resource: Some(deposit.resource.clone()),
                haul_cap: Some(u64::from(asset.config.capacity)),
            })
        }
        (AssetCategory::Satellite, MissionTarget::Anomaly(_)) => Ok(MissionPlan {
            category: asset.category,
            duration_ms: Some(config.satellite.durations_ms.for_tier(asset.config.speed)),
            resource: None,
            haul_cap: None,
        }),
        (AssetCategory::MiningStation, MissionTarget::Passive) => Ok(MissionPlan {
            category: asset.category,
            duration_ms: None,
            resource: Some(config.station.resource.clone()),
            haul_cap: None,
        }),
        _ => Err(unsupported()),
    }
}

/// Haul = min(remaining, capacity tier). Never exceeds what is present.
pub fn compute_yield(config: &AssetConfig, resource: &ResourceKind, remaining: u64) -> Haul {
    let amount = remaining.min(u64::from(config.capacity));
    Haul {
        resource: resource.clone(),
        amount,
        updated_remaining: remaining - amount,
    }
}

/// Passive production: `floor(elapsed seconds) * rate`, saturating.
pub fn accrued_yield(elapsed: &Elapsed, rate_per_second: u64) -> u64 {
    elapsed.whole_seconds.saturating_mul(rate_per_second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssetId, DepositId, OwnerId, SiteId};
    use proptest::prelude::*;

    fn asset(category: AssetCategory, speed: u8, capacity: u8, power: u8) -> Asset {
        Asset {
            id: AssetId::new("a-1"),
            owner: OwnerId::new("u-1"),
            site: SiteId::new("mars"),
            category,
            config: AssetConfig {
                speed,
                capacity,
                power,
            },
        }
    }

    fn deposit(resource: &str, remaining: u64) -> Deposit {
        Deposit {
            id: DepositId::new("dep-1"),
            site: SiteId::new("mars"),
            resource: ResourceKind::new(resource),
            remaining,
            purity: None,
        }
    }

    #[test]
    fn speed_tier_selects_duration() {
        let cfg = EngineConfig::default();
        let d = deposit("15", 10);
        let durations: Vec<_> = (1..=3)
            .map(|s| {
                compute_mission(
                    &cfg,
                    &asset(AssetCategory::MiningAutomaton, s, 1, 1),
                    &MissionTarget::Deposit(&d),
                )
                .unwrap()
                .duration_ms
            })
            .collect();
        assert_eq!(durations, vec![Some(25_000), Some(15_000), Some(10_000)]);
    }

    #[test]
    fn water_requires_power_two() {
        let cfg = EngineConfig::default();
        let d = deposit("water", 10);
        let err = compute_mission(
            &cfg,
            &asset(AssetCategory::MiningAutomaton, 1, 1, 1),
            &MissionTarget::Deposit(&d),
        )
        .unwrap_err();
        assert_eq!(
            err,
            MissionError::PowerInsufficient {
                resource: ResourceKind::new("water"),
                required: 2,
                actual: 1
            }
        );
        let ok = compute_mission(
            &cfg,
            &asset(AssetCategory::MiningAutomaton, 1, 1, 2),
            &MissionTarget::Deposit(&d),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn satellite_targets_anomalies_only() {
        let cfg = EngineConfig::default();
        let sat = asset(AssetCategory::Satellite, 1, 1, 1);
        let anomaly = AnomalyId::new("cloud-1");
        let plan = compute_mission(&cfg, &sat, &MissionTarget::Anomaly(&anomaly)).unwrap();
        assert_eq!(plan.duration_ms, Some(2_400_000));
        assert_eq!(plan.resource, None);
        let d = deposit("15", 1);
        assert_eq!(
            compute_mission(&cfg, &sat, &MissionTarget::Deposit(&d)),
            Err(MissionError::UnsupportedTarget {
                category: AssetCategory::Satellite,
                target: "deposit"
            })
        );
    }

    #[test]
    fn station_plan_is_open_ended() {
        let cfg = EngineConfig::default();
        let plan = compute_mission(
            &cfg,
            &asset(AssetCategory::MiningStation, 1, 1, 1),
            &MissionTarget::Passive,
        )
        .unwrap();
        assert_eq!(plan.duration_ms, None);
        assert_eq!(plan.resource, Some(ResourceKind::new("11")));
    }

    #[test]
    fn haul_from_nearly_empty_deposit() {
        let cfg = AssetConfig {
            speed: 2,
            capacity: 2,
            power: 1,
        };
        let h = compute_yield(&cfg, &ResourceKind::new("15"), 1);
        assert_eq!(h.amount, 1);
        assert_eq!(h.updated_remaining, 0);
        assert_eq!(compute_yield(&cfg, &ResourceKind::new("15"), 0).amount, 0);
    }

    #[test]
    fn station_accrues_two_per_second() {
        let e = Elapsed::from_ms(10_999);
        assert_eq!(accrued_yield(&e, 2), 20);
        assert_eq!(accrued_yield(&Elapsed::from_ms(999), 2), 0);
    }

    proptest! {
        #[test]
        fn haul_is_capped(capacity in 1u8..=10, remaining in 0u64..1_000) {
            let cfg = AssetConfig { speed: 1, capacity, power: 1 };
            let h = compute_yield(&cfg, &ResourceKind::new("15"), remaining);
            prop_assert_eq!(h.amount, remaining.min(u64::from(capacity)));
            prop_assert_eq!(h.updated_remaining + h.amount, remaining);
        }

        #[test]
        fn accrual_is_monotonic(a in 0u64..10_000_000, b in 0u64..10_000_000) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(accrued_yield(&Elapsed::from_ms(lo), 2) <= accrued_yield(&Elapsed::from_ms(hi), 2));
        }
    }
}
