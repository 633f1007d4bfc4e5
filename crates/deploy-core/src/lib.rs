#![deny(warnings)]

//! Core domain models and pure rules for the timed deployment engine.
//!
//! Nothing in this crate performs I/O or reads the system clock: every
//! function that depends on time takes `now` from the caller. The crate
//! provides:
//! - identifiers and records for assets, deposits, holdings and deployments
//! - the clock/time-window helpers used for countdowns and weekly windows
//! - the mission/yield calculator
//! - progress, milestone and dwell state derived from `(record, now)`
//! - the engine configuration and its YAML loader

pub mod clock;
pub mod config;
pub mod mission;
pub mod model;
pub mod progress;

pub use clock::{
    elapsed_since, start_of_current_week, time_since, time_until_weekly_boundary,
    truncate_to_millis, Countdown, Elapsed, WeeklyBoundary,
};
pub use config::{
    AutomatonRules, ConfigError, DurationTable, EngineConfig, SatelliteRules, StationRules,
    TierBounds,
};
pub use mission::{
    accrued_yield, check_power, compute_mission, compute_yield, Haul, MissionError, MissionPlan,
    MissionTarget,
};
pub use model::*;
pub use progress::{
    derive_progress, dwell_status, milestone_progress, DeploymentState, DwellPeriods,
    DwellStatus, Lifecycle, MilestoneProgress, Progress,
};
