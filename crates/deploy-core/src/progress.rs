//! State derived at read time from a deployment start and `now`.
//!
//! Nothing here is stored: `ReadyToCollect`, milestones and dwell flags are
//! recomputed on every query, so a caller that reconnects mid-mission sees
//! the same state as one that never left.

use crate::clock::{ms_between, Elapsed};
use crate::mission::accrued_yield;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const DAY_MS: u64 = 24 * 60 * 60 * 1_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Idle,
    Busy,
    ReadyToCollect,
    Accruing,
}

/// How time turns into state for a category.
#[derive(Clone, Copy, Debug)]
pub enum Lifecycle<'a> {
    /// Fixed-duration mission; optional milestone offsets for step display.
    Bounded {
        duration_ms: u64,
        milestones: &'a [u64],
    },
    /// Open-ended accrual until claimed.
    Accruing { rate_per_second: u64 },
}

/// Position within a stepped mission.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MilestoneProgress {
    /// Index of the last milestone reached.
    pub index: usize,
    pub count: usize,
    /// Fraction of the way to the next milestone, 1.0 after the last one.
    pub step_fraction: f32,
}

/// Snapshot for the presentation layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub state: DeploymentState,
    pub elapsed_ms: u64,
    pub duration_ms: Option<u64>,
    pub remaining_ms: Option<u64>,
    /// Whole percent complete in [0, 100]; 0 for idle and accruing assets.
    pub percent: u8,
    /// Units accrued so far (stations only).
    pub accrued: Option<u64>,
    pub milestone: Option<MilestoneProgress>,
}

impl Progress {
    pub fn idle() -> Self {
        Self {
            state: DeploymentState::Idle,
            elapsed_ms: 0,
            duration_ms: None,
            remaining_ms: None,
            percent: 0,
            accrued: None,
            milestone: None,
        }
    }
}

/// Derive the current state of an asset whose deployment began at `start`.
pub fn derive_progress(
    start: Option<DateTime<Utc>>,
    lifecycle: &Lifecycle<'_>,
    now: DateTime<Utc>,
) -> Progress {
    let Some(start) = start else {
        return Progress::idle();
    };
    let elapsed_ms = ms_between(start, now);
    match *lifecycle {
        Lifecycle::Bounded {
            duration_ms,
            milestones,
        } => {
            let state = if elapsed_ms >= duration_ms {
                DeploymentState::ReadyToCollect
            } else {
                DeploymentState::Busy
            };
            let percent = if duration_ms == 0 {
                100
            } else {
                u8::try_from((elapsed_ms.saturating_mul(100) / duration_ms).min(100)).unwrap_or(100)
            };
            Progress {
                state,
                elapsed_ms,
                duration_ms: Some(duration_ms),
                remaining_ms: Some(duration_ms.saturating_sub(elapsed_ms)),
                percent,
                accrued: None,
                milestone: milestone_progress(elapsed_ms, milestones),
            }
        }
        Lifecycle::Accruing { rate_per_second } => Progress {
            state: DeploymentState::Accruing,
            elapsed_ms,
            duration_ms: None,
            remaining_ms: None,
            percent: 0,
            accrued: Some(accrued_yield(&Elapsed::from_ms(elapsed_ms), rate_per_second)),
            milestone: None,
        },
    }
}

/// Locate `elapsed_ms` among increasing milestone offsets.
pub fn milestone_progress(elapsed_ms: u64, offsets: &[u64]) -> Option<MilestoneProgress> {
    let first = *offsets.first()?;
    let index = offsets.iter().rposition(|&t| elapsed_ms >= t).unwrap_or(0);
    let prev = offsets.get(index).copied().unwrap_or(first);
    let step_fraction = match offsets.get(index + 1) {
        Some(&next) if next > prev => {
            elapsed_ms.saturating_sub(prev) as f32 / (next - prev) as f32
        }
        Some(_) => 0.0,
        None => 1.0,
    };
    Some(MilestoneProgress {
        index,
        count: offsets.len(),
        step_fraction: step_fraction.clamp(0.0, 1.0),
    })
}

/// Delays after deployment start before the unlock and expiry flags turn on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DwellPeriods {
    pub unlock_after_ms: u64,
    pub expire_after_ms: u64,
}

impl Default for DwellPeriods {
    fn default() -> Self {
        Self {
            unlock_after_ms: DAY_MS,
            expire_after_ms: 3 * DAY_MS,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DwellStatus {
    pub unlocked: bool,
    pub expired: bool,
    /// Unlocked and not yet expired.
    pub actionable: bool,
}

pub fn dwell_status(start: DateTime<Utc>, now: DateTime<Utc>, periods: &DwellPeriods) -> DwellStatus {
    let elapsed = ms_between(start, now);
    let unlocked = elapsed >= periods.unlock_after_ms;
    let expired = elapsed >= periods.expire_after_ms;
    DwellStatus {
        unlocked,
        expired,
        actionable: unlocked && !expired,
    }
}
