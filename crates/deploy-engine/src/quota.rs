//! Weekly limit on deployments per owner and category.

use crate::error::{EngineError, EngineResult};
use crate::store::DeploymentStore;
use chrono::{DateTime, Utc};
use deploy_core::{
    start_of_current_week, time_until_weekly_boundary, AssetCategory, EngineConfig, OwnerId,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Usage of a category within the current weekly window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub used: u32,
    /// Limit plus bonus; `None` when the category is not gated.
    pub allowed: Option<u32>,
    pub window_start: DateTime<Utc>,
    pub resets_in_ms: u64,
}

impl QuotaStatus {
    pub fn can_start(&self) -> bool {
        self.allowed.map_or(true, |allowed| self.used < allowed)
    }
}

pub struct QuotaGate<'a, S> {
    store: &'a S,
    config: &'a EngineConfig,
}

impl<'a, S: DeploymentStore> QuotaGate<'a, S> {
    pub fn new(store: &'a S, config: &'a EngineConfig) -> Self {
        Self { store, config }
    }

    /// Count deployments since the last weekly boundary. `bonus` extends the
    /// configured limit for owners who earned extra deployments.
    pub async fn status(
        &self,
        owner: &OwnerId,
        category: AssetCategory,
        now: DateTime<Utc>,
        bonus: u32,
    ) -> EngineResult<QuotaStatus> {
        let boundary = &self.config.weekly_boundary;
        let window_start = start_of_current_week(now, boundary);
        let resets_in_ms = time_until_weekly_boundary(now, boundary).total_ms;
        let Some(limit) = self.config.weekly_limit(category) else {
            return Ok(QuotaStatus {
                used: 0,
                allowed: None,
                window_start,
                resets_in_ms,
            });
        };
        let entries = self
            .store
            .query_deployments_in_window(owner, category, window_start)
            .await
            .map_err(|e| EngineError::from_read("query_deployments_in_window", e))?;
        let used = u32::try_from(entries.len()).unwrap_or(u32::MAX);
        let status = QuotaStatus {
            used,
            allowed: Some(limit.saturating_add(bonus)),
            window_start,
            resets_in_ms,
        };
        debug!(%owner, %category, used, allowed = ?status.allowed, "weekly quota");
        Ok(status)
    }

    pub async fn can_start_this_week(
        &self,
        owner: &OwnerId,
        category: AssetCategory,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        Ok(self.status(owner, category, now, 0).await?.can_start())
    }
}
