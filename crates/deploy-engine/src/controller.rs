//! Deployment lifecycle: deploy, poll, collect, activate and claim.
//!
//! The controller keeps no state of its own. Every call reads the record
//! from the store, derives the current state from `(record, now)` and, for
//! transitions, hands the store a conditional write.

use crate::error::{EngineError, EngineResult};
use crate::quota::{QuotaGate, QuotaStatus};
use crate::store::{
    DeploymentStore, HoldingCredit, RecordAction, SettleOutcome, Settlement, StoreError,
};
use chrono::{DateTime, Utc};
use deploy_core::{
    accrued_yield, compute_mission, compute_yield, derive_progress, dwell_status, elapsed_since,
    truncate_to_millis, validate_asset, validate_deposit, AnomalyId, Asset, AssetCategory,
    AssetId, DeploymentRecord, DepositId, DwellStatus, EngineConfig, Holding, Lifecycle,
    MissionTarget, OwnerId, Progress, ResourceKind, SiteId, Target,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Re-reads allowed when a shared deposit shrinks between read and settle.
const COLLECT_ATTEMPTS: usize = 3;

/// Arguments of a deployment start beyond the asset itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub target: Target,
    /// Rover feeding this deployment, recorded for display only.
    #[serde(default)]
    pub linked_automaton: Option<AssetId>,
    /// Extra weekly deployments granted to the owner.
    #[serde(default)]
    pub quota_bonus: u32,
}

impl From<Target> for DeployRequest {
    fn from(target: Target) -> Self {
        Self {
            target,
            linked_automaton: None,
            quota_bonus: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployed {
    pub asset: AssetId,
    pub started_at: DateTime<Utc>,
    /// `None` for open-ended accrual.
    pub duration_ms: Option<u64>,
}

/// Result of collecting a bounded mission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Collection {
    Hauled { resource: ResourceKind, amount: u64 },
    /// Deposit was empty at collection time; the record is cleared.
    Depleted { resource: ResourceKind },
    /// Satellite observation finished; nothing is credited.
    Observed { anomaly: AnomalyId },
    /// No active record, usually because an earlier call collected it.
    AlreadyCollected,
}

impl Collection {
    pub fn amount(&self) -> u64 {
        match self {
            Collection::Hauled { amount, .. } => *amount,
            _ => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub resource: ResourceKind,
    pub amount: u64,
    /// Accrual continues from the claim instant.
    pub restarted: bool,
}

pub struct DeploymentController<S> {
    store: Arc<S>,
    config: Arc<EngineConfig>,
}

impl<S> Clone for DeploymentController<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: DeploymentStore> DeploymentController<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Idle -> Busy for automatons and satellites, Idle -> Accruing for
    /// stations given a passive target.
    pub async fn start_deployment(
        &self,
        asset: &AssetId,
        request: impl Into<DeployRequest>,
        now: DateTime<Utc>,
    ) -> EngineResult<Deployed> {
        let result = self.start_inner(asset, request.into(), now).await;
        report("start_deployment", asset, &result);
        result
    }

    /// Idle -> Accruing for a mining station.
    pub async fn activate(&self, asset: &AssetId, now: DateTime<Utc>) -> EngineResult<Deployed> {
        let result = self.activate_inner(asset, now).await;
        report("activate", asset, &result);
        result
    }

    pub async fn get_progress(&self, asset: &AssetId, now: DateTime<Utc>) -> EngineResult<Progress> {
        let result = self.progress_inner(asset, now).await;
        report("get_progress", asset, &result);
        result
    }

    /// ReadyToCollect -> Idle. Safe to call again after any failure: a
    /// second call on a settled record returns `AlreadyCollected`.
    pub async fn collect(&self, asset: &AssetId, now: DateTime<Utc>) -> EngineResult<Collection> {
        let result = self.collect_inner(asset, now).await;
        report("collect", asset, &result);
        result
    }

    /// Accruing -> Idle, or Accruing -> Accruing when `keep_running`
    /// (defaulting to the configured mode) restarts accrual at `now`.
    pub async fn claim(
        &self,
        asset: &AssetId,
        now: DateTime<Utc>,
        keep_running: Option<bool>,
    ) -> EngineResult<Claim> {
        let result = self.claim_inner(asset, now, keep_running).await;
        report("claim", asset, &result);
        result
    }

    /// Dwell flags of the satellite's most recent deployment.
    pub async fn satellite_status(
        &self,
        asset: &AssetId,
        now: DateTime<Utc>,
    ) -> EngineResult<DwellStatus> {
        let result = self.satellite_inner(asset, now).await;
        report("satellite_status", asset, &result);
        result
    }

    pub async fn quota_status(
        &self,
        owner: &OwnerId,
        category: AssetCategory,
        now: DateTime<Utc>,
        bonus: u32,
    ) -> EngineResult<QuotaStatus> {
        QuotaGate::new(self.store.as_ref(), &self.config)
            .status(owner, category, now, bonus)
            .await
    }

    pub async fn holding(
        &self,
        owner: &OwnerId,
        site: &SiteId,
        resource: &ResourceKind,
    ) -> EngineResult<Holding> {
        self.store
            .read_holding(owner, site, resource)
            .await
            .map_err(|e| EngineError::from_read("read_holding", e))
    }

    async fn activate_inner(&self, asset_id: &AssetId, now: DateTime<Utc>) -> EngineResult<Deployed> {
        let asset = self.read_asset(asset_id).await?;
        if asset.category != AssetCategory::MiningStation {
            return Err(EngineError::WrongCategory {
                category: asset.category,
                operation: "activate",
            });
        }
        self.start_inner(asset_id, Target::Passive.into(), now).await
    }

    async fn progress_inner(&self, asset: &AssetId, now: DateTime<Utc>) -> EngineResult<Progress> {
        let Some(record) = self.active(asset).await? else {
            return Ok(Progress::idle());
        };
        let duration = self.bounded_duration(&record).await?;
        Ok(derive_progress(
            Some(record.start),
            &self.lifecycle(&record, duration),
            now,
        ))
    }

    async fn satellite_inner(&self, asset_id: &AssetId, now: DateTime<Utc>) -> EngineResult<DwellStatus> {
        let asset = self.read_asset(asset_id).await?;
        if asset.category != AssetCategory::Satellite {
            return Err(EngineError::WrongCategory {
                category: asset.category,
                operation: "satellite_status",
            });
        }
        let latest = self
            .store
            .latest_log_entry(asset_id)
            .await
            .map_err(|e| EngineError::from_read("latest_log_entry", e))?;
        // Dwell runs from the latest start even after the quota window rolls over.
        Ok(latest
            .map(|entry| dwell_status(entry.started_at, now, &self.config.satellite.dwell))
            .unwrap_or_default())
    }

    async fn start_inner(
        &self,
        asset_id: &AssetId,
        request: DeployRequest,
        now: DateTime<Utc>,
    ) -> EngineResult<Deployed> {
        let now = truncate_to_millis(now);
        let asset = self.read_asset(asset_id).await?;
        validate_asset(&asset, &self.config.tiers)?;
        if self.active(asset_id).await?.is_some() {
            return Err(EngineError::AlreadyDeployed {
                asset: asset_id.clone(),
            });
        }

        let deposit = match &request.target {
            Target::Deposit(id) => {
                let deposit = self
                    .store
                    .read_deposit(id)
                    .await
                    .map_err(|e| EngineError::from_read("read_deposit", e))?;
                validate_deposit(&deposit)?;
                Some(deposit)
            }
            _ => None,
        };
        let target = match (&request.target, &deposit) {
            (Target::Deposit(_), Some(deposit)) => MissionTarget::Deposit(deposit),
            (Target::Anomaly(id), _) => MissionTarget::Anomaly(id),
            _ => MissionTarget::Passive,
        };
        let plan = compute_mission(&self.config, &asset, &target)?;

        if self.config.weekly_limit(asset.category).is_some() {
            let status = QuotaGate::new(self.store.as_ref(), &self.config)
                .status(&asset.owner, asset.category, now, request.quota_bonus)
                .await?;
            if !status.can_start() {
                return Err(EngineError::QuotaExceeded {
                    category: asset.category,
                    resets_in_ms: status.resets_in_ms,
                });
            }
        }

        let record = DeploymentRecord {
            asset: asset.id.clone(),
            owner: asset.owner.clone(),
            category: asset.category,
            start: now,
            target: request.target,
            duration_ms: plan.duration_ms,
            linked_automaton: request.linked_automaton,
        };
        self.store
            .write_deployment(&record)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => EngineError::AlreadyDeployed {
                    asset: asset.id.clone(),
                },
                other => EngineError::from_write("write_deployment", other),
            })?;

        info!(
            asset = %asset.id,
            owner = %asset.owner,
            category = %asset.category,
            target_kind = record.target.kind(),
            duration_ms = ?plan.duration_ms,
            "deployment started"
        );
        Ok(Deployed {
            asset: record.asset,
            started_at: now,
            duration_ms: plan.duration_ms,
        })
    }

    async fn collect_inner(&self, asset_id: &AssetId, now: DateTime<Utc>) -> EngineResult<Collection> {
        let Some(record) = self.active(asset_id).await? else {
            debug!(asset = %asset_id, "nothing to collect");
            return Ok(Collection::AlreadyCollected);
        };
        if !record.category.is_bounded() {
            return Err(EngineError::WrongCategory {
                category: record.category,
                operation: "collect",
            });
        }
        let duration = self.bounded_duration(&record).await?;
        let elapsed = elapsed_since(record.start, now).total_ms;
        if elapsed < duration {
            return Err(EngineError::NotReady {
                asset: asset_id.clone(),
                remaining_ms: duration - elapsed,
            });
        }

        match &record.target {
            Target::Anomaly(anomaly) => {
                let settlement = Settlement {
                    asset: record.asset.clone(),
                    expected_start: record.start,
                    debit: None,
                    credit: None,
                    after: RecordAction::Clear,
                };
                Ok(match self.settle(&settlement).await? {
                    SettleOutcome::Applied => {
                        info!(asset = %asset_id, owner = %record.owner, anomaly = %anomaly, "observation collected");
                        Collection::Observed {
                            anomaly: anomaly.clone(),
                        }
                    }
                    SettleOutcome::AlreadySettled => Collection::AlreadyCollected,
                })
            }
            Target::Deposit(deposit_id) => self.collect_haul(&record, deposit_id).await,
            Target::Passive => Err(EngineError::UnsupportedTarget {
                category: record.category,
                target: "passive",
            }),
        }
    }

    async fn collect_haul(
        &self,
        record: &DeploymentRecord,
        deposit_id: &DepositId,
    ) -> EngineResult<Collection> {
        let asset = self.read_asset(&record.asset).await?;
        for attempt in 1..=COLLECT_ATTEMPTS {
            let deposit = self
                .store
                .read_deposit(deposit_id)
                .await
                .map_err(|e| EngineError::from_read("read_deposit", e))?;
            let haul = compute_yield(&asset.config, &deposit.resource, deposit.remaining);
            let settlement = Settlement {
                asset: record.asset.clone(),
                expected_start: record.start,
                debit: (haul.amount > 0).then(|| (deposit.id.clone(), haul.amount)),
                credit: (haul.amount > 0).then(|| HoldingCredit {
                    owner: record.owner.clone(),
                    site: deposit.site.clone(),
                    resource: haul.resource.clone(),
                    amount: haul.amount,
                }),
                after: RecordAction::Clear,
            };
            match self.store.settle(&settlement).await {
                Ok(SettleOutcome::AlreadySettled) => return Ok(Collection::AlreadyCollected),
                Ok(SettleOutcome::Applied) if deposit.is_depleted() => {
                    info!(asset = %record.asset, deposit = %deposit.id, "deposit depleted, record cleared");
                    return Ok(Collection::Depleted {
                        resource: haul.resource,
                    });
                }
                Ok(SettleOutcome::Applied) => {
                    info!(
                        asset = %record.asset,
                        owner = %record.owner,
                        deposit = %deposit.id,
                        resource = %haul.resource,
                        amount = haul.amount,
                        remaining = haul.updated_remaining,
                        "haul collected"
                    );
                    return Ok(Collection::Hauled {
                        resource: haul.resource,
                        amount: haul.amount,
                    });
                }
                Err(StoreError::InsufficientRemaining { remaining, .. }) => {
                    debug!(deposit = %deposit.id, remaining, attempt, "deposit shrank, recomputing haul");
                }
                Err(e) => return Err(EngineError::from_write("settle", e)),
            }
        }
        Err(EngineError::Contended {
            deposit: deposit_id.clone(),
        })
    }

    async fn claim_inner(
        &self,
        asset_id: &AssetId,
        now: DateTime<Utc>,
        keep_running: Option<bool>,
    ) -> EngineResult<Claim> {
        let asset = self.read_asset(asset_id).await?;
        if asset.category != AssetCategory::MiningStation {
            return Err(EngineError::WrongCategory {
                category: asset.category,
                operation: "claim",
            });
        }
        let rules = &self.config.station;
        let nothing = Claim {
            resource: rules.resource.clone(),
            amount: 0,
            restarted: false,
        };
        let Some(record) = self.active(asset_id).await? else {
            return Ok(nothing);
        };
        let amount = accrued_yield(&elapsed_since(record.start, now), rules.rate_per_second);
        if amount == 0 {
            return Ok(nothing);
        }
        let keep = keep_running.unwrap_or(rules.keep_running_on_claim);
        let settlement = Settlement {
            asset: record.asset.clone(),
            expected_start: record.start,
            debit: None,
            credit: Some(HoldingCredit {
                owner: record.owner.clone(),
                site: asset.site.clone(),
                resource: rules.resource.clone(),
                amount,
            }),
            after: if keep {
                RecordAction::Restart(truncate_to_millis(now))
            } else {
                RecordAction::Clear
            },
        };
        match self.settle(&settlement).await? {
            SettleOutcome::Applied => {
                info!(asset = %asset_id, owner = %record.owner, resource = %rules.resource, amount, restarted = keep, "station claimed");
                Ok(Claim {
                    resource: rules.resource.clone(),
                    amount,
                    restarted: keep,
                })
            }
            SettleOutcome::AlreadySettled => Ok(nothing),
        }
    }

    async fn read_asset(&self, id: &AssetId) -> EngineResult<Asset> {
        self.store
            .read_asset(id)
            .await
            .map_err(|e| EngineError::from_read("read_asset", e))
    }

    async fn active(&self, asset: &AssetId) -> EngineResult<Option<DeploymentRecord>> {
        self.store
            .read_active_deployment(asset)
            .await
            .map_err(|e| EngineError::from_read("read_active_deployment", e))
    }

    async fn settle(&self, settlement: &Settlement) -> EngineResult<SettleOutcome> {
        self.store
            .settle(settlement)
            .await
            .map_err(|e| EngineError::from_write("settle", e))
    }

    /// Duration stored at deploy time, falling back to the current table for
    /// records written without one. Zero for open-ended accrual.
    async fn bounded_duration(&self, record: &DeploymentRecord) -> EngineResult<u64> {
        if let Some(ms) = record.duration_ms {
            return Ok(ms);
        }
        let table = match record.category {
            AssetCategory::MiningAutomaton => &self.config.automaton.durations_ms,
            AssetCategory::Satellite => &self.config.satellite.durations_ms,
            AssetCategory::MiningStation => return Ok(0),
        };
        let asset = self.read_asset(&record.asset).await?;
        Ok(table.for_tier(asset.config.speed))
    }

    fn lifecycle(&self, record: &DeploymentRecord, duration_ms: u64) -> Lifecycle<'_> {
        match record.category {
            AssetCategory::MiningStation => Lifecycle::Accruing {
                rate_per_second: self.config.station.rate_per_second,
            },
            AssetCategory::Satellite => Lifecycle::Bounded {
                duration_ms,
                milestones: &self.config.satellite.milestones_ms,
            },
            AssetCategory::MiningAutomaton => Lifecycle::Bounded {
                duration_ms,
                milestones: &[],
            },
        }
    }
}

fn report<T>(op: &'static str, asset: &AssetId, result: &EngineResult<T>) {
    let Err(err) = result else {
        return;
    };
    match err {
        e if e.is_precondition() => debug!(op, asset = %asset, error = %err, "precondition not met"),
        EngineError::AssetNotFound(_) | EngineError::DepositNotFound(_) => {
            warn!(op, asset = %asset, error = %err, "referenced entity missing")
        }
        EngineError::StoreUnavailable { .. }
        | EngineError::WriteOutcomeUnknown { .. }
        | EngineError::Corrupt(_) => error!(op, asset = %asset, error = %err, "store failure"),
        _ => warn!(op, asset = %asset, error = %err, "request rejected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryStore, StoreOp};
    use chrono::{Duration, TimeZone};
    use deploy_core::{AssetConfig, DeploymentState, Deposit};
    use tokio::task::JoinSet;

    // Wednesday, mid-window for the default weekly boundary.
    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 12, 9, 0, 0).unwrap()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        t0() + Duration::milliseconds(ms)
    }

    fn owner() -> OwnerId {
        OwnerId::new("u-1")
    }

    fn mars() -> SiteId {
        SiteId::new("mars")
    }

    fn asset(id: &str, category: AssetCategory, speed: u8, capacity: u8, power: u8) -> Asset {
        Asset {
            id: AssetId::new(id),
            owner: owner(),
            site: mars(),
            category,
            config: AssetConfig {
                speed,
                capacity,
                power,
            },
        }
    }

    fn deposit(id: &str, resource: &str, remaining: u64) -> Deposit {
        Deposit {
            id: DepositId::new(id),
            site: mars(),
            resource: ResourceKind::new(resource),
            remaining,
            purity: None,
        }
    }

    fn rig() -> (DeploymentController<InMemoryStore>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        store.insert_asset(asset("rover-1", AssetCategory::MiningAutomaton, 2, 2, 1));
        store.insert_asset(asset("rover-2", AssetCategory::MiningAutomaton, 2, 2, 1));
        store.insert_asset(asset("station-1", AssetCategory::MiningStation, 1, 1, 1));
        store.insert_asset(asset("sat-1", AssetCategory::Satellite, 1, 1, 1));
        store.insert_deposit(deposit("dep-1", "15", 1)).unwrap();
        store.insert_deposit(deposit("ice-1", "water", 10)).unwrap();
        let controller = DeploymentController::new(Arc::clone(&store), EngineConfig::default());
        (controller, store)
    }

    fn rover() -> AssetId {
        AssetId::new("rover-1")
    }

    fn dep1() -> Target {
        Target::Deposit(DepositId::new("dep-1"))
    }

    #[tokio::test]
    async fn rover_hauls_last_unit_then_noops() {
        let (c, store) = rig();
        let d = c.start_deployment(&rover(), dep1(), t0()).await.unwrap();
        assert_eq!(d.duration_ms, Some(15_000));

        let p = c.get_progress(&rover(), at(14_999)).await.unwrap();
        assert_eq!(p.state, DeploymentState::Busy);
        assert_eq!(
            c.collect(&rover(), at(14_999)).await,
            Err(EngineError::NotReady {
                asset: rover(),
                remaining_ms: 1
            })
        );

        let p = c.get_progress(&rover(), at(15_000)).await.unwrap();
        assert_eq!(p.state, DeploymentState::ReadyToCollect);
        let got = c.collect(&rover(), at(15_000)).await.unwrap();
        assert_eq!(
            got,
            Collection::Hauled {
                resource: ResourceKind::new("15"),
                amount: 1
            }
        );
        assert_eq!(store.deposit_remaining(&DepositId::new("dep-1")), Some(0));
        assert_eq!(store.holding(&owner(), &mars(), &ResourceKind::new("15")), 1);

        let again = c.collect(&rover(), at(16_000)).await.unwrap();
        assert_eq!(again, Collection::AlreadyCollected);
        assert_eq!(again.amount(), 0);
        assert_eq!(store.holding(&owner(), &mars(), &ResourceKind::new("15")), 1);
        assert_eq!(
            c.get_progress(&rover(), at(16_000)).await.unwrap(),
            Progress::idle()
        );
    }

    #[tokio::test]
    async fn low_power_creates_no_record() {
        let (c, store) = rig();
        let err = c
            .start_deployment(&rover(), Target::Deposit(DepositId::new("ice-1")), t0())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::PowerInsufficient {
                resource: ResourceKind::new("water"),
                required: 2,
                actual: 1
            }
        );
        assert_eq!(store.active_deployments(), 0);
        assert_eq!(store.log_len(), 0);
    }

    #[tokio::test]
    async fn second_start_is_already_deployed() {
        let (c, _) = rig();
        c.start_deployment(&rover(), dep1(), t0()).await.unwrap();
        let err = c.start_deployment(&rover(), dep1(), at(1)).await.unwrap_err();
        assert_eq!(err, EngineError::AlreadyDeployed { asset: rover() });
        assert!(err.is_precondition());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_admit_one() {
        let (c, store) = rig();
        let mut set = JoinSet::new();
        for i in 0..16 {
            let c = c.clone();
            set.spawn(async move { c.start_deployment(&rover(), dep1(), at(i)).await });
        }
        let mut ok = 0;
        while let Some(res) = set.join_next().await {
            match res.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert_eq!(e, EngineError::AlreadyDeployed { asset: rover() }),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(store.active_deployments(), 1);
        assert_eq!(store.log_len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_collects_pay_once() {
        let (c, store) = rig();
        let ore = DepositId::new("ore-1");
        store.insert_deposit(deposit("ore-1", "15", 10)).unwrap();
        c.start_deployment(&rover(), Target::Deposit(ore.clone()), t0())
            .await
            .unwrap();
        let mut set = JoinSet::new();
        for i in 0..16 {
            let c = c.clone();
            set.spawn(async move { c.collect(&rover(), at(20_000 + i)).await });
        }
        let mut hauled = 0;
        while let Some(res) = set.join_next().await {
            match res.unwrap().unwrap() {
                Collection::Hauled { amount, .. } => {
                    assert_eq!(amount, 2);
                    hauled += 1;
                }
                other => assert_eq!(other, Collection::AlreadyCollected),
            }
        }
        assert_eq!(hauled, 1);
        assert_eq!(store.holding(&owner(), &mars(), &ResourceKind::new("15")), 2);
        assert_eq!(store.deposit_remaining(&ore), Some(8));
        assert_eq!(store.active_deployments(), 0);
    }

    #[tokio::test]
    async fn emptied_deposit_yields_zero() {
        let (c, store) = rig();
        let rover2 = AssetId::new("rover-2");
        c.start_deployment(&rover(), dep1(), t0()).await.unwrap();
        c.start_deployment(&rover2, dep1(), t0()).await.unwrap();
        assert_eq!(c.collect(&rover(), at(15_000)).await.unwrap().amount(), 1);
        let second = c.collect(&rover2, at(15_000)).await.unwrap();
        assert_eq!(
            second,
            Collection::Depleted {
                resource: ResourceKind::new("15")
            }
        );
        assert_eq!(store.active_deployments(), 0);
        assert_eq!(store.holding(&owner(), &mars(), &ResourceKind::new("15")), 1);
    }

    #[tokio::test]
    async fn lost_settle_ack_is_safe_to_retry() {
        let (c, store) = rig();
        c.start_deployment(&rover(), dep1(), t0()).await.unwrap();
        store.lose_next_ack(StoreOp::Settle);
        let err = c.collect(&rover(), at(20_000)).await.unwrap_err();
        assert!(matches!(err, EngineError::WriteOutcomeUnknown { op: "settle", .. }));
        assert_eq!(
            c.collect(&rover(), at(21_000)).await.unwrap(),
            Collection::AlreadyCollected
        );
        assert_eq!(store.holding(&owner(), &mars(), &ResourceKind::new("15")), 1);
        assert_eq!(store.deposit_remaining(&DepositId::new("dep-1")), Some(0));
    }

    #[tokio::test]
    async fn lost_write_ack_surfaces_uncertainty() {
        let (c, store) = rig();
        store.lose_next_ack(StoreOp::WriteDeployment);
        let err = c.start_deployment(&rover(), dep1(), t0()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::WriteOutcomeUnknown {
                op: "write_deployment",
                ..
            }
        ));
        assert!(!err.is_retryable());
        let p = c.get_progress(&rover(), at(1_000)).await.unwrap();
        assert_eq!(p.state, DeploymentState::Busy);
    }

    #[tokio::test]
    async fn read_failures_are_retryable() {
        let (c, store) = rig();
        store.fail_next(StoreOp::ReadAsset);
        let err = c.start_deployment(&rover(), dep1(), t0()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.log_len(), 0);
        assert!(c.start_deployment(&rover(), dep1(), t0()).await.is_ok());
    }

    #[tokio::test]
    async fn missing_entities_are_reported() {
        let (c, _) = rig();
        let ghost = AssetId::new("ghost");
        assert_eq!(
            c.start_deployment(&ghost, dep1(), t0()).await,
            Err(EngineError::AssetNotFound(ghost))
        );
        assert_eq!(
            c.start_deployment(&rover(), Target::Deposit(DepositId::new("nope")), t0())
                .await,
            Err(EngineError::DepositNotFound(DepositId::new("nope")))
        );
    }

    #[tokio::test]
    async fn satellite_week_dwell_and_quota() {
        let (c, store) = rig();
        let sat = AssetId::new("sat-1");
        let cloud = Target::Anomaly(AnomalyId::new("cloud-7"));
        let d = c.start_deployment(&sat, cloud.clone(), t0()).await.unwrap();
        assert_eq!(d.duration_ms, Some(2_400_000));

        let p = c.get_progress(&sat, at(15 * 60_000)).await.unwrap();
        assert_eq!(p.milestone.map(|m| (m.index, m.count)), Some((1, 5)));
        assert_eq!(p.percent, 37);

        let done = c.collect(&sat, at(2_400_000)).await.unwrap();
        assert_eq!(
            done,
            Collection::Observed {
                anomaly: AnomalyId::new("cloud-7")
            }
        );
        assert_eq!(store.active_deployments(), 0);

        let err = c.start_deployment(&sat, cloud.clone(), at(3_000_000)).await.unwrap_err();
        let reset = Utc.with_ymd_and_hms(2024, 6, 15, 14, 1, 0).unwrap();
        assert_eq!(
            err,
            EngineError::QuotaExceeded {
                category: AssetCategory::Satellite,
                resets_in_ms: (reset - at(3_000_000)).num_milliseconds() as u64,
            }
        );

        let day = 86_400_000;
        assert_eq!(
            c.satellite_status(&sat, at(day - 1)).await.unwrap(),
            DwellStatus::default()
        );
        let s = c.satellite_status(&sat, at(day)).await.unwrap();
        assert!(s.unlocked && !s.expired && s.actionable);
        let s = c.satellite_status(&sat, at(3 * day)).await.unwrap();
        assert!(s.unlocked && s.expired && !s.actionable);

        assert!(c.start_deployment(&sat, cloud, reset).await.is_ok());
    }

    #[tokio::test]
    async fn dwell_carries_across_the_weekly_reset() {
        let (c, _) = rig();
        let sat = AssetId::new("sat-1");
        let thursday = Utc.with_ymd_and_hms(2024, 6, 13, 12, 0, 0).unwrap();
        c.start_deployment(&sat, Target::Anomaly(AnomalyId::new("cloud-7")), thursday)
            .await
            .unwrap();
        c.collect(&sat, thursday + Duration::minutes(40)).await.unwrap();

        let s = c.satellite_status(&sat, thursday + Duration::days(1)).await.unwrap();
        assert!(s.unlocked && !s.expired);
        // Saturday 15:00Z, past the 14:01Z reset.
        let s = c
            .satellite_status(&sat, thursday + Duration::days(2) + Duration::hours(3))
            .await
            .unwrap();
        assert!(s.unlocked && !s.expired && s.actionable);
        let s = c.satellite_status(&sat, thursday + Duration::days(3)).await.unwrap();
        assert!(s.unlocked && s.expired && !s.actionable);
    }

    #[tokio::test]
    async fn quota_bonus_admits_a_second_satellite() {
        let (c, _) = rig();
        let sat = AssetId::new("sat-1");
        let cloud = Target::Anomaly(AnomalyId::new("cloud-7"));
        c.start_deployment(&sat, cloud.clone(), t0()).await.unwrap();
        c.collect(&sat, at(2_400_000)).await.unwrap();
        let request = DeployRequest {
            target: cloud,
            linked_automaton: None,
            quota_bonus: 1,
        };
        assert!(c.start_deployment(&sat, request, at(3_000_000)).await.is_ok());
        let status = c
            .quota_status(&owner(), AssetCategory::Satellite, at(3_000_001), 1)
            .await
            .unwrap();
        assert_eq!((status.used, status.allowed), (2, Some(2)));
    }

    #[tokio::test]
    async fn station_accrues_and_claims() {
        let (c, store) = rig();
        let station = AssetId::new("station-1");
        let coal = ResourceKind::new("11");
        let d = c.activate(&station, t0()).await.unwrap();
        assert_eq!(d.duration_ms, None);

        let p = c.get_progress(&station, at(10_500)).await.unwrap();
        assert_eq!(p.state, DeploymentState::Accruing);
        assert_eq!(p.accrued, Some(20));

        let claim = c.claim(&station, at(10_500), None).await.unwrap();
        assert_eq!((claim.amount, claim.restarted), (20, false));
        assert_eq!(store.holding(&owner(), &mars(), &coal), 20);
        assert_eq!(
            c.get_progress(&station, at(11_000)).await.unwrap().state,
            DeploymentState::Idle
        );
        assert_eq!(c.claim(&station, at(12_000), None).await.unwrap().amount, 0);

        c.activate(&station, at(20_000)).await.unwrap();
        let claim = c.claim(&station, at(25_000), Some(true)).await.unwrap();
        assert_eq!((claim.amount, claim.restarted), (10, true));
        let p = c.get_progress(&station, at(25_000)).await.unwrap();
        assert_eq!((p.state, p.elapsed_ms), (DeploymentState::Accruing, 0));
        assert_eq!(store.holding(&owner(), &mars(), &coal), 30);
        let held = c.holding(&owner(), &mars(), &coal).await.unwrap();
        assert_eq!(
            held,
            Holding {
                owner: owner(),
                site: mars(),
                resource: coal,
                quantity: 30
            }
        );
    }

    #[tokio::test]
    async fn zero_claim_writes_nothing() {
        let (c, store) = rig();
        let station = AssetId::new("station-1");
        c.activate(&station, t0()).await.unwrap();
        let claim = c.claim(&station, at(999), Some(false)).await.unwrap();
        assert_eq!(claim.amount, 0);
        assert_eq!(store.active_deployments(), 1);
        assert_eq!(store.holding(&owner(), &mars(), &ResourceKind::new("11")), 0);
    }

    #[tokio::test]
    async fn operations_respect_category() {
        let (c, _) = rig();
        let station = AssetId::new("station-1");
        assert_eq!(
            c.activate(&rover(), t0()).await,
            Err(EngineError::WrongCategory {
                category: AssetCategory::MiningAutomaton,
                operation: "activate"
            })
        );
        assert!(matches!(
            c.claim(&rover(), t0(), None).await,
            Err(EngineError::WrongCategory { .. })
        ));
        c.activate(&station, t0()).await.unwrap();
        assert!(matches!(
            c.collect(&station, at(60_000)).await,
            Err(EngineError::WrongCategory { .. })
        ));
        assert!(matches!(
            c.start_deployment(&rover(), Target::Passive, t0()).await,
            Err(EngineError::UnsupportedTarget { .. })
        ));
    }

    #[tokio::test]
    async fn progress_survives_a_fresh_controller() {
        let (c, store) = rig();
        c.start_deployment(&rover(), dep1(), t0()).await.unwrap();
        let before = c.get_progress(&rover(), at(7_000)).await.unwrap();
        drop(c);
        let reopened = DeploymentController::new(store, EngineConfig::default());
        assert_eq!(reopened.get_progress(&rover(), at(7_000)).await.unwrap(), before);
    }
}
