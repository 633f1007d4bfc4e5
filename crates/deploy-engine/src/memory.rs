//! In-memory store adapter.
//!
//! Every operation runs under a single lock, which makes the conditional
//! writes and `settle` atomic. Used by tests, the CLI and as the reference
//! behavior for other adapters. Failures can be injected per operation to
//! exercise the engine's retry policy.

use crate::store::{
    DeploymentStore, HoldingCredit, RecordAction, SettleOutcome, Settlement, StoreError,
    StoreResult,
};
use chrono::{DateTime, Utc};
use deploy_core::{
    validate_deposit, Asset, AssetCategory, AssetId, Deposit, DepositId, DeploymentLogEntry,
    DeploymentRecord, Holding, OwnerId, ResourceKind, SiteId, ValidationError,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Store operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    ReadAsset,
    ReadDeployment,
    WriteDeployment,
    ClearDeployment,
    ReadDeposit,
    DecrementDeposit,
    CreditHolding,
    QueryWindow,
    Settle,
}

type HoldingKey = (OwnerId, SiteId, ResourceKind);

#[derive(Default)]
struct State {
    assets: HashMap<AssetId, Asset>,
    active: HashMap<AssetId, DeploymentRecord>,
    deposits: HashMap<DepositId, Deposit>,
    holdings: HashMap<HoldingKey, u64>,
    log: Vec<DeploymentLogEntry>,
    // one-shot failures: before applying, and after applying (lost ack)
    fail_before: HashSet<StoreOp>,
    fail_after: HashSet<StoreOp>,
}

impl State {
    fn before(&mut self, op: StoreOp) -> StoreResult<()> {
        if self.fail_before.remove(&op) {
            return Err(StoreError::Unavailable(format!("injected failure on {op:?}")));
        }
        Ok(())
    }

    fn after(&mut self, op: StoreOp) -> StoreResult<()> {
        if self.fail_after.remove(&op) {
            return Err(StoreError::Unavailable(format!("lost acknowledgement on {op:?}")));
        }
        Ok(())
    }

    fn debit(&mut self, id: &DepositId, amount: u64) -> StoreResult<u64> {
        let deposit = self
            .deposits
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("deposit", id))?;
        if deposit.remaining < amount {
            return Err(StoreError::InsufficientRemaining {
                deposit: id.clone(),
                remaining: deposit.remaining,
                requested: amount,
            });
        }
        deposit.remaining -= amount;
        Ok(deposit.remaining)
    }

    fn credit(&mut self, credit: &HoldingCredit) -> u64 {
        let key = (
            credit.owner.clone(),
            credit.site.clone(),
            credit.resource.clone(),
        );
        let qty = self.holdings.entry(key).or_insert(0);
        *qty = qty.saturating_add(credit.amount);
        *qty
    }
}

/// Store backed by process memory.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_asset(&self, asset: Asset) {
        self.state.lock().assets.insert(asset.id.clone(), asset);
    }

    pub fn insert_deposit(&self, deposit: Deposit) -> Result<(), ValidationError> {
        validate_deposit(&deposit)?;
        self.state.lock().deposits.insert(deposit.id.clone(), deposit);
        Ok(())
    }

    /// Quantity held, zero when the holding does not exist yet.
    pub fn holding(&self, owner: &OwnerId, site: &SiteId, resource: &ResourceKind) -> u64 {
        let key = (owner.clone(), site.clone(), resource.clone());
        self.state.lock().holdings.get(&key).copied().unwrap_or(0)
    }

    pub fn deposit_remaining(&self, id: &DepositId) -> Option<u64> {
        self.state.lock().deposits.get(id).map(|d| d.remaining)
    }

    pub fn active_deployments(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn log_len(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Make the next call of `op` fail without applying anything.
    pub fn fail_next(&self, op: StoreOp) {
        self.state.lock().fail_before.insert(op);
    }

    /// Make the next call of `op` apply its write and then report failure.
    pub fn lose_next_ack(&self, op: StoreOp) {
        self.state.lock().fail_after.insert(op);
    }
}

impl DeploymentStore for InMemoryStore {
    async fn read_asset(&self, id: &AssetId) -> StoreResult<Asset> {
        let mut st = self.state.lock();
        st.before(StoreOp::ReadAsset)?;
        st.assets
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("asset", id))
    }

    async fn read_active_deployment(&self, asset: &AssetId) -> StoreResult<Option<DeploymentRecord>> {
        let mut st = self.state.lock();
        st.before(StoreOp::ReadDeployment)?;
        Ok(st.active.get(asset).cloned())
    }

    async fn write_deployment(&self, record: &DeploymentRecord) -> StoreResult<()> {
        let mut st = self.state.lock();
        st.before(StoreOp::WriteDeployment)?;
        if st.active.contains_key(&record.asset) {
            return Err(StoreError::Conflict(format!(
                "asset {} already has an active deployment",
                record.asset
            )));
        }
        st.active.insert(record.asset.clone(), record.clone());
        st.log.push(DeploymentLogEntry::from(record));
        st.after(StoreOp::WriteDeployment)
    }

    async fn clear_deployment(&self, asset: &AssetId) -> StoreResult<()> {
        let mut st = self.state.lock();
        st.before(StoreOp::ClearDeployment)?;
        st.active.remove(asset);
        st.after(StoreOp::ClearDeployment)
    }

    async fn restart_deployment(
        &self,
        asset: &AssetId,
        expected: DateTime<Utc>,
        new_start: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut st = self.state.lock();
        match st.active.get_mut(asset) {
            Some(record) if record.start == expected => {
                record.start = new_start;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn read_deposit(&self, id: &DepositId) -> StoreResult<Deposit> {
        let mut st = self.state.lock();
        st.before(StoreOp::ReadDeposit)?;
        st.deposits
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("deposit", id))
    }

    async fn decrement_deposit(&self, id: &DepositId, amount: u64) -> StoreResult<u64> {
        let mut st = self.state.lock();
        st.before(StoreOp::DecrementDeposit)?;
        let remaining = st.debit(id, amount)?;
        st.after(StoreOp::DecrementDeposit)?;
        Ok(remaining)
    }

    async fn credit_holding(&self, credit: &HoldingCredit) -> StoreResult<u64> {
        let mut st = self.state.lock();
        st.before(StoreOp::CreditHolding)?;
        let qty = st.credit(credit);
        st.after(StoreOp::CreditHolding)?;
        Ok(qty)
    }

    async fn read_holding(
        &self,
        owner: &OwnerId,
        site: &SiteId,
        resource: &ResourceKind,
    ) -> StoreResult<Holding> {
        Ok(Holding {
            owner: owner.clone(),
            site: site.clone(),
            resource: resource.clone(),
            quantity: self.holding(owner, site, resource),
        })
    }

    async fn query_deployments_in_window(
        &self,
        owner: &OwnerId,
        category: AssetCategory,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<DeploymentLogEntry>> {
        let mut st = self.state.lock();
        st.before(StoreOp::QueryWindow)?;
        Ok(st
            .log
            .iter()
            .filter(|e| &e.owner == owner && e.category == category && e.started_at >= since)
            .cloned()
            .collect())
    }

    async fn latest_log_entry(&self, asset: &AssetId) -> StoreResult<Option<DeploymentLogEntry>> {
        let st = self.state.lock();
        Ok(st
            .log
            .iter()
            .filter(|e| &e.asset == asset)
            .max_by_key(|e| e.started_at)
            .cloned())
    }

    async fn settle(&self, settlement: &Settlement) -> StoreResult<SettleOutcome> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.before(StoreOp::Settle)?;
        match st.active.get(&settlement.asset) {
            Some(record) if record.start == settlement.expected_start => {}
            _ => return Ok(SettleOutcome::AlreadySettled),
        }
        if let Some((id, amount)) = &settlement.debit {
            st.debit(id, *amount)?;
        }
        if let Some(credit) = &settlement.credit {
            st.credit(credit);
        }
        match settlement.after {
            RecordAction::Clear => {
                st.active.remove(&settlement.asset);
            }
            RecordAction::Restart(at) => {
                if let Some(record) = st.active.get_mut(&settlement.asset) {
                    record.start = at;
                }
            }
        }
        st.after(StoreOp::Settle)?;
        Ok(SettleOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use deploy_core::{AssetConfig, Target};
    use proptest::prelude::*;

    fn record(asset: &str, start: DateTime<Utc>) -> DeploymentRecord {
        DeploymentRecord {
            asset: AssetId::new(asset),
            owner: OwnerId::new("u-1"),
            category: AssetCategory::MiningAutomaton,
            start,
            target: Target::Deposit(DepositId::new("dep-1")),
            duration_ms: Some(15_000),
            linked_automaton: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 8, 0, 0).unwrap()
    }

    fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.insert_asset(Asset {
            id: AssetId::new("rover-1"),
            owner: OwnerId::new("u-1"),
            site: SiteId::new("mars"),
            category: AssetCategory::MiningAutomaton,
            config: AssetConfig::default(),
        });
        store.insert_deposit(Deposit {
            id: DepositId::new("dep-1"),
            site: SiteId::new("mars"),
            resource: ResourceKind::new("15"),
            remaining: 3,
            purity: None,
        })
        .unwrap();
        store
    }

    #[test]
    fn seeding_rejects_bad_purity() {
        let store = InMemoryStore::new();
        let err = store
            .insert_deposit(Deposit {
                id: DepositId::new("dep-x"),
                site: SiteId::new("mars"),
                resource: ResourceKind::new("15"),
                remaining: 3,
                purity: Some(1.5),
            })
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidPurity);
        assert_eq!(store.deposit_remaining(&DepositId::new("dep-x")), None);
    }

    #[tokio::test]
    async fn second_write_conflicts() {
        let store = seeded();
        store.write_deployment(&record("rover-1", t0())).await.unwrap();
        let err = store.write_deployment(&record("rover-1", t0())).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.active_deployments(), 1);
        assert_eq!(store.log_len(), 1);
    }

    #[tokio::test]
    async fn decrement_is_conditional() {
        let store = seeded();
        let id = DepositId::new("dep-1");
        assert_eq!(store.decrement_deposit(&id, 2).await.unwrap(), 1);
        let err = store.decrement_deposit(&id, 2).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::InsufficientRemaining {
                deposit: id.clone(),
                remaining: 1,
                requested: 2
            }
        );
        assert_eq!(store.deposit_remaining(&id), Some(1));
    }

    #[tokio::test]
    async fn credit_creates_then_increments() {
        let store = seeded();
        let credit = HoldingCredit {
            owner: OwnerId::new("u-1"),
            site: SiteId::new("mars"),
            resource: ResourceKind::new("15"),
            amount: 2,
        };
        assert_eq!(store.credit_holding(&credit).await.unwrap(), 2);
        assert_eq!(store.credit_holding(&credit).await.unwrap(), 4);
        let held = store
            .read_holding(&credit.owner, &credit.site, &credit.resource)
            .await
            .unwrap();
        assert_eq!(held.quantity, 4);
        let none = store
            .read_holding(&credit.owner, &credit.site, &ResourceKind::new("water"))
            .await
            .unwrap();
        assert_eq!(none.quantity, 0);
    }

    #[tokio::test]
    async fn settle_checks_expected_start() {
        let store = seeded();
        store.write_deployment(&record("rover-1", t0())).await.unwrap();
        let mut s = Settlement {
            asset: AssetId::new("rover-1"),
            expected_start: t0() + chrono::Duration::seconds(1),
            debit: Some((DepositId::new("dep-1"), 1)),
            credit: None,
            after: RecordAction::Clear,
        };
        assert_eq!(store.settle(&s).await.unwrap(), SettleOutcome::AlreadySettled);
        assert_eq!(store.deposit_remaining(&DepositId::new("dep-1")), Some(3));
        s.expected_start = t0();
        assert_eq!(store.settle(&s).await.unwrap(), SettleOutcome::Applied);
        assert_eq!(store.deposit_remaining(&DepositId::new("dep-1")), Some(2));
        assert_eq!(store.active_deployments(), 0);
    }

    #[tokio::test]
    async fn failed_settle_applies_nothing() {
        let store = seeded();
        store.write_deployment(&record("rover-1", t0())).await.unwrap();
        let s = Settlement {
            asset: AssetId::new("rover-1"),
            expected_start: t0(),
            debit: Some((DepositId::new("dep-1"), 5)),
            credit: Some(HoldingCredit {
                owner: OwnerId::new("u-1"),
                site: SiteId::new("mars"),
                resource: ResourceKind::new("15"),
                amount: 5,
            }),
            after: RecordAction::Clear,
        };
        assert!(matches!(
            store.settle(&s).await,
            Err(StoreError::InsufficientRemaining { .. })
        ));
        assert_eq!(store.active_deployments(), 1);
        assert_eq!(
            store.holding(&OwnerId::new("u-1"), &SiteId::new("mars"), &ResourceKind::new("15")),
            0
        );
    }

    #[tokio::test]
    async fn window_query_filters_owner_category_and_time() {
        let store = seeded();
        store.write_deployment(&record("rover-1", t0())).await.unwrap();
        store.clear_deployment(&AssetId::new("rover-1")).await.unwrap();
        store
            .write_deployment(&record("rover-1", t0() + chrono::Duration::days(2)))
            .await
            .unwrap();
        let owner = OwnerId::new("u-1");
        let all = store
            .query_deployments_in_window(&owner, AssetCategory::MiningAutomaton, t0())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        let recent = store
            .query_deployments_in_window(
                &owner,
                AssetCategory::MiningAutomaton,
                t0() + chrono::Duration::days(1),
            )
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        let sats = store
            .query_deployments_in_window(&owner, AssetCategory::Satellite, t0())
            .await
            .unwrap();
        assert!(sats.is_empty());
        let latest = store
            .latest_log_entry(&AssetId::new("rover-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.started_at, t0() + chrono::Duration::days(2));
    }

    proptest! {
        #[test]
        fn debits_never_overdraw(start in 0u64..50, asks in proptest::collection::vec(0u64..10, 0..20)) {
            let mut st = State::default();
            let id = DepositId::new("dep-1");
            st.deposits.insert(id.clone(), Deposit {
                id: id.clone(),
                site: SiteId::new("mars"),
                resource: ResourceKind::new("15"),
                remaining: start,
                purity: None,
            });
            let mut taken = 0;
            for ask in asks {
                match st.debit(&id, ask) {
                    Ok(_) => taken += ask,
                    Err(StoreError::InsufficientRemaining { remaining, .. }) => prop_assert!(remaining < ask),
                    Err(e) => prop_assert!(false, "unexpected {e}"),
                }
            }
            prop_assert_eq!(st.deposits[&id].remaining + taken, start);
        }
    }
}
