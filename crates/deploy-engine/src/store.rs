//! Port to the persistent record store.
//!
//! The store is the sole arbiter of the single-active-deployment invariant
//! and of deposit quantities: `write_deployment` must fail when a record
//! already exists and `decrement_deposit` must fail when fewer units remain
//! than requested. Adapters implement these, and `settle`, as conditional
//! writes on their side, never as a read followed by an unguarded write.

use chrono::{DateTime, Utc};
use deploy_core::{
    Asset, AssetCategory, AssetId, Deposit, DepositId, DeploymentLogEntry, DeploymentRecord,
    Holding, OwnerId, ResourceKind, SiteId,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;

/// Failures reported by a store adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A conditional write found existing state (e.g. an active record).
    #[error("conflict: {0}")]
    Conflict(String),
    /// Conditional decrement refused.
    #[error("deposit {deposit} has {remaining} remaining, {requested} requested")]
    InsufficientRemaining {
        deposit: DepositId,
        remaining: u64,
        requested: u64,
    },
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    /// Stored data that cannot be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
    /// Transient I/O failure; the write may or may not have been applied.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Create-or-increment of a holding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingCredit {
    pub owner: OwnerId,
    pub site: SiteId,
    pub resource: ResourceKind,
    pub amount: u64,
}

/// What happens to the deployment record once a settlement is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordAction {
    Clear,
    /// Keep the record and move its start stamp (stations that keep running).
    Restart(DateTime<Utc>),
}

/// The writes that end a mission or claim, applied as one unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub asset: AssetId,
    /// The record's start when the yield was computed; a different or missing
    /// start means another caller already settled it.
    pub expected_start: DateTime<Utc>,
    pub debit: Option<(DepositId, u64)>,
    pub credit: Option<HoldingCredit>,
    pub after: RecordAction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettleOutcome {
    Applied,
    AlreadySettled,
}

/// Operations the engine consumes from the record store.
pub trait DeploymentStore: Send + Sync {
    fn read_asset(&self, id: &AssetId) -> impl Future<Output = StoreResult<Asset>> + Send;

    fn read_active_deployment(
        &self,
        asset: &AssetId,
    ) -> impl Future<Output = StoreResult<Option<DeploymentRecord>>> + Send;

    /// Insert the record and append it to the deployment log. Fails with
    /// `Conflict` when the asset already has an active record.
    fn write_deployment(
        &self,
        record: &DeploymentRecord,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Remove the active record, if any. Idempotent.
    fn clear_deployment(&self, asset: &AssetId) -> impl Future<Output = StoreResult<()>> + Send;

    /// Move the start stamp from `expected` to `new_start`. Returns `false`
    /// when the record is missing or its start no longer equals `expected`.
    fn restart_deployment(
        &self,
        asset: &AssetId,
        expected: DateTime<Utc>,
        new_start: DateTime<Utc>,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    fn read_deposit(&self, id: &DepositId) -> impl Future<Output = StoreResult<Deposit>> + Send;

    /// Subtract `amount`, failing with `InsufficientRemaining` when
    /// `remaining < amount`. Returns the new remaining quantity.
    fn decrement_deposit(
        &self,
        id: &DepositId,
        amount: u64,
    ) -> impl Future<Output = StoreResult<u64>> + Send;

    /// Create-or-increment; returns the new quantity.
    fn credit_holding(
        &self,
        credit: &HoldingCredit,
    ) -> impl Future<Output = StoreResult<u64>> + Send;

    /// Current holding; quantity zero when nothing has been credited yet.
    fn read_holding(
        &self,
        owner: &OwnerId,
        site: &SiteId,
        resource: &ResourceKind,
    ) -> impl Future<Output = StoreResult<Holding>> + Send;

    /// Log entries for `(owner, category)` started at or after `since`.
    fn query_deployments_in_window(
        &self,
        owner: &OwnerId,
        category: AssetCategory,
        since: DateTime<Utc>,
    ) -> impl Future<Output = StoreResult<Vec<DeploymentLogEntry>>> + Send;

    /// Most recent log entry for an asset.
    fn latest_log_entry(
        &self,
        asset: &AssetId,
    ) -> impl Future<Output = StoreResult<Option<DeploymentLogEntry>>> + Send;

    /// Apply a settlement as one atomic unit: check that the active record
    /// still starts at `expected_start`, then debit, credit and clear or
    /// restart the record. Any failure applies nothing. Two concurrent calls
    /// with the same `expected_start` apply at most once; the loser sees
    /// `AlreadySettled`.
    fn settle(
        &self,
        settlement: &Settlement,
    ) -> impl Future<Output = StoreResult<SettleOutcome>> + Send;
}
