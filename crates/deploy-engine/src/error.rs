use crate::store::StoreError;
use deploy_core::{
    AssetCategory, AssetId, DepositId, MissionError, ResourceKind, ValidationError,
};
use thiserror::Error;

/// Caller-facing failures of the deployment engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("asset {asset} already has an active deployment")]
    AlreadyDeployed { asset: AssetId },

    #[error("power tier {actual} is below the {required} required for {resource}")]
    PowerInsufficient {
        resource: ResourceKind,
        required: u8,
        actual: u8,
    },

    #[error("weekly {category} limit reached, resets in {resets_in_ms} ms")]
    QuotaExceeded {
        category: AssetCategory,
        resets_in_ms: u64,
    },

    #[error("asset not found: {0}")]
    AssetNotFound(AssetId),

    #[error("deposit not found: {0}")]
    DepositNotFound(DepositId),

    /// Bounded mission still running.
    #[error("asset {asset} is not ready, {remaining_ms} ms remaining")]
    NotReady { asset: AssetId, remaining_ms: u64 },

    /// Operation does not apply to the asset's category.
    #[error("{operation} is not available for {category} assets")]
    WrongCategory {
        category: AssetCategory,
        operation: &'static str,
    },

    #[error("{category} cannot be deployed against a {target} target")]
    UnsupportedTarget {
        category: AssetCategory,
        target: &'static str,
    },

    /// Collection kept losing the race on a shared deposit.
    #[error("deposit {deposit} is contended, try again")]
    Contended { deposit: DepositId },

    /// Transient failure before anything was written; safe to retry.
    #[error("store unavailable during {op}: {reason}")]
    StoreUnavailable { op: &'static str, reason: String },

    /// Transient failure on a write that may have been applied.
    #[error("outcome of {op} unknown: {reason}")]
    WriteOutcomeUnknown { op: &'static str, reason: String },

    /// Stored data that cannot be interpreted.
    #[error("store returned corrupt data: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl EngineError {
    /// Only read-side unavailability may be retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StoreUnavailable { .. })
    }

    /// Expected user-facing outcomes that are not faults.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            EngineError::AlreadyDeployed { .. }
                | EngineError::PowerInsufficient { .. }
                | EngineError::QuotaExceeded { .. }
                | EngineError::NotReady { .. }
        )
    }

    /// Map a store failure on a read.
    pub(crate) fn from_read(op: &'static str, err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity: "asset", id } => EngineError::AssetNotFound(AssetId(id)),
            StoreError::NotFound {
                entity: "deposit",
                id,
            } => EngineError::DepositNotFound(DepositId(id)),
            StoreError::Unavailable(reason) => EngineError::StoreUnavailable { op, reason },
            other => EngineError::Corrupt(other.to_string()),
        }
    }

    /// Map a store failure on a write whose application is uncertain.
    pub(crate) fn from_write(op: &'static str, err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => EngineError::WriteOutcomeUnknown { op, reason },
            other => EngineError::from_read(op, other),
        }
    }
}

impl From<MissionError> for EngineError {
    fn from(err: MissionError) -> Self {
        match err {
            MissionError::PowerInsufficient {
                resource,
                required,
                actual,
            } => EngineError::PowerInsufficient {
                resource,
                required,
                actual,
            },
            MissionError::UnsupportedTarget { category, target } => {
                EngineError::UnsupportedTarget { category, target }
            }
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
