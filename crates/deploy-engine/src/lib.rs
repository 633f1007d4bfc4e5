#![deny(warnings)]

//! Deployment engine: the controller state machine, the weekly quota gate
//! and the store port it drives.
//!
//! Callers pass `now` into every operation. The engine never sleeps or runs
//! timers; progress is re-derived from the stored record on each query.

pub mod controller;
pub mod error;
pub mod memory;
pub mod quota;
pub mod store;

pub use controller::{Claim, Collection, DeployRequest, Deployed, DeploymentController};
pub use error::{EngineError, EngineResult};
pub use memory::{InMemoryStore, StoreOp};
pub use quota::{QuotaGate, QuotaStatus};
pub use store::{
    DeploymentStore, HoldingCredit, RecordAction, SettleOutcome, Settlement, StoreError,
    StoreResult,
};
