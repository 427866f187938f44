//! Ledger storage: the one shared mutable resource
//!
//! All balance mutation goes through the atomic read-modify-write
//! operations defined by the [`Ledger`] trait; nothing in the engine
//! caches balances across cycles.

pub mod memory;
pub mod mongo;
pub mod store;

pub use memory::MemoryLedger;
pub use mongo::MongoLedger;
pub use store::{
    accrual_epoch_key, commission_epoch_key, AccrualCommit, CommissionCredit, CommitOutcome,
    Ledger, PendingDistribution, PositionSnapshot, TrackCycleState,
};
