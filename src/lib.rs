//! Granary - accrual scheduler and referral commission engine
//!
//! Granary periodically credits yield to open farming positions and fans a
//! commission out along each owner's referral chain, up to twenty levels
//! deep. Correctness rests on three mechanisms rather than on scheduling
//! discipline:
//!
//! - **Elapsed-time accrual**: yield is computed from the time since the
//!   position's watermark, so missed ticks cost nothing and one catch-up
//!   cycle covers any downtime.
//! - **Epoch keys**: every credit carries a deterministic idempotency key
//!   enforced by a unique index, making replays and concurrent runners
//!   harmless.
//! - **Watermark compare-and-swap**: a versioned position document means
//!   two runners can race but only one can advance the window.
//!
//! ## Components
//!
//! - **Scheduler**: per-track tick loop on a fixed grid, guarded by a
//!   per-track lease
//! - **Coordinator**: one cycle's paginated, bounded-concurrency fan-out
//!   over eligible positions
//! - **Accrual**: the pure fixed-point yield computation
//! - **Referral**: the commission rate table and ancestor-walk distributor
//! - **Reconcile**: replays distributions lost to a crash mid-walk
//! - **Ledger**: the storage contract, backed by MongoDB in production and
//!   an in-process ledger in dev mode

pub mod accrual;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod ledger;
pub mod logging;
pub mod reconcile;
pub mod referral;
pub mod scheduler;
pub mod types;

pub use config::Args;
pub use types::{GranaryError, Result};
