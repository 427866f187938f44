//! Per-track scheduling: the distributed lease and the tick loop

pub mod epoch;
pub mod lease;

pub use epoch::{needs_catchup, next_intended, EpochScheduler};
pub use lease::{acquire_jitter, TrackLease};
