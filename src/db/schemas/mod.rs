//! Database schemas for Granary
//!
//! Defines MongoDB document structures for positions, balances, the
//! transaction ledger, referral edges, and scheduler state.

mod balance;
mod metadata;
mod position;
mod referral;
mod track;
mod transaction;

pub use balance::{BalanceDoc, BALANCE_COLLECTION};
pub use metadata::Metadata;
pub use position::{FarmingPositionDoc, POSITION_COLLECTION};
pub use referral::{ReferralEdgeDoc, REFERRAL_COLLECTION};
pub use track::{TrackLeaseDoc, TrackStateDoc, TRACK_LEASE_COLLECTION, TRACK_STATE_COLLECTION};
pub use transaction::{TransactionDoc, TRANSACTION_COLLECTION};
