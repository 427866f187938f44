//! Referral commissions: the rate table and the ancestor-walk distributor

pub mod distributor;
pub mod rates;

pub use distributor::{CommissionDistributor, DistributionReport};
pub use rates::{commission_amount, CommissionTable, RatesHandle, MAX_LEVELS};
