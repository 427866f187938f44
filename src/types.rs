//! Core types shared across the accrual engine
//!
//! Errors, fixed-point money, and the closed sets of currencies, tracks,
//! and transaction kinds.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Owner identifier (user id in the upstream registration system)
pub type OwnerId = i64;

/// Errors produced by the accrual engine.
///
/// Expected storage outcomes (duplicate epoch key, lost watermark race)
/// are not errors; they surface as [`crate::ledger::CommitOutcome`].
/// Clock skew and a held lease are handled as log-and-skip at the point
/// of detection.
#[derive(Error, Debug)]
pub enum GranaryError {
    /// Storage-level failure (connection loss, timeout, write error).
    /// Transient by assumption: the affected position is retried next tick.
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, GranaryError>;

/// Currency of a balance, position, or transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Currency {
    Uni,
    Ton,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Uni => "uni",
            Currency::Ton => "ton",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accrual track. Each track runs on its own cadence with its own lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    Uni,
    TonBoost,
}

impl Track {
    pub fn as_str(&self) -> &'static str {
        match self {
            Track::Uni => "uni",
            Track::TonBoost => "ton_boost",
        }
    }

    /// Currency credited by this track
    pub fn currency(&self) -> Currency {
        match self {
            Track::Uni => Currency::Uni,
            Track::TonBoost => Currency::Ton,
        }
    }

    pub const ALL: [Track; 2] = [Track::Uni, Track::TonBoost];
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of ledger transaction kinds.
///
/// The upstream system grew free-form type strings over time; keeping this
/// a closed enum forces exhaustive handling in every downstream match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    FarmingReward,
    ReferralCommission,
    Deposit,
    Withdrawal,
    Adjustment,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::FarmingReward => "farming_reward",
            TxKind::ReferralCommission => "referral_commission",
            TxKind::Deposit => "deposit",
            TxKind::Withdrawal => "withdrawal",
            TxKind::Adjustment => "adjustment",
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of nano-units in one whole token
pub const NANOS_PER_UNIT: i64 = 1_000_000_000;

/// Fixed-point monetary amount in nano-units (1e-9 of a token).
///
/// All arithmetic widens to 128 bits and truncates toward zero, so the sum
/// of credited amounts never exceeds the continuous-yield curve.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_nanos(nanos: i64) -> Self {
        Amount(nanos)
    }

    /// Whole tokens, exact (no fractional part)
    pub const fn from_units(units: i64) -> Self {
        Amount(units * NANOS_PER_UNIT)
    }

    pub const fn nanos(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Truncating multiply by a rational `num / den`
    pub fn mul_ratio(self, num: u64, den: u64) -> Amount {
        debug_assert!(den > 0);
        let scaled = (self.0 as i128) * (num as i128) / (den as i128);
        Amount(scaled as i64)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / NANOS_PER_UNIT as u64;
        let frac = abs % NANOS_PER_UNIT as u64;
        if frac == 0 {
            write!(f, "{}{}", sign, whole)
        } else {
            let frac_str = format!("{:09}", frac);
            write!(f, "{}{}.{}", sign, whole, frac_str.trim_end_matches('0'))
        }
    }
}

/// Daily yield rate in parts-per-million of the principal.
///
/// A 1%/day package is `Rate::from_ppm(10_000)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Rate(u32);

impl Rate {
    pub const fn from_ppm(ppm: u32) -> Self {
        Rate(ppm)
    }

    /// Rate expressed as basis points per day (1 bp = 0.01%)
    pub const fn from_bps(bps: u32) -> Self {
        Rate(bps * 100)
    }

    pub const fn ppm(&self) -> u32 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ppm/day", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_display_trims_trailing_zeros() {
        assert_eq!(Amount::from_units(5).to_string(), "5");
        assert_eq!(Amount::from_nanos(34_722_222).to_string(), "0.034722222");
        assert_eq!(Amount::from_nanos(1_500_000_000).to_string(), "1.5");
        assert_eq!(Amount::from_nanos(-250_000_000).to_string(), "-0.25");
    }

    #[test]
    fn mul_ratio_truncates_toward_zero() {
        let a = Amount::from_nanos(1_000);
        assert_eq!(a.mul_ratio(1, 3).nanos(), 333);
        assert_eq!(a.mul_ratio(2, 3).nanos(), 666);
    }

    #[test]
    fn track_currency_mapping() {
        assert_eq!(Track::Uni.currency(), Currency::Uni);
        assert_eq!(Track::TonBoost.currency(), Currency::Ton);
    }

    #[test]
    fn tx_kind_serializes_snake_case() {
        let json = serde_json::to_string(&TxKind::ReferralCommission).unwrap();
        assert_eq!(json, "\"referral_commission\"");
    }
}
