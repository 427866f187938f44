//! Ledger storage contract
//!
//! Everything the accrual core needs from durable storage, behind one
//! trait: position snapshots, the atomic accrual commit, idempotent
//! commission credits, the referral parent lookup, scheduler state, and
//! the track lease. Two implementations exist: MongoDB for production and
//! an in-process ledger for dev mode and tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::types::{Amount, Currency, OwnerId, Rate, Result, Track};

/// Read snapshot of a position, taken at the start of its accrual step.
/// The yield computation and the epoch key both derive from this snapshot,
/// never from re-read state.
#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub position_id: String,
    pub owner_id: OwnerId,
    pub currency: Currency,
    pub principal: Amount,
    pub daily_rate: Rate,
    pub last_accrual_at: DateTime<Utc>,
    pub version: i64,
}

/// One atomic accrual: transaction insert + balance increment + watermark
/// compare-and-advance. Either all three apply or none do.
#[derive(Debug, Clone)]
pub struct AccrualCommit {
    pub position_id: String,
    pub owner_id: OwnerId,
    pub currency: Currency,
    pub amount: Amount,
    pub watermark_before: DateTime<Utc>,
    pub watermark_after: DateTime<Utc>,
    /// Snapshot version the watermark CAS is conditioned on
    pub version: i64,
    pub epoch_key: String,
}

/// Deterministic idempotency key for an accrual window
pub fn accrual_epoch_key(position_id: &str, watermark_before: DateTime<Utc>) -> String {
    format!("{}:{}", position_id, watermark_before.timestamp_millis())
}

/// Deterministic idempotency key for one commission level of one accrual
pub fn commission_epoch_key(origin_tx_id: &str, level: u8) -> String {
    format!("{}:L{}", origin_tx_id, level)
}

/// One referral commission credit, idempotent per `(origin_tx, level)`
#[derive(Debug, Clone)]
pub struct CommissionCredit {
    /// The ancestor being credited
    pub owner_id: OwnerId,
    /// The user whose accrual triggered this credit
    pub source_owner_id: OwnerId,
    pub currency: Currency,
    pub amount: Amount,
    pub level: u8,
    /// Transaction id of the originating accrual
    pub origin_tx_id: String,
    pub epoch_key: String,
}

/// Outcome of an idempotent write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The write landed; `tx_id` identifies the new ledger entry
    Committed { tx_id: String },
    /// This epoch was already credited; nothing was written
    AlreadyProcessed,
    /// The position version moved under us; nothing was written
    Conflict,
}

/// Persisted cycle state for a track
#[derive(Debug, Clone)]
pub struct TrackCycleState {
    pub last_cycle_at: DateTime<Utc>,
    pub last_intended_at: DateTime<Utc>,
    pub cycles_run: i64,
}

/// An accrual transaction with no matching commissions yet, fed to the
/// reconciliation job for idempotent replay
#[derive(Debug, Clone)]
pub struct PendingDistribution {
    pub tx_id: String,
    pub owner_id: OwnerId,
    pub currency: Currency,
    pub amount: Amount,
}

/// Storage contract for the accrual core
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Active positions in `currency` whose watermark is at or before
    /// `cutoff`, ordered by position id, starting after `after` (keyset
    /// pagination), at most `limit` rows. Read-only.
    async fn eligible_positions(
        &self,
        currency: Currency,
        cutoff: DateTime<Utc>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PositionSnapshot>>;

    /// Atomically insert the accrual transaction (guarded by the unique
    /// epoch key), increment the owner's balance, and compare-and-advance
    /// the watermark. Duplicate epoch keys and version conflicts are
    /// reported as outcomes, not errors.
    async fn commit_accrual(&self, commit: AccrualCommit) -> Result<CommitOutcome>;

    /// Advance the watermark without writing a transaction (zero-yield
    /// cycles must not leave a position stuck). Returns false on a version
    /// conflict.
    async fn advance_watermark(
        &self,
        position_id: &str,
        version: i64,
        watermark_after: DateTime<Utc>,
    ) -> Result<bool>;

    /// Atomically insert one commission transaction and increment the
    /// ancestor's balance. Idempotent per `(origin_tx, level)`.
    async fn credit_commission(&self, credit: CommissionCredit) -> Result<CommitOutcome>;

    /// Referral parent lookup; None marks a tree root
    async fn parent_of(&self, owner: OwnerId) -> Result<Option<OwnerId>>;

    /// Current balance for `(owner, currency)`; zero when absent
    async fn balance(&self, owner: OwnerId, currency: Currency) -> Result<Amount>;

    /// Last recorded cycle for the track, if any
    async fn track_state(&self, track: Track) -> Result<Option<TrackCycleState>>;

    /// Record a completed cycle for missed-cycle recovery
    async fn record_cycle(
        &self,
        track: Track,
        intended_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Try to take the track lease for `ttl`. Returns false when another
    /// live holder has it.
    async fn acquire_lease(&self, track: Track, holder: &str, ttl: Duration) -> Result<bool>;

    /// Extend a held lease; returns false if the lease is no longer ours
    async fn renew_lease(&self, track: Track, holder: &str, ttl: Duration) -> Result<bool>;

    /// Release the lease if we still hold it
    async fn release_lease(&self, track: Track, holder: &str) -> Result<()>;

    /// Mark an accrual's commission distribution as complete. Written only
    /// after the walk reaches its end, so a crash mid-walk leaves the
    /// accrual unsettled and visible to [`accruals_missing_commissions`].
    ///
    /// [`accruals_missing_commissions`]: Ledger::accruals_missing_commissions
    async fn settle_distribution(&self, origin_tx_id: &str) -> Result<()>;

    /// Recent accrual transactions whose commission distribution never ran
    /// to completion, oldest first. A walk that crashed after crediting
    /// some levels is still selected; per-level epoch keys make the replay
    /// idempotent.
    async fn accruals_missing_commissions(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingDistribution>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_keys_are_deterministic() {
        let wm = DateTime::parse_from_rfc3339("2025-08-25T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let a = accrual_epoch_key("pos-1", wm);
        let b = accrual_epoch_key("pos-1", wm);
        assert_eq!(a, b);
        assert_eq!(a, format!("pos-1:{}", wm.timestamp_millis()));

        assert_eq!(commission_epoch_key("tx-9", 3), "tx-9:L3");
    }
}
