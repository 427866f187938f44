//! In-process ledger
//!
//! Same contract and semantics as the MongoDB ledger — epoch-key
//! uniqueness, watermark compare-and-swap, lease expiry — backed by
//! dashmaps. Used in dev mode (the service runs without MongoDB, as a dry
//! run against seeded data) and throughout the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::store::{
    AccrualCommit, CommissionCredit, CommitOutcome, Ledger, PendingDistribution, PositionSnapshot,
    TrackCycleState,
};
use crate::types::{Amount, Currency, GranaryError, OwnerId, Rate, Result, Track, TxKind};

/// Position state held by the in-memory ledger
#[derive(Debug, Clone)]
struct PositionRecord {
    owner_id: OwnerId,
    currency: Currency,
    principal: Amount,
    daily_rate: Rate,
    last_accrual_at: DateTime<Utc>,
    active: bool,
    version: i64,
}

/// One ledger entry, mirroring the transaction document
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub tx_id: String,
    pub owner_id: OwnerId,
    pub kind: TxKind,
    pub currency: Currency,
    pub amount: Amount,
    pub related_position_id: Option<String>,
    pub source_owner_id: Option<OwnerId>,
    pub level: Option<u8>,
    pub epoch_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct LeaseRecord {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// In-process ledger implementation
#[derive(Default)]
pub struct MemoryLedger {
    positions: DashMap<String, PositionRecord>,
    balances: DashMap<(OwnerId, Currency), i64>,
    /// epoch_key -> tx_id; the in-memory stand-in for the unique index
    epoch_keys: DashMap<String, String>,
    transactions: Mutex<Vec<LedgerEntry>>,
    parents: DashMap<OwnerId, OwnerId>,
    /// Accrual tx ids whose commission walk ran to completion
    settled: DashMap<String, ()>,
    track_states: DashMap<Track, TrackCycleState>,
    leases: DashMap<Track, LeaseRecord>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an active position (dev mode and tests)
    pub fn insert_position(
        &self,
        position_id: &str,
        owner_id: OwnerId,
        currency: Currency,
        principal: Amount,
        daily_rate: Rate,
        last_accrual_at: DateTime<Utc>,
    ) {
        self.positions.insert(
            position_id.to_string(),
            PositionRecord {
                owner_id,
                currency,
                principal,
                daily_rate,
                last_accrual_at,
                active: true,
                version: 0,
            },
        );
    }

    /// Deactivate a position (stand-in for the external withdrawal path)
    pub fn deactivate_position(&self, position_id: &str) {
        if let Some(mut rec) = self.positions.get_mut(position_id) {
            rec.active = false;
        }
    }

    /// Seed a referral edge
    pub fn link_referral(&self, child: OwnerId, parent: OwnerId) {
        self.parents.insert(child, parent);
    }

    /// Snapshot of all ledger entries, in insertion order
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.transactions.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Current snapshot of one position
    pub fn position(&self, position_id: &str) -> Option<PositionSnapshot> {
        self.positions.get(position_id).map(|rec| PositionSnapshot {
            position_id: position_id.to_string(),
            owner_id: rec.owner_id,
            currency: rec.currency,
            principal: rec.principal,
            daily_rate: rec.daily_rate,
            last_accrual_at: rec.last_accrual_at,
            version: rec.version,
        })
    }

    fn push_entry(&self, entry: LedgerEntry) {
        self.transactions.lock().unwrap_or_else(|e| e.into_inner()).push(entry);
    }

    fn credit_balance(&self, owner: OwnerId, currency: Currency, amount: Amount) -> Result<()> {
        let mut slot = self.balances.entry((owner, currency)).or_insert(0);
        let next = slot
            .checked_add(amount.nanos())
            .ok_or_else(|| GranaryError::Database("balance overflow".into()))?;
        if next < 0 {
            return Err(GranaryError::Database(format!(
                "balance for owner {} would go negative",
                owner
            )));
        }
        *slot = next;
        Ok(())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn eligible_positions(
        &self,
        currency: Currency,
        cutoff: DateTime<Utc>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PositionSnapshot>> {
        let mut rows: Vec<PositionSnapshot> = self
            .positions
            .iter()
            .filter(|kv| {
                let rec = kv.value();
                rec.active
                    && rec.currency == currency
                    && rec.last_accrual_at <= cutoff
                    && after.map_or(true, |a| kv.key().as_str() > a)
            })
            .map(|kv| PositionSnapshot {
                position_id: kv.key().clone(),
                owner_id: kv.value().owner_id,
                currency: kv.value().currency,
                principal: kv.value().principal,
                daily_rate: kv.value().daily_rate,
                last_accrual_at: kv.value().last_accrual_at,
                version: kv.value().version,
            })
            .collect();
        rows.sort_by(|a, b| a.position_id.cmp(&b.position_id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn commit_accrual(&self, commit: AccrualCommit) -> Result<CommitOutcome> {
        let mut rec = match self.positions.get_mut(&commit.position_id) {
            Some(rec) => rec,
            None => {
                return Err(GranaryError::Database(format!(
                    "unknown position {}",
                    commit.position_id
                )))
            }
        };

        if rec.version != commit.version {
            return Ok(CommitOutcome::Conflict);
        }

        // Unique-index stand-in: first writer wins, replays are no-ops
        let tx_id = Uuid::new_v4().to_string();
        match self.epoch_keys.entry(commit.epoch_key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Ok(CommitOutcome::AlreadyProcessed)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx_id.clone());
            }
        }

        self.credit_balance(commit.owner_id, commit.currency, commit.amount)?;
        self.push_entry(LedgerEntry {
            tx_id: tx_id.clone(),
            owner_id: commit.owner_id,
            kind: TxKind::FarmingReward,
            currency: commit.currency,
            amount: commit.amount,
            related_position_id: Some(commit.position_id.clone()),
            source_owner_id: None,
            level: None,
            epoch_key: commit.epoch_key,
            created_at: Utc::now(),
        });

        rec.last_accrual_at = commit.watermark_after;
        rec.version += 1;

        Ok(CommitOutcome::Committed { tx_id })
    }

    async fn advance_watermark(
        &self,
        position_id: &str,
        version: i64,
        watermark_after: DateTime<Utc>,
    ) -> Result<bool> {
        let mut rec = match self.positions.get_mut(position_id) {
            Some(rec) => rec,
            None => return Ok(false),
        };
        if rec.version != version {
            return Ok(false);
        }
        rec.last_accrual_at = watermark_after;
        rec.version += 1;
        Ok(true)
    }

    async fn credit_commission(&self, credit: CommissionCredit) -> Result<CommitOutcome> {
        let tx_id = Uuid::new_v4().to_string();
        match self.epoch_keys.entry(credit.epoch_key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Ok(CommitOutcome::AlreadyProcessed)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx_id.clone());
            }
        }

        self.credit_balance(credit.owner_id, credit.currency, credit.amount)?;
        self.push_entry(LedgerEntry {
            tx_id: tx_id.clone(),
            owner_id: credit.owner_id,
            kind: TxKind::ReferralCommission,
            currency: credit.currency,
            amount: credit.amount,
            related_position_id: None,
            source_owner_id: Some(credit.source_owner_id),
            level: Some(credit.level),
            epoch_key: credit.epoch_key,
            created_at: Utc::now(),
        });

        Ok(CommitOutcome::Committed { tx_id })
    }

    async fn parent_of(&self, owner: OwnerId) -> Result<Option<OwnerId>> {
        Ok(self.parents.get(&owner).map(|p| *p))
    }

    async fn balance(&self, owner: OwnerId, currency: Currency) -> Result<Amount> {
        Ok(self
            .balances
            .get(&(owner, currency))
            .map(|b| Amount::from_nanos(*b))
            .unwrap_or(Amount::ZERO))
    }

    async fn track_state(&self, track: Track) -> Result<Option<TrackCycleState>> {
        Ok(self.track_states.get(&track).map(|s| s.clone()))
    }

    async fn record_cycle(
        &self,
        track: Track,
        intended_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        self.track_states
            .entry(track)
            .and_modify(|s| {
                s.last_cycle_at = completed_at;
                s.last_intended_at = intended_at;
                s.cycles_run += 1;
            })
            .or_insert(TrackCycleState {
                last_cycle_at: completed_at,
                last_intended_at: intended_at,
                cycles_run: 1,
            });
        Ok(())
    }

    async fn acquire_lease(&self, track: Track, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        match self.leases.entry(track) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let lease = slot.get_mut();
                if lease.expires_at <= now || lease.holder == holder {
                    lease.holder = holder.to_string();
                    lease.expires_at = now + ttl;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(LeaseRecord {
                    holder: holder.to_string(),
                    expires_at: now + ttl,
                });
                Ok(true)
            }
        }
    }

    async fn renew_lease(&self, track: Track, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        match self.leases.get_mut(&track) {
            Some(mut lease) if lease.holder == holder && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, track: Track, holder: &str) -> Result<()> {
        self.leases
            .remove_if(&track, |_, lease| lease.holder == holder);
        Ok(())
    }

    async fn settle_distribution(&self, origin_tx_id: &str) -> Result<()> {
        self.settled.insert(origin_tx_id.to_string(), ());
        Ok(())
    }

    async fn accruals_missing_commissions(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingDistribution>> {
        let entries = self.transactions.lock().unwrap_or_else(|e| e.into_inner());
        let mut pending = Vec::new();

        for entry in entries.iter() {
            if entry.kind != TxKind::FarmingReward || entry.created_at < since {
                continue;
            }
            // Roots have nobody to pay; they are not pending
            if !self.parents.contains_key(&entry.owner_id) {
                continue;
            }
            // A partially credited walk is still unsettled
            if self.settled.contains_key(&entry.tx_id) {
                continue;
            }
            pending.push(PendingDistribution {
                tx_id: entry.tx_id.clone(),
                owner_id: entry.owner_id,
                currency: entry.currency,
                amount: entry.amount,
            });
            if pending.len() >= limit {
                break;
            }
        }

        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::store::accrual_epoch_key;

    fn snapshot(ledger: &MemoryLedger, id: &str) -> PositionSnapshot {
        ledger.position(id).unwrap()
    }

    fn commit_from(snap: &PositionSnapshot, amount: Amount, now: DateTime<Utc>) -> AccrualCommit {
        AccrualCommit {
            position_id: snap.position_id.clone(),
            owner_id: snap.owner_id,
            currency: snap.currency,
            amount,
            watermark_before: snap.last_accrual_at,
            watermark_after: now,
            version: snap.version,
            epoch_key: accrual_epoch_key(&snap.position_id, snap.last_accrual_at),
        }
    }

    #[tokio::test]
    async fn accrual_commit_is_idempotent_per_epoch() {
        let ledger = MemoryLedger::new();
        let start = Utc::now() - Duration::minutes(5);
        ledger.insert_position(
            "pos-1",
            1,
            Currency::Uni,
            Amount::from_units(1000),
            Rate::from_ppm(10_000),
            start,
        );

        let now = Utc::now();
        let snap = snapshot(&ledger, "pos-1");
        let amount = Amount::from_nanos(34_722_222);

        let first = ledger
            .commit_accrual(commit_from(&snap, amount, now))
            .await
            .unwrap();
        assert!(matches!(first, CommitOutcome::Committed { .. }));

        // Same snapshot replayed with the version reset: the epoch key wins
        let mut replay = commit_from(&snap, amount, now);
        replay.version = snapshot(&ledger, "pos-1").version;
        let second = ledger.commit_accrual(replay).await.unwrap();
        assert_eq!(second, CommitOutcome::AlreadyProcessed);

        assert_eq!(ledger.entries().len(), 1);
        assert_eq!(ledger.balance(1, Currency::Uni).await.unwrap(), amount);
    }

    #[tokio::test]
    async fn stale_version_conflicts_without_writing() {
        let ledger = MemoryLedger::new();
        let start = Utc::now() - Duration::minutes(5);
        ledger.insert_position(
            "pos-1",
            1,
            Currency::Uni,
            Amount::from_units(100),
            Rate::from_ppm(10_000),
            start,
        );

        let now = Utc::now();
        let snap = snapshot(&ledger, "pos-1");
        ledger
            .commit_accrual(commit_from(&snap, Amount::from_nanos(100), now))
            .await
            .unwrap();

        // Second runner still holds the pre-commit snapshot
        let mut stale = commit_from(&snap, Amount::from_nanos(100), now);
        stale.epoch_key = accrual_epoch_key("pos-1", now);
        let outcome = ledger.commit_accrual(stale).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Conflict);
        assert_eq!(ledger.entries().len(), 1);
    }

    #[tokio::test]
    async fn watermark_never_decreases() {
        let ledger = MemoryLedger::new();
        let start = Utc::now() - Duration::minutes(10);
        ledger.insert_position(
            "pos-1",
            1,
            Currency::Ton,
            Amount::from_units(50),
            Rate::from_ppm(20_000),
            start,
        );

        let mut last = start;
        for _ in 0..3 {
            let snap = snapshot(&ledger, "pos-1");
            assert!(snap.last_accrual_at >= last);
            last = snap.last_accrual_at;
            let now = Utc::now();
            ledger
                .commit_accrual(commit_from(&snap, Amount::from_nanos(10), now))
                .await
                .unwrap();
        }
        assert!(snapshot(&ledger, "pos-1").last_accrual_at >= last);
    }

    #[tokio::test]
    async fn lease_excludes_second_holder_until_expiry() {
        let ledger = MemoryLedger::new();
        let ttl = Duration::seconds(60);

        assert!(ledger.acquire_lease(Track::Uni, "a", ttl).await.unwrap());
        assert!(!ledger.acquire_lease(Track::Uni, "b", ttl).await.unwrap());
        // Re-entrant for the same holder
        assert!(ledger.acquire_lease(Track::Uni, "a", ttl).await.unwrap());
        // Independent per track
        assert!(ledger.acquire_lease(Track::TonBoost, "b", ttl).await.unwrap());

        ledger.release_lease(Track::Uni, "a").await.unwrap();
        assert!(ledger.acquire_lease(Track::Uni, "b", ttl).await.unwrap());

        // An expired lease is free for the taking
        assert!(ledger
            .acquire_lease(Track::TonBoost, "b", Duration::seconds(-1))
            .await
            .unwrap());
        assert!(ledger
            .acquire_lease(Track::TonBoost, "c", ttl)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn missing_commissions_feed_skips_roots_and_settled() {
        let ledger = MemoryLedger::new();
        let start = Utc::now() - Duration::minutes(5);
        ledger.insert_position(
            "pos-a",
            1,
            Currency::Uni,
            Amount::from_units(10),
            Rate::from_ppm(10_000),
            start,
        );
        ledger.insert_position(
            "pos-b",
            2,
            Currency::Uni,
            Amount::from_units(10),
            Rate::from_ppm(10_000),
            start,
        );
        ledger.link_referral(2, 3);

        let now = Utc::now();
        for id in ["pos-a", "pos-b"] {
            let snap = snapshot(&ledger, id);
            ledger
                .commit_accrual(commit_from(&snap, Amount::from_nanos(1_000), now))
                .await
                .unwrap();
        }

        let since = now - Duration::minutes(1);
        let pending = ledger.accruals_missing_commissions(since, 10).await.unwrap();
        // Owner 1 is a root; only owner 2's accrual is pending
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].owner_id, 2);

        // A partial credit alone does not settle the accrual
        let credit = CommissionCredit {
            owner_id: 3,
            source_owner_id: 2,
            currency: Currency::Uni,
            amount: Amount::from_nanos(10),
            level: 1,
            origin_tx_id: pending[0].tx_id.clone(),
            epoch_key: format!("{}:L1", pending[0].tx_id),
        };
        ledger.credit_commission(credit).await.unwrap();
        let still_pending = ledger.accruals_missing_commissions(since, 10).await.unwrap();
        assert_eq!(still_pending.len(), 1);
        assert_eq!(still_pending[0].tx_id, pending[0].tx_id);

        // Only the completion marker drains the feed
        ledger.settle_distribution(&pending[0].tx_id).await.unwrap();
        let pending = ledger.accruals_missing_commissions(since, 10).await.unwrap();
        assert!(pending.is_empty());
    }
}
