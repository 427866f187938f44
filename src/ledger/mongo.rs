//! MongoDB-backed ledger
//!
//! The accrual commit is one multi-document transaction: transaction
//! insert (guarded by the unique epoch-key index), balance `$inc`, and the
//! watermark compare-and-swap on `(position_id, version)`. Requires a
//! replica set or sharded deployment, as MongoDB transactions do.
//!
//! Duplicate-key rejections (E11000) are outcomes, not errors: they mean
//! another runner already credited this epoch.

use async_trait::async_trait;
use bson::doc;
use chrono::{DateTime, Duration, Utc};
use mongodb::ClientSession;
use tracing::debug;
use uuid::Uuid;

use super::store::{
    AccrualCommit, CommissionCredit, CommitOutcome, Ledger, PendingDistribution, PositionSnapshot,
    TrackCycleState,
};
use crate::db::schemas::{
    BalanceDoc, FarmingPositionDoc, Metadata, ReferralEdgeDoc, TrackLeaseDoc, TrackStateDoc,
    TransactionDoc, BALANCE_COLLECTION, POSITION_COLLECTION, REFERRAL_COLLECTION,
    TRACK_LEASE_COLLECTION, TRACK_STATE_COLLECTION, TRANSACTION_COLLECTION,
};
use crate::db::{is_duplicate_key, MongoClient, MongoCollection};
use crate::types::{Amount, Currency, GranaryError, OwnerId, Result, Track, TxKind};

/// Production ledger backed by MongoDB
pub struct MongoLedger {
    client: MongoClient,
    positions: MongoCollection<FarmingPositionDoc>,
    transactions: MongoCollection<TransactionDoc>,
    balances: MongoCollection<BalanceDoc>,
    referrals: MongoCollection<ReferralEdgeDoc>,
    track_states: MongoCollection<TrackStateDoc>,
    leases: MongoCollection<TrackLeaseDoc>,
}

impl MongoLedger {
    /// Open all collections and ensure their indexes exist
    pub async fn new(client: MongoClient) -> Result<Self> {
        Ok(Self {
            positions: client.collection(POSITION_COLLECTION).await?,
            transactions: client.collection(TRANSACTION_COLLECTION).await?,
            balances: client.collection(BALANCE_COLLECTION).await?,
            referrals: client.collection(REFERRAL_COLLECTION).await?,
            track_states: client.collection(TRACK_STATE_COLLECTION).await?,
            leases: client.collection(TRACK_LEASE_COLLECTION).await?,
            client,
        })
    }

    async fn start_transaction(&self) -> Result<ClientSession> {
        let mut session = self
            .client
            .inner()
            .start_session()
            .await
            .map_err(|e| GranaryError::Database(format!("start_session failed: {}", e)))?;
        session
            .start_transaction()
            .await
            .map_err(|e| GranaryError::Database(format!("start_transaction failed: {}", e)))?;
        Ok(session)
    }

    async fn abort(session: &mut ClientSession) {
        if let Err(e) = session.abort_transaction().await {
            debug!("abort_transaction failed (already closed?): {}", e);
        }
    }

    /// `$inc` the balance slot for `(owner, currency)`, creating it at zero
    /// if absent, inside the caller's transaction
    async fn inc_balance(
        &self,
        session: &mut ClientSession,
        owner: OwnerId,
        currency: Currency,
        amount: Amount,
    ) -> std::result::Result<(), mongodb::error::Error> {
        self.balances
            .inner()
            .update_one(
                doc! { "owner_id": owner, "currency": currency.as_str() },
                doc! {
                    "$inc": { "amount": amount.nanos() },
                    "$set": { "metadata.updated_at": bson::DateTime::now() },
                    "$setOnInsert": {
                        "metadata.is_deleted": false,
                        "metadata.created_at": bson::DateTime::now(),
                    },
                },
            )
            .upsert(true)
            .session(&mut *session)
            .await?;
        Ok(())
    }
}

fn snapshot_from(doc: FarmingPositionDoc) -> PositionSnapshot {
    PositionSnapshot {
        position_id: doc.position_id,
        owner_id: doc.owner_id,
        currency: doc.currency,
        principal: doc.principal,
        daily_rate: doc.daily_rate,
        last_accrual_at: doc.last_accrual_at.to_chrono(),
        version: doc.version,
    }
}

#[async_trait]
impl Ledger for MongoLedger {
    async fn eligible_positions(
        &self,
        currency: Currency,
        cutoff: DateTime<Utc>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PositionSnapshot>> {
        let mut filter = doc! {
            "currency": currency.as_str(),
            "active": true,
            "last_accrual_at": { "$lte": bson::DateTime::from_chrono(cutoff) },
        };
        if let Some(after) = after {
            filter.insert("position_id", doc! { "$gt": after });
        }

        let docs = self
            .positions
            .find_sorted(filter, doc! { "position_id": 1 }, limit as i64)
            .await?;

        Ok(docs.into_iter().map(snapshot_from).collect())
    }

    async fn commit_accrual(&self, commit: AccrualCommit) -> Result<CommitOutcome> {
        let tx_id = Uuid::new_v4().to_string();
        let mut session = self.start_transaction().await?;

        let tx_doc = TransactionDoc {
            _id: None,
            metadata: Metadata::new(),
            tx_id: tx_id.clone(),
            owner_id: commit.owner_id,
            kind: TxKind::FarmingReward,
            currency: commit.currency,
            amount: commit.amount,
            related_position_id: Some(commit.position_id.clone()),
            source_owner_id: None,
            level: None,
            epoch_key: commit.epoch_key.clone(),
            distribution_settled: None,
            created_at: bson::DateTime::now(),
        };

        // The unique epoch-key index rejects a second credit for this window
        if let Err(e) = self
            .transactions
            .inner()
            .insert_one(tx_doc)
            .session(&mut session)
            .await
        {
            Self::abort(&mut session).await;
            if is_duplicate_key(&e) {
                return Ok(CommitOutcome::AlreadyProcessed);
            }
            return Err(GranaryError::Database(format!(
                "accrual insert failed: {}",
                e
            )));
        }

        // Compare-and-advance the watermark on the snapshot version
        let cas = self
            .positions
            .inner()
            .update_one(
                doc! { "position_id": &commit.position_id, "version": commit.version },
                doc! {
                    "$set": {
                        "last_accrual_at": bson::DateTime::from_chrono(commit.watermark_after),
                        "metadata.updated_at": bson::DateTime::now(),
                    },
                    "$inc": { "version": 1 },
                },
            )
            .session(&mut session)
            .await;

        match cas {
            Ok(res) if res.modified_count == 1 => {}
            Ok(_) => {
                Self::abort(&mut session).await;
                return Ok(CommitOutcome::Conflict);
            }
            Err(e) => {
                Self::abort(&mut session).await;
                return Err(GranaryError::Database(format!("watermark CAS failed: {}", e)));
            }
        }

        if let Err(e) = self
            .inc_balance(&mut session, commit.owner_id, commit.currency, commit.amount)
            .await
        {
            Self::abort(&mut session).await;
            return Err(GranaryError::Database(format!(
                "balance increment failed: {}",
                e
            )));
        }

        session
            .commit_transaction()
            .await
            .map_err(|e| GranaryError::Database(format!("commit failed: {}", e)))?;

        Ok(CommitOutcome::Committed { tx_id })
    }

    async fn advance_watermark(
        &self,
        position_id: &str,
        version: i64,
        watermark_after: DateTime<Utc>,
    ) -> Result<bool> {
        let res = self
            .positions
            .update_one(
                doc! { "position_id": position_id, "version": version },
                doc! {
                    "$set": {
                        "last_accrual_at": bson::DateTime::from_chrono(watermark_after),
                        "metadata.updated_at": bson::DateTime::now(),
                    },
                    "$inc": { "version": 1 },
                },
            )
            .await?;
        Ok(res.modified_count == 1)
    }

    async fn credit_commission(&self, credit: CommissionCredit) -> Result<CommitOutcome> {
        let tx_id = Uuid::new_v4().to_string();
        let mut session = self.start_transaction().await?;

        let tx_doc = TransactionDoc {
            _id: None,
            metadata: Metadata::new(),
            tx_id: tx_id.clone(),
            owner_id: credit.owner_id,
            kind: TxKind::ReferralCommission,
            currency: credit.currency,
            amount: credit.amount,
            related_position_id: None,
            source_owner_id: Some(credit.source_owner_id),
            level: Some(credit.level as i32),
            epoch_key: credit.epoch_key.clone(),
            distribution_settled: None,
            created_at: bson::DateTime::now(),
        };

        if let Err(e) = self
            .transactions
            .inner()
            .insert_one(tx_doc)
            .session(&mut session)
            .await
        {
            Self::abort(&mut session).await;
            if is_duplicate_key(&e) {
                return Ok(CommitOutcome::AlreadyProcessed);
            }
            return Err(GranaryError::Database(format!(
                "commission insert failed: {}",
                e
            )));
        }

        if let Err(e) = self
            .inc_balance(&mut session, credit.owner_id, credit.currency, credit.amount)
            .await
        {
            Self::abort(&mut session).await;
            return Err(GranaryError::Database(format!(
                "commission balance increment failed: {}",
                e
            )));
        }

        session
            .commit_transaction()
            .await
            .map_err(|e| GranaryError::Database(format!("commit failed: {}", e)))?;

        Ok(CommitOutcome::Committed { tx_id })
    }

    async fn parent_of(&self, owner: OwnerId) -> Result<Option<OwnerId>> {
        let edge = self.referrals.find_one(doc! { "child_id": owner }).await?;
        Ok(edge.and_then(|e| e.parent_id))
    }

    async fn balance(&self, owner: OwnerId, currency: Currency) -> Result<Amount> {
        let doc = self
            .balances
            .find_one(doc! { "owner_id": owner, "currency": currency.as_str() })
            .await?;
        Ok(doc.map(|d| d.amount).unwrap_or(Amount::ZERO))
    }

    async fn track_state(&self, track: Track) -> Result<Option<TrackCycleState>> {
        let doc = self
            .track_states
            .find_one(doc! { "track": track.as_str() })
            .await?;
        Ok(doc.map(|d| TrackCycleState {
            last_cycle_at: d.last_cycle_at.to_chrono(),
            last_intended_at: d.last_intended_at.to_chrono(),
            cycles_run: d.cycles_run,
        }))
    }

    async fn record_cycle(
        &self,
        track: Track,
        intended_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        self.track_states
            .inner()
            .update_one(
                doc! { "track": track.as_str() },
                doc! {
                    "$set": {
                        "last_cycle_at": bson::DateTime::from_chrono(completed_at),
                        "last_intended_at": bson::DateTime::from_chrono(intended_at),
                        "metadata.updated_at": bson::DateTime::now(),
                    },
                    "$inc": { "cycles_run": 1i64 },
                    "$setOnInsert": {
                        "metadata.is_deleted": false,
                        "metadata.created_at": bson::DateTime::now(),
                    },
                },
            )
            .upsert(true)
            .await
            .map_err(|e| GranaryError::Database(format!("record_cycle failed: {}", e)))?;
        Ok(())
    }

    async fn acquire_lease(&self, track: Track, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        // Take the lease when it is free, expired, or already ours. When a
        // live competitor holds it, the filter matches nothing and the
        // upsert trips the unique track index instead.
        let result = self
            .leases
            .inner()
            .update_one(
                doc! {
                    "track": track.as_str(),
                    "$or": [
                        { "holder": holder },
                        { "expires_at": { "$lte": bson::DateTime::from_chrono(now) } },
                    ],
                },
                doc! {
                    "$set": {
                        "holder": holder,
                        "expires_at": bson::DateTime::from_chrono(now + ttl),
                        "metadata.updated_at": bson::DateTime::now(),
                    },
                    "$setOnInsert": {
                        "metadata.is_deleted": false,
                        "metadata.created_at": bson::DateTime::now(),
                    },
                },
            )
            .upsert(true)
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(GranaryError::Database(format!(
                "lease acquisition failed: {}",
                e
            ))),
        }
    }

    async fn renew_lease(&self, track: Track, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let res = self
            .leases
            .update_one(
                doc! {
                    "track": track.as_str(),
                    "holder": holder,
                    "expires_at": { "$gt": bson::DateTime::from_chrono(now) },
                },
                doc! {
                    "$set": {
                        "expires_at": bson::DateTime::from_chrono(now + ttl),
                        "metadata.updated_at": bson::DateTime::now(),
                    },
                },
            )
            .await?;
        Ok(res.modified_count == 1)
    }

    async fn release_lease(&self, track: Track, holder: &str) -> Result<()> {
        self.leases
            .inner()
            .delete_one(doc! { "track": track.as_str(), "holder": holder })
            .await
            .map_err(|e| GranaryError::Database(format!("lease release failed: {}", e)))?;
        Ok(())
    }

    async fn settle_distribution(&self, origin_tx_id: &str) -> Result<()> {
        self.transactions
            .update_one(
                doc! { "tx_id": origin_tx_id },
                doc! {
                    "$set": {
                        "distribution_settled": true,
                        "metadata.updated_at": bson::DateTime::now(),
                    },
                },
            )
            .await?;
        Ok(())
    }

    async fn accruals_missing_commissions(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingDistribution>> {
        // A crash mid-walk leaves some levels credited but the settled
        // marker unset; those accruals are still selected here
        let accruals = self
            .transactions
            .find_sorted(
                doc! {
                    "kind": TxKind::FarmingReward.as_str(),
                    "created_at": { "$gte": bson::DateTime::from_chrono(since) },
                    "distribution_settled": { "$ne": true },
                },
                doc! { "created_at": 1 },
                (limit * 4) as i64,
            )
            .await?;

        let mut pending = Vec::new();
        for accrual in accruals {
            // Roots have nobody to pay
            if self.parent_of(accrual.owner_id).await?.is_none() {
                continue;
            }
            pending.push(PendingDistribution {
                tx_id: accrual.tx_id,
                owner_id: accrual.owner_id,
                currency: accrual.currency,
                amount: accrual.amount,
            });
            if pending.len() >= limit {
                break;
            }
        }
        Ok(pending)
    }
}
