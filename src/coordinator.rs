//! Cycle coordinator
//!
//! Runs one accrual cycle for a track: pages through eligible positions,
//! fans them out to a bounded set of workers, and for each position
//! computes the elapsed-window yield, commits it atomically, and fans the
//! commission out along the referral chain. Per-position failures are
//! contained; the cycle always runs to completion and reports counters.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::accrual::{accrued_yield, PositionRegistry};
use crate::ledger::{accrual_epoch_key, AccrualCommit, CommitOutcome, Ledger, PositionSnapshot};
use crate::logging::AuditLogger;
use crate::referral::CommissionDistributor;
use crate::types::{Amount, GranaryError, Result, Track};

/// Counters for one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Positions that received a new accrual transaction
    pub processed: u64,
    /// Positions skipped: zero yield, clock skew, or lost race
    pub skipped: u64,
    /// Positions that errored; they retry next cycle
    pub failed: u64,
    /// Sum of yield credited this cycle
    pub total_yield: Amount,
}

enum PositionOutcome {
    Credited(Amount),
    Skipped,
    Failed,
}

/// Drives accrual cycles for all tracks
#[derive(Clone)]
pub struct CycleCoordinator {
    ledger: Arc<dyn Ledger>,
    registry: PositionRegistry,
    distributor: CommissionDistributor,
    audit: AuditLogger,
    worker_count: usize,
}

impl CycleCoordinator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        registry: PositionRegistry,
        distributor: CommissionDistributor,
        audit: AuditLogger,
        worker_count: usize,
    ) -> Self {
        Self {
            ledger,
            registry,
            distributor,
            audit,
            worker_count,
        }
    }

    /// Run one full cycle for `track` at logical time `now`
    pub async fn run_cycle(&self, track: Track, now: DateTime<Utc>) -> Result<CycleSummary> {
        let started = std::time::Instant::now();
        let mut summary = CycleSummary::default();
        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut after: Option<String> = None;

        loop {
            let page = self
                .registry
                .next_page(track.currency(), now, after.as_deref())
                .await?;
            if page.is_empty() {
                break;
            }
            after = page.last().map(|p| p.position_id.clone());

            let mut workers = JoinSet::new();
            for snapshot in page {
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| GranaryError::Database("worker semaphore closed".into()))?;
                let coordinator = self.clone();
                workers.spawn(async move {
                    let _permit = permit;
                    coordinator.process_position(snapshot, now).await
                });
            }

            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(PositionOutcome::Credited(amount)) => {
                        summary.processed += 1;
                        summary.total_yield = summary
                            .total_yield
                            .checked_add(amount)
                            .unwrap_or(Amount::from_nanos(i64::MAX));
                    }
                    Ok(PositionOutcome::Skipped) => summary.skipped += 1,
                    Ok(PositionOutcome::Failed) => summary.failed += 1,
                    Err(e) => {
                        error!(track = %track, "Accrual worker panicked: {}", e);
                        summary.failed += 1;
                    }
                }
            }
        }

        info!(
            track = %track,
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            total_yield = %summary.total_yield,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Accrual cycle completed"
        );
        self.audit
            .log_cycle_completed(
                track.as_str(),
                summary.processed,
                summary.skipped,
                summary.failed,
                summary.total_yield.to_string(),
            )
            .await;

        Ok(summary)
    }

    /// One position's accrual step. Never propagates an error; failures
    /// are logged and the position retries on the next cycle.
    async fn process_position(&self, snapshot: PositionSnapshot, now: DateTime<Utc>) -> PositionOutcome {
        let elapsed_ms = (now - snapshot.last_accrual_at).num_milliseconds();
        if elapsed_ms < 0 {
            warn!(
                position_id = %snapshot.position_id,
                skew_ms = elapsed_ms,
                "Watermark ahead of wall clock, skipping position"
            );
            self.audit
                .log_clock_skew(&snapshot.position_id, elapsed_ms)
                .await;
            return PositionOutcome::Skipped;
        }
        let elapsed_secs = (elapsed_ms / 1000) as u64;

        let amount = accrued_yield(snapshot.principal, snapshot.daily_rate, elapsed_secs);

        if amount.is_zero() {
            // Advance the watermark anyway so dust positions do not
            // accumulate an ever-growing window
            return match self
                .ledger
                .advance_watermark(&snapshot.position_id, snapshot.version, now)
                .await
            {
                Ok(_) => PositionOutcome::Skipped,
                Err(e) => {
                    error!(position_id = %snapshot.position_id, "Watermark advance failed: {}", e);
                    PositionOutcome::Failed
                }
            };
        }

        let commit = AccrualCommit {
            position_id: snapshot.position_id.clone(),
            owner_id: snapshot.owner_id,
            currency: snapshot.currency,
            amount,
            watermark_before: snapshot.last_accrual_at,
            watermark_after: now,
            version: snapshot.version,
            epoch_key: accrual_epoch_key(&snapshot.position_id, snapshot.last_accrual_at),
        };

        match self.ledger.commit_accrual(commit).await {
            Ok(CommitOutcome::Committed { tx_id }) => {
                debug!(
                    position_id = %snapshot.position_id,
                    amount = %amount,
                    tx_id = %tx_id,
                    "Accrual committed"
                );
                // Best effort: the accrual stands even if distribution
                // fails, and the reconciliation job replays it later
                if let Err(e) = self
                    .distributor
                    .distribute(snapshot.owner_id, amount, snapshot.currency, &tx_id)
                    .await
                {
                    warn!(tx_id = %tx_id, "Commission distribution failed: {}", e);
                    self.audit
                        .log_commission_failure(&tx_id, snapshot.owner_id, &e.to_string())
                        .await;
                }
                PositionOutcome::Credited(amount)
            }
            Ok(CommitOutcome::AlreadyProcessed) => {
                debug!(position_id = %snapshot.position_id, "Epoch already credited");
                PositionOutcome::Skipped
            }
            Ok(CommitOutcome::Conflict) => {
                debug!(position_id = %snapshot.position_id, "Lost watermark race");
                PositionOutcome::Skipped
            }
            Err(e) => {
                error!(position_id = %snapshot.position_id, "Accrual commit failed: {}", e);
                PositionOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::referral::{CommissionTable, RatesHandle};
    use crate::types::{Currency, Rate, TxKind};
    use chrono::Duration;

    fn coordinator(ledger: Arc<MemoryLedger>) -> CycleCoordinator {
        let audit = AuditLogger::new("test".to_string());
        let registry = PositionRegistry::new(Arc::clone(&ledger) as Arc<dyn Ledger>, Duration::seconds(60), 100);
        let distributor = CommissionDistributor::new(
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            RatesHandle::new(CommissionTable::default()),
            audit.clone(),
        );
        CycleCoordinator::new(ledger, registry, distributor, audit, 4)
    }

    #[tokio::test]
    async fn cycle_credits_yield_and_cascades_commissions() {
        let ledger = Arc::new(MemoryLedger::new());
        let start = Utc::now() - Duration::seconds(300);
        ledger.insert_position(
            "pos-1",
            1,
            Currency::Uni,
            Amount::from_units(1000),
            Rate::from_ppm(10_000),
            start,
        );
        ledger.link_referral(1, 2);
        ledger.link_referral(2, 3);

        let now = start + Duration::seconds(300);
        let summary = coordinator(Arc::clone(&ledger))
            .run_cycle(Track::Uni, now)
            .await
            .unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.total_yield, Amount::from_nanos(34_722_222));

        assert_eq!(
            ledger.balance(1, Currency::Uni).await.unwrap(),
            Amount::from_nanos(34_722_222)
        );
        assert_eq!(
            ledger.balance(2, Currency::Uni).await.unwrap(),
            Amount::from_nanos(347_222)
        );
        assert_eq!(
            ledger.balance(3, Currency::Uni).await.unwrap(),
            Amount::from_nanos(69_444)
        );

        let pos = ledger.position("pos-1").unwrap();
        assert_eq!(pos.last_accrual_at, now);
        assert_eq!(pos.version, 1);
    }

    #[tokio::test]
    async fn zero_yield_advances_watermark_without_transaction() {
        let ledger = Arc::new(MemoryLedger::new());
        let start = Utc::now() - Duration::seconds(300);
        ledger.insert_position(
            "pos-1",
            1,
            Currency::Uni,
            Amount::from_units(100),
            Rate::from_ppm(0),
            start,
        );

        let now = Utc::now();
        let summary = coordinator(Arc::clone(&ledger))
            .run_cycle(Track::Uni, now)
            .await
            .unwrap();

        assert_eq!(summary.processed, 0);
        assert_eq!(summary.skipped, 1);
        assert!(ledger.entries().is_empty());
        assert_eq!(ledger.position("pos-1").unwrap().last_accrual_at, now);
    }

    #[tokio::test]
    async fn future_watermark_is_skipped_untouched() {
        let ledger = Arc::new(MemoryLedger::new());
        let future = Utc::now() + Duration::seconds(120);
        ledger.insert_position(
            "pos-1",
            1,
            Currency::Uni,
            Amount::from_units(100),
            Rate::from_ppm(10_000),
            future,
        );

        let coordinator = coordinator(Arc::clone(&ledger));
        let snapshot = ledger.position("pos-1").unwrap();
        let outcome = coordinator.process_position(snapshot, Utc::now()).await;

        assert!(matches!(outcome, PositionOutcome::Skipped));
        assert!(ledger.entries().is_empty());
        assert_eq!(ledger.position("pos-1").unwrap().last_accrual_at, future);
        assert_eq!(ledger.position("pos-1").unwrap().version, 0);
    }

    #[tokio::test]
    async fn rerunning_at_the_same_instant_credits_nothing_twice() {
        let ledger = Arc::new(MemoryLedger::new());
        let start = Utc::now() - Duration::seconds(300);
        ledger.insert_position(
            "pos-1",
            1,
            Currency::Uni,
            Amount::from_units(1000),
            Rate::from_ppm(10_000),
            start,
        );

        let coordinator = coordinator(Arc::clone(&ledger));
        let now = Utc::now();
        coordinator.run_cycle(Track::Uni, now).await.unwrap();
        let balance_after_first = ledger.balance(1, Currency::Uni).await.unwrap();

        let summary = coordinator.run_cycle(Track::Uni, now).await.unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(ledger.entries().len(), 1);
        assert_eq!(
            ledger.balance(1, Currency::Uni).await.unwrap(),
            balance_after_first
        );
    }

    #[tokio::test]
    async fn downtime_gap_accrues_in_one_window() {
        let ledger = Arc::new(MemoryLedger::new());
        let start = Utc::now() - Duration::hours(1);
        ledger.insert_position(
            "pos-1",
            1,
            Currency::Uni,
            Amount::from_units(1000),
            Rate::from_ppm(10_000),
            start,
        );

        // one catch-up cycle covers the whole hour, no per-missed-tick replay
        let now = start + Duration::hours(1);
        let summary = coordinator(Arc::clone(&ledger))
            .run_cycle(Track::Uni, now)
            .await
            .unwrap();

        assert_eq!(summary.processed, 1);
        // 1000 * 1% * 3600/86400
        assert_eq!(summary.total_yield, Amount::from_nanos(416_666_666));
        assert_eq!(ledger.entries().len(), 1);
    }

    #[tokio::test]
    async fn tracks_only_touch_their_own_currency() {
        let ledger = Arc::new(MemoryLedger::new());
        let start = Utc::now() - Duration::seconds(300);
        ledger.insert_position(
            "pos-uni",
            1,
            Currency::Uni,
            Amount::from_units(100),
            Rate::from_ppm(10_000),
            start,
        );
        ledger.insert_position(
            "pos-ton",
            1,
            Currency::Ton,
            Amount::from_units(100),
            Rate::from_ppm(10_000),
            start,
        );

        let summary = coordinator(Arc::clone(&ledger))
            .run_cycle(Track::TonBoost, Utc::now())
            .await
            .unwrap();

        assert_eq!(summary.processed, 1);
        let entries = ledger.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, TxKind::FarmingReward);
        assert_eq!(entries[0].currency, Currency::Ton);
        assert!(ledger.balance(1, Currency::Uni).await.unwrap().is_zero());
    }
}
