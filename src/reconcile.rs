//! Commission reconciliation
//!
//! A crash between an accrual commit and its commission fan-out leaves a
//! farming transaction with no commission transactions attached. This job
//! periodically scans a recent window for such accruals and replays the
//! distribution; per-level epoch keys make the replay safe even when the
//! original walk got partway through.

use chrono::{Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::ledger::Ledger;
use crate::referral::CommissionDistributor;
use crate::types::Result;

pub struct Reconciler {
    ledger: Arc<dyn Ledger>,
    distributor: CommissionDistributor,
    /// How far back to scan for unsettled accruals
    lookback: Duration,
    interval: StdDuration,
    batch_size: usize,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        distributor: CommissionDistributor,
        lookback: Duration,
        interval: StdDuration,
        batch_size: usize,
    ) -> Self {
        Self {
            ledger,
            distributor,
            lookback,
            interval,
            batch_size,
        }
    }

    /// Run until the shutdown channel flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            lookback_secs = self.lookback.num_seconds(),
            "Commission reconciler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Commission reconciler stopping");
                        return;
                    }
                }
            }

            if let Err(e) = self.run_once().await {
                error!("Reconciliation pass failed: {}", e);
            }
        }
    }

    /// One reconciliation pass; returns the number of accruals replayed
    pub async fn run_once(&self) -> Result<usize> {
        let since = Utc::now() - self.lookback;
        let pending = self
            .ledger
            .accruals_missing_commissions(since, self.batch_size)
            .await?;

        if pending.is_empty() {
            debug!("No unsettled accruals");
            return Ok(0);
        }

        let mut replayed = 0;
        for accrual in &pending {
            match self
                .distributor
                .distribute(accrual.owner_id, accrual.amount, accrual.currency, &accrual.tx_id)
                .await
            {
                Ok(report) => {
                    replayed += 1;
                    debug!(
                        tx_id = %accrual.tx_id,
                        levels_credited = report.levels_credited,
                        "Replayed commission distribution"
                    );
                }
                Err(e) => {
                    // Left pending, picked up again next pass
                    warn!(tx_id = %accrual.tx_id, "Replay failed: {}", e);
                }
            }
        }

        info!(
            pending = pending.len(),
            replayed, "Reconciliation pass completed"
        );
        Ok(replayed)
    }
}
