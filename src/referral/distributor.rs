//! Commission distributor
//!
//! Walks parent pointers from the accruing user and credits each ancestor
//! its level's share of the commission base. The referral graph is owned
//! elsewhere and weakly validated, so the walk carries a visited set: a
//! revisited id ends the walk and is reported as a data-integrity anomaly,
//! never a crash. Credits are idempotent per `(origin_tx, level)`, so a
//! walk interrupted mid-way can be replayed safely.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::rates::{commission_amount, RatesHandle, MAX_LEVELS};
use crate::ledger::{commission_epoch_key, CommissionCredit, CommitOutcome, Ledger};
use crate::logging::AuditLogger;
use crate::types::{Amount, Currency, GranaryError, OwnerId, Result};

/// Outcome of one completed distribution walk. A walk that errors part
/// way returns no report and leaves the accrual unsettled for the
/// reconciliation job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionReport {
    /// Levels that received a new credit
    pub levels_credited: u8,
    /// Levels skipped because the credit already existed (replay)
    pub levels_already_processed: u8,
    /// Sum of newly credited amounts
    pub total: Amount,
    /// The walk was cut short by a graph cycle
    pub truncated_by_cycle: bool,
}

/// Fans one accrual's commission out along the referral chain
#[derive(Clone)]
pub struct CommissionDistributor {
    ledger: Arc<dyn Ledger>,
    rates: RatesHandle,
    audit: AuditLogger,
}

impl CommissionDistributor {
    pub fn new(ledger: Arc<dyn Ledger>, rates: RatesHandle, audit: AuditLogger) -> Self {
        Self {
            ledger,
            rates,
            audit,
        }
    }

    /// Credit ancestors of `source` from a committed accrual of `base`.
    /// `origin_tx_id` anchors the per-level idempotency keys.
    pub async fn distribute(
        &self,
        source: OwnerId,
        base: Amount,
        currency: Currency,
        origin_tx_id: &str,
    ) -> Result<DistributionReport> {
        let table = self.rates.table().await;
        let depth = table.depth().min(MAX_LEVELS);

        let mut report = DistributionReport::default();
        let mut visited: HashSet<OwnerId> = HashSet::new();
        visited.insert(source);

        let mut current = self.ledger.parent_of(source).await?;
        let mut level: u8 = 1;

        while let Some(ancestor) = current {
            if level > depth {
                break;
            }
            if !visited.insert(ancestor) {
                warn!(
                    source_owner = source,
                    revisited = ancestor,
                    level,
                    "Referral graph cycle detected, truncating walk"
                );
                self.audit.log_graph_anomaly(source, ancestor, level).await;
                report.truncated_by_cycle = true;
                break;
            }

            let Some(percentage) = table.percentage(level) else {
                break;
            };
            let amount = commission_amount(base, percentage);

            if !amount.is_zero() {
                let credit = CommissionCredit {
                    owner_id: ancestor,
                    source_owner_id: source,
                    currency,
                    amount,
                    level,
                    origin_tx_id: origin_tx_id.to_string(),
                    epoch_key: commission_epoch_key(origin_tx_id, level),
                };

                match self.ledger.credit_commission(credit).await? {
                    CommitOutcome::Committed { tx_id } => {
                        debug!(
                            ancestor,
                            level,
                            amount = %amount,
                            tx_id = %tx_id,
                            "Commission credited"
                        );
                        report.levels_credited += 1;
                        report.total = report.total.checked_add(amount).ok_or_else(|| {
                            GranaryError::Database("commission total overflow".into())
                        })?;
                    }
                    CommitOutcome::AlreadyProcessed => {
                        report.levels_already_processed += 1;
                    }
                    CommitOutcome::Conflict => {
                        // Commissions carry no version; the ledger never
                        // reports a conflict here
                        return Err(GranaryError::Database(
                            "unexpected conflict on commission credit".into(),
                        ));
                    }
                }
            }

            current = self.ledger.parent_of(ancestor).await?;
            level += 1;
        }

        // The walk reached its end (root, depth limit, or truncated
        // cycle); only now does the accrual leave the reconciliation feed
        self.ledger.settle_distribution(origin_tx_id).await?;

        Ok(report)
    }
}
