//! Position registry
//!
//! Read-only, paginated enumeration of positions eligible for the current
//! cycle. The minimum re-accrual window keeps a quickly-retried cycle from
//! reprocessing positions that were credited moments ago.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::ledger::{Ledger, PositionSnapshot};
use crate::types::{Currency, Result};

/// Paginated view over eligible positions
#[derive(Clone)]
pub struct PositionRegistry {
    ledger: Arc<dyn Ledger>,
    min_accrual_window: Duration,
    page_size: usize,
}

impl PositionRegistry {
    pub fn new(ledger: Arc<dyn Ledger>, min_accrual_window: Duration, page_size: usize) -> Self {
        Self {
            ledger,
            min_accrual_window,
            page_size,
        }
    }

    /// One page of active positions whose watermark is older than the
    /// minimum window, ordered by position id after `after`
    pub async fn next_page(
        &self,
        currency: Currency,
        now: DateTime<Utc>,
        after: Option<&str>,
    ) -> Result<Vec<PositionSnapshot>> {
        let cutoff = now - self.min_accrual_window;
        self.ledger
            .eligible_positions(currency, cutoff, after, self.page_size)
            .await
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::types::{Amount, Rate};

    fn seed(ledger: &MemoryLedger, id: &str, age_secs: i64) {
        ledger.insert_position(
            id,
            1,
            Currency::Uni,
            Amount::from_units(100),
            Rate::from_ppm(10_000),
            Utc::now() - Duration::seconds(age_secs),
        );
    }

    #[tokio::test]
    async fn recently_credited_positions_are_not_eligible() {
        let ledger = Arc::new(MemoryLedger::new());
        seed(&ledger, "old", 300);
        seed(&ledger, "fresh", 10);

        let registry = PositionRegistry::new(ledger, Duration::seconds(60), 100);
        let page = registry
            .next_page(Currency::Uni, Utc::now(), None)
            .await
            .unwrap();

        assert_eq!(page.len(), 1);
        assert_eq!(page[0].position_id, "old");
    }

    #[tokio::test]
    async fn pagination_walks_positions_in_order() {
        let ledger = Arc::new(MemoryLedger::new());
        for i in 0..5 {
            seed(&ledger, &format!("pos-{}", i), 600);
        }

        let registry = PositionRegistry::new(ledger, Duration::seconds(60), 2);
        let now = Utc::now();

        let mut seen = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = registry
                .next_page(Currency::Uni, now, after.as_deref())
                .await
                .unwrap();
            if page.is_empty() {
                break;
            }
            after = Some(page.last().unwrap().position_id.clone());
            seen.extend(page.into_iter().map(|p| p.position_id));
        }

        assert_eq!(seen, vec!["pos-0", "pos-1", "pos-2", "pos-3", "pos-4"]);
    }

    #[tokio::test]
    async fn inactive_positions_are_excluded() {
        let ledger = Arc::new(MemoryLedger::new());
        seed(&ledger, "live", 300);
        seed(&ledger, "closed", 300);
        ledger.deactivate_position("closed");

        let registry = PositionRegistry::new(ledger, Duration::seconds(60), 100);
        let page = registry
            .next_page(Currency::Uni, Utc::now(), None)
            .await
            .unwrap();

        assert_eq!(page.len(), 1);
        assert_eq!(page[0].position_id, "live");
    }
}
