//! Commission rate table
//!
//! Level percentages apply to the commission base (1% of the triggering
//! yield). The default curve is level 1 = 100, level n = max(2, 22 - n)
//! for n in 2..=20 — strictly decreasing until it hits the 2% floor.
//! Business configuration, not algorithm: the table is injectable and can
//! be reloaded from a JSON file without restarting the scheduler.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::types::{Amount, GranaryError, Result};

/// Maximum referral depth paid out from a single accrual
pub const MAX_LEVELS: u8 = 20;

/// Per-level commission percentages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionTable {
    /// Percentage of the commission base per level; index 0 is level 1
    levels: Vec<u32>,
}

impl Default for CommissionTable {
    fn default() -> Self {
        let levels = (1..=MAX_LEVELS as u32)
            .map(|n| if n == 1 { 100 } else { (22 - n).max(2) })
            .collect();
        Self { levels }
    }
}

impl CommissionTable {
    /// Build a table from explicit percentages (level 1 first).
    /// At most [`MAX_LEVELS`] entries; a shorter table simply pays fewer
    /// levels.
    pub fn from_percentages(levels: Vec<u32>) -> Result<Self> {
        if levels.is_empty() {
            return Err(GranaryError::Config(
                "commission table must have at least one level".into(),
            ));
        }
        if levels.len() > MAX_LEVELS as usize {
            return Err(GranaryError::Config(format!(
                "commission table has {} levels, maximum is {}",
                levels.len(),
                MAX_LEVELS
            )));
        }
        Ok(Self { levels })
    }

    /// Percentage for `level` (1-based); None past the table's depth
    pub fn percentage(&self, level: u8) -> Option<u32> {
        if level == 0 {
            return None;
        }
        self.levels.get(level as usize - 1).copied()
    }

    /// Number of levels this table pays
    pub fn depth(&self) -> u8 {
        self.levels.len() as u8
    }
}

/// Commission for one level: `base * 1% * pct / 100`, one truncating
/// division so per-level amounts are exact in fixed point
pub fn commission_amount(base_yield: Amount, percentage: u32) -> Amount {
    base_yield.mul_ratio(percentage as u64, 10_000)
}

/// Shared handle to the live commission table, swappable at runtime
#[derive(Clone)]
pub struct RatesHandle {
    inner: Arc<RwLock<CommissionTable>>,
}

impl RatesHandle {
    pub fn new(table: CommissionTable) -> Self {
        Self {
            inner: Arc::new(RwLock::new(table)),
        }
    }

    pub async fn table(&self) -> CommissionTable {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, table: CommissionTable) {
        *self.inner.write().await = table;
    }

    /// Parse a table from a JSON file (`{"levels": [100, 20, ...]}`)
    pub async fn load_file(path: &Path) -> Result<CommissionTable> {
        let raw = tokio::fs::read_to_string(path).await?;
        let table: CommissionTable = serde_json::from_str(&raw)?;
        // Re-validate through the constructor
        CommissionTable::from_percentages(table.levels)
    }

    /// Spawn a background task that re-reads `path` every `interval` and
    /// swaps the table in place when it changes. Errors keep the previous
    /// table; the scheduler never restarts for a rate change.
    pub fn spawn_reload_task(
        &self,
        path: PathBuf,
        interval: StdDuration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }

                match Self::load_file(&path).await {
                    Ok(table) => {
                        if table != handle.table().await {
                            info!(path = %path.display(), depth = table.depth(), "Commission table reloaded");
                            handle.replace(table).await;
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), "Commission table reload failed, keeping previous: {}", e);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_curve_matches_schedule() {
        let table = CommissionTable::default();
        assert_eq!(table.depth(), 20);
        assert_eq!(table.percentage(1), Some(100));
        assert_eq!(table.percentage(2), Some(20));
        assert_eq!(table.percentage(3), Some(19));
        assert_eq!(table.percentage(19), Some(3));
        assert_eq!(table.percentage(20), Some(2));
        assert_eq!(table.percentage(21), None);
        assert_eq!(table.percentage(0), None);
    }

    #[test]
    fn curve_is_decreasing_with_floor() {
        let table = CommissionTable::default();
        for level in 2..=20u8 {
            let prev = table.percentage(level - 1).unwrap();
            let cur = table.percentage(level).unwrap();
            assert!(cur <= prev);
            assert!(cur >= 2);
        }
    }

    #[test]
    fn commission_amounts_are_exact_fixed_point() {
        let base = Amount::from_nanos(34_722_222);
        // level 1: full 1% of the yield
        assert_eq!(commission_amount(base, 100).nanos(), 347_222);
        // level 2: 20% of that base
        assert_eq!(commission_amount(base, 20).nanos(), 69_444);
        // every level stays at or below the commission base
        let table = CommissionTable::default();
        let cap = commission_amount(base, 100);
        for level in 1..=20u8 {
            let pct = table.percentage(level).unwrap();
            assert!(commission_amount(base, pct) <= cap);
        }
    }

    #[test]
    fn table_validation_rejects_bad_shapes() {
        assert!(CommissionTable::from_percentages(vec![]).is_err());
        assert!(CommissionTable::from_percentages(vec![100; 21]).is_err());
        let short = CommissionTable::from_percentages(vec![100, 50]).unwrap();
        assert_eq!(short.depth(), 2);
        assert_eq!(short.percentage(3), None);
    }
}
