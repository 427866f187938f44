//! Configuration for Granary
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::path::PathBuf;
use uuid::Uuid;

use crate::types::Track;

/// Granary - accrual scheduler and referral commission engine
#[derive(Parser, Debug, Clone)]
#[command(name = "granary")]
#[command(about = "Token farming accrual scheduler with referral commission cascade")]
pub struct Args {
    /// Unique identifier for this scheduler instance (lease holder id)
    #[arg(long, env = "INSTANCE_ID", default_value_t = Uuid::new_v4())]
    pub instance_id: Uuid,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "granary")]
    pub mongodb_db: String,

    /// Enable development mode (in-process ledger, no MongoDB required)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// UNI track cycle interval in seconds
    #[arg(long, env = "UNI_INTERVAL_SECS", default_value = "300")]
    pub uni_interval_secs: u64,

    /// TON Boost track cycle interval in seconds
    #[arg(long, env = "TON_BOOST_INTERVAL_SECS", default_value = "300")]
    pub ton_boost_interval_secs: u64,

    /// Minimum seconds since a position's watermark before it re-accrues
    #[arg(long, env = "MIN_ACCRUAL_WINDOW_SECS", default_value = "60")]
    pub min_accrual_window_secs: u64,

    /// Track lease time-to-live in seconds
    #[arg(long, env = "LEASE_TTL_SECS", default_value = "120")]
    pub lease_ttl_secs: u64,

    /// Random delay before lease acquisition, in milliseconds
    #[arg(long, env = "LEASE_JITTER_MS", default_value = "250")]
    pub lease_jitter_ms: u64,

    /// Number of concurrent position workers per cycle
    #[arg(long, env = "WORKER_COUNT", default_value = "8")]
    pub worker_count: usize,

    /// Positions fetched per storage page
    #[arg(long, env = "PAGE_SIZE", default_value = "500")]
    pub page_size: usize,

    /// Seconds between commission reconciliation passes
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value = "600")]
    pub reconcile_interval_secs: u64,

    /// How far back the reconciler scans for unsettled accruals, in seconds
    #[arg(long, env = "RECONCILE_LOOKBACK_SECS", default_value = "86400")]
    pub reconcile_lookback_secs: u64,

    /// Unsettled accruals replayed per reconciliation pass
    #[arg(long, env = "RECONCILE_BATCH_SIZE", default_value = "100")]
    pub reconcile_batch_size: usize,

    /// Path for the JSONL audit event log (disabled when unset)
    #[arg(long, env = "AUDIT_LOG_PATH")]
    pub audit_log_path: Option<PathBuf>,

    /// JSON file with commission level percentages (built-in curve when unset)
    #[arg(long, env = "RATES_FILE")]
    pub rates_file: Option<PathBuf>,

    /// Seconds between commission rate file reload checks
    #[arg(long, env = "RATES_RELOAD_SECS", default_value = "300")]
    pub rates_reload_secs: u64,
}

impl Args {
    /// Cycle interval for a track
    pub fn interval_secs(&self, track: Track) -> u64 {
        match track {
            Track::Uni => self.uni_interval_secs,
            Track::TonBoost => self.ton_boost_interval_secs,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("WORKER_COUNT must be at least 1".to_string());
        }
        if self.page_size == 0 {
            return Err("PAGE_SIZE must be at least 1".to_string());
        }
        if self.uni_interval_secs == 0 || self.ton_boost_interval_secs == 0 {
            return Err("track intervals must be at least 1 second".to_string());
        }
        if self.lease_ttl_secs == 0 {
            return Err("LEASE_TTL_SECS must be at least 1".to_string());
        }
        let min_interval = self.uni_interval_secs.min(self.ton_boost_interval_secs);
        if self.min_accrual_window_secs >= min_interval {
            return Err(format!(
                "MIN_ACCRUAL_WINDOW_SECS ({}) must be shorter than the shortest track interval ({})",
                self.min_accrual_window_secs, min_interval
            ));
        }
        if self.reconcile_interval_secs == 0 || self.reconcile_batch_size == 0 {
            return Err("reconciliation interval and batch size must be at least 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let args = Args::parse_from(["granary"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.uni_interval_secs, 300);
        assert_eq!(args.interval_secs(Track::TonBoost), 300);
        assert!(!args.dev_mode);
    }

    #[test]
    fn window_must_fit_inside_the_interval() {
        let args = Args::parse_from([
            "granary",
            "--uni-interval-secs",
            "60",
            "--min-accrual-window-secs",
            "60",
        ]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn zero_workers_rejected() {
        let args = Args::parse_from(["granary", "--worker-count", "0"]);
        assert!(args.validate().is_err());
    }
}
