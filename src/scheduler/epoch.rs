//! Epoch scheduler
//!
//! One loop per track. Ticks stay on a fixed grid anchored at the last
//! intended tick, so cycle runtime does not drift the cadence. After
//! downtime the loop runs exactly one catch-up cycle; elapsed-time accrual
//! makes per-missed-tick replay unnecessary.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::lease::{acquire_jitter, TrackLease};
use crate::coordinator::CycleCoordinator;
use crate::ledger::Ledger;
use crate::types::Track;

/// Next tick on the interval grid anchored at `last_intended`, strictly
/// after `now`. Missed grid points collapse into one.
pub fn next_intended(
    last_intended: DateTime<Utc>,
    interval: Duration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let interval_ms = interval.num_milliseconds().max(1);
    let behind_ms = (now - last_intended).num_milliseconds();
    if behind_ms < 0 {
        return last_intended + interval;
    }
    let steps = behind_ms / interval_ms + 1;
    last_intended + Duration::milliseconds(steps * interval_ms)
}

/// True when more than one full interval passed since the last completed
/// cycle, which means the process was down and owes a catch-up cycle
pub fn needs_catchup(
    last_cycle_at: DateTime<Utc>,
    interval: Duration,
    now: DateTime<Utc>,
) -> bool {
    now - last_cycle_at > interval
}

/// How often a running cycle renews its lease: half the TTL, never more
/// than once a second
pub fn renewal_period(ttl: Duration) -> std::time::Duration {
    let half_ms = (ttl.num_milliseconds() / 2).max(1_000);
    std::time::Duration::from_millis(half_ms as u64)
}

/// Periodic cycle runner for one track
pub struct EpochScheduler {
    ledger: Arc<dyn Ledger>,
    coordinator: CycleCoordinator,
    lease: TrackLease,
    track: Track,
    interval: Duration,
    jitter_ms: u64,
}

impl EpochScheduler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        coordinator: CycleCoordinator,
        lease: TrackLease,
        track: Track,
        interval: Duration,
        jitter_ms: u64,
    ) -> Self {
        Self {
            ledger,
            coordinator,
            lease,
            track,
            interval,
            jitter_ms,
        }
    }

    /// Run until the shutdown channel flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            track = %self.track,
            interval_secs = self.interval.num_seconds(),
            "Accrual scheduler started"
        );

        let mut anchor = Utc::now();
        match self.ledger.track_state(self.track).await {
            Ok(Some(state)) => {
                anchor = state.last_intended_at;
                if needs_catchup(state.last_cycle_at, self.interval, Utc::now()) {
                    info!(
                        track = %self.track,
                        last_cycle_at = %state.last_cycle_at,
                        "Downtime detected, running catch-up cycle"
                    );
                    self.tick(Utc::now()).await;
                    anchor = Utc::now();
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(track = %self.track, "Could not read track state, starting fresh: {}", e);
            }
        }

        loop {
            let now = Utc::now();
            let intended = next_intended(anchor, self.interval, now);
            let wait = (intended - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(track = %self.track, "Accrual scheduler stopping");
                        return;
                    }
                }
            }

            self.tick(intended).await;
            anchor = intended;
        }
    }

    /// One tick: jitter, take the lease, run the cycle while renewing the
    /// lease at half-TTL cadence, record it, release
    async fn tick(&self, intended: DateTime<Utc>) {
        tokio::time::sleep(acquire_jitter(self.jitter_ms)).await;

        match self.lease.try_acquire().await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                error!(track = %self.track, "Lease acquisition failed: {}", e);
                return;
            }
        }

        let cycle = self.coordinator.run_cycle(self.track, Utc::now());
        tokio::pin!(cycle);
        let mut renewal = tokio::time::interval(renewal_period(self.lease.ttl()));
        // the first interval tick fires immediately
        renewal.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut cycle => break result,
                _ = renewal.tick() => {
                    match self.lease.renew().await {
                        Ok(true) => {}
                        Ok(false) => {
                            // Epoch keys keep an overlapping runner harmless;
                            // finish the cycle anyway
                            warn!(track = %self.track, "Lease expired mid-cycle");
                        }
                        Err(e) => {
                            warn!(track = %self.track, "Lease renewal failed: {}", e);
                        }
                    }
                }
            }
        };

        if let Err(e) = result {
            error!(track = %self.track, "Accrual cycle failed: {}", e);
        } else if let Err(e) = self
            .ledger
            .record_cycle(self.track, intended, Utc::now())
            .await
        {
            warn!(track = %self.track, "Could not record cycle state: {}", e);
        }

        if let Err(e) = self.lease.release().await {
            warn!(track = %self.track, "Lease release failed, will expire on its own: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn ticks_stay_on_the_grid() {
        let interval = Duration::seconds(300);
        let anchor = at("2025-08-25T12:00:00Z");

        // just after the anchor: next grid point
        let next = next_intended(anchor, interval, at("2025-08-25T12:00:01Z"));
        assert_eq!(next, at("2025-08-25T12:05:00Z"));

        // a slow cycle ran past one boundary: stay on grid, no drift
        let next = next_intended(anchor, interval, at("2025-08-25T12:06:30Z"));
        assert_eq!(next, at("2025-08-25T12:10:00Z"));
    }

    #[test]
    fn missed_grid_points_collapse_into_one() {
        let interval = Duration::seconds(300);
        let anchor = at("2025-08-25T12:00:00Z");

        // an hour behind: the next tick is the first future grid point,
        // not twelve queued ticks
        let next = next_intended(anchor, interval, at("2025-08-25T13:02:00Z"));
        assert_eq!(next, at("2025-08-25T13:05:00Z"));
    }

    #[test]
    fn future_anchor_waits_one_interval() {
        let interval = Duration::seconds(300);
        let anchor = at("2025-08-25T12:10:00Z");
        let next = next_intended(anchor, interval, at("2025-08-25T12:08:00Z"));
        assert_eq!(next, at("2025-08-25T12:15:00Z"));
    }

    #[test]
    fn catchup_only_after_a_full_missed_interval() {
        let interval = Duration::seconds(300);
        let now = at("2025-08-25T12:10:00Z");

        assert!(!needs_catchup(at("2025-08-25T12:06:00Z"), interval, now));
        assert!(!needs_catchup(at("2025-08-25T12:05:00Z"), interval, now));
        assert!(needs_catchup(at("2025-08-25T12:04:59Z"), interval, now));
        assert!(needs_catchup(at("2025-08-25T11:00:00Z"), interval, now));
    }

    #[test]
    fn renewal_runs_at_half_ttl_with_a_floor() {
        assert_eq!(
            renewal_period(Duration::seconds(120)),
            std::time::Duration::from_secs(60)
        );
        // tiny TTLs do not turn renewal into a busy loop
        assert_eq!(
            renewal_period(Duration::seconds(1)),
            std::time::Duration::from_secs(1)
        );
    }

    #[tokio::test]
    async fn tick_runs_a_cycle_under_the_lease_and_releases_it() {
        use crate::accrual::PositionRegistry;
        use crate::coordinator::CycleCoordinator;
        use crate::ledger::MemoryLedger;
        use crate::logging::AuditLogger;
        use crate::referral::{CommissionDistributor, CommissionTable, RatesHandle};
        use crate::types::{Amount, Currency, Rate};

        let ledger = Arc::new(MemoryLedger::new());
        ledger.insert_position(
            "pos-1",
            1,
            Currency::Uni,
            Amount::from_units(1000),
            Rate::from_ppm(10_000),
            Utc::now() - Duration::seconds(300),
        );

        let audit = AuditLogger::new("test".to_string());
        let registry = PositionRegistry::new(
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            Duration::seconds(60),
            100,
        );
        let distributor = CommissionDistributor::new(
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            RatesHandle::new(CommissionTable::default()),
            audit.clone(),
        );
        let coordinator = CycleCoordinator::new(
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            registry,
            distributor,
            audit,
            4,
        );
        let lease = TrackLease::new(
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            Track::Uni,
            "inst-1".to_string(),
            Duration::seconds(120),
        );
        let scheduler = EpochScheduler::new(
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            coordinator,
            lease,
            Track::Uni,
            Duration::seconds(300),
            0,
        );

        let intended = Utc::now();
        scheduler.tick(intended).await;

        assert_eq!(ledger.entries().len(), 1);
        let state = ledger.track_state(Track::Uni).await.unwrap().unwrap();
        assert_eq!(state.cycles_run, 1);
        assert_eq!(state.last_intended_at, intended);

        // lease released, free for another instance
        assert!(ledger
            .acquire_lease(Track::Uni, "inst-2", Duration::seconds(60))
            .await
            .unwrap());
    }
}
