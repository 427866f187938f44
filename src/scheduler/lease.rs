//! Track lease
//!
//! One lease per track guarantees at most one live cycle runner per track
//! across instances. The lease is taken per cycle and released when the
//! cycle completes; a crashed holder's lease simply expires. Idempotent
//! epoch keys are the real correctness guarantee, the lease only avoids
//! wasted duplicate work.

use chrono::Duration;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::debug;

use crate::ledger::Ledger;
use crate::types::{Result, Track};

/// Handle for one track's lease, bound to this instance's holder id
#[derive(Clone)]
pub struct TrackLease {
    ledger: Arc<dyn Ledger>,
    track: Track,
    holder: String,
    ttl: Duration,
}

impl TrackLease {
    pub fn new(ledger: Arc<dyn Ledger>, track: Track, holder: String, ttl: Duration) -> Self {
        Self {
            ledger,
            track,
            holder,
            ttl,
        }
    }

    /// Try to take the lease; false means another live instance holds it
    pub async fn try_acquire(&self) -> Result<bool> {
        let acquired = self
            .ledger
            .acquire_lease(self.track, &self.holder, self.ttl)
            .await?;
        if !acquired {
            debug!(track = %self.track, holder = %self.holder, "Track lease held elsewhere, skipping tick");
        }
        Ok(acquired)
    }

    /// Extend a held lease; the scheduler calls this at half-TTL cadence
    /// while a cycle outlives the lease
    pub async fn renew(&self) -> Result<bool> {
        self.ledger
            .renew_lease(self.track, &self.holder, self.ttl)
            .await
    }

    /// Release the lease if we still hold it
    pub async fn release(&self) -> Result<()> {
        self.ledger.release_lease(self.track, &self.holder).await
    }

    pub fn track(&self) -> Track {
        self.track
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

/// Random startup offset so co-deployed instances do not race for the
/// lease on the exact same tick boundary
pub fn acquire_jitter(max_ms: u64) -> StdDuration {
    if max_ms == 0 {
        return StdDuration::ZERO;
    }
    StdDuration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;

    #[tokio::test]
    async fn lease_round_trip_against_competitor() {
        let ledger = Arc::new(MemoryLedger::new());
        let ttl = Duration::seconds(60);
        let a = TrackLease::new(Arc::clone(&ledger) as Arc<dyn Ledger>, Track::Uni, "a".into(), ttl);
        let b = TrackLease::new(ledger, Track::Uni, "b".into(), ttl);

        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());
        assert!(a.renew().await.unwrap());
        assert!(!b.renew().await.unwrap());

        a.release().await.unwrap();
        assert!(b.try_acquire().await.unwrap());
    }

    #[test]
    fn jitter_stays_within_bound() {
        assert_eq!(acquire_jitter(0), StdDuration::ZERO);
        for _ in 0..50 {
            assert!(acquire_jitter(200) < StdDuration::from_millis(200));
        }
    }
}
