//! Retention cleanup: periodically delete archive entries older than a horizon.
//!
//! Ages come from the fetch time embedded in each [`ArchiveKey`]; the blobs
//! are never read. One failing delete is logged and the rest of the cycle
//! carries on. This task never touches the snapshot cache.

use std::{fmt, sync::Arc, time::Duration};

use chrono::TimeDelta;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    archive::{ArchiveKey, ArchiveStore, StorageError},
    clock::{Clock, SystemClock},
};

/// Default cleanup cadence.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of one cleanup cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Entries listed.
    pub examined: usize,
    /// Entries removed (or already gone).
    pub deleted: usize,
    /// Entries within the horizon.
    pub kept: usize,
    /// Expired entries whose delete failed; retried next cycle.
    pub failed: usize,
}

impl fmt::Display for RetentionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "examined={} deleted={} kept={} failed={}",
            self.examined, self.deleted, self.kept, self.failed
        )
    }
}

/// Prunes one archive store on its own cadence.
pub struct RetentionScheduler {
    store: Arc<dyn ArchiveStore>,
    horizon: TimeDelta,
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RetentionScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetentionScheduler")
            .field("store", &self.store.describe())
            .field("horizon", &self.horizon)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl RetentionScheduler {
    /// Scheduler deleting entries older than `horizon`.
    pub fn new(store: Arc<dyn ArchiveStore>, horizon: Duration) -> Self {
        Self {
            store,
            horizon: TimeDelta::from_std(horizon).unwrap_or(TimeDelta::MAX),
            interval: DEFAULT_INTERVAL,
            clock: Arc::new(SystemClock),
        }
    }

    /// Time between cycles.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Clock used to compute ages.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Whether an entry with this key is past the horizon now.
    pub fn is_expired(&self, key: &ArchiveKey) -> bool {
        key.age(self.clock.now()) > self.horizon
    }

    /// Runs until `cancel` fires. The first cycle starts immediately.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            store = %self.store.describe(),
            horizon_secs = self.horizon.num_seconds(),
            interval_secs = self.interval.as_secs(),
            "retention scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("retention scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    // a listing failure only costs this cycle
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "retention cycle aborted: could not list archive");
                    }
                }
            }
        }
    }

    /// One pass: list, then delete every expired entry.
    ///
    /// `Err` only when the listing itself fails. Individual delete failures are
    /// counted in the report.
    pub async fn run_cycle(&self) -> Result<RetentionReport, StorageError> {
        let entries = self.store.list().await?;
        let now = self.clock.now();
        let mut report = RetentionReport {
            examined: entries.len(),
            ..RetentionReport::default()
        };

        for entry in entries {
            let age = entry.key.age(now);
            if age <= self.horizon {
                report.kept += 1;
                continue;
            }
            match self.store.delete(&entry.key).await {
                Ok(existed) => {
                    debug!(key = %entry.key, age_days = age.num_days(), existed, "deleted expired entry");
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "could not delete expired entry");
                    report.failed += 1;
                }
            }
        }

        info!(%report, "retention cycle finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{archive::memory::MemoryArchiveStore, clock::FixedClock, model::Generation};
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn entry_exactly_at_horizon_is_kept() {
        let now = Utc.with_ymd_and_hms(2021, 1, 31, 0, 0, 0).unwrap();
        let store = Arc::new(MemoryArchiveStore::new());
        let at_horizon = ArchiveKey::new(Generation::new(1), now - TimeDelta::days(30));
        let past = ArchiveKey::new(Generation::new(2), now - TimeDelta::days(30) - TimeDelta::seconds(1));
        store.put(&at_horizon, vec![1]).await.unwrap();
        store.put(&past, vec![2]).await.unwrap();

        let scheduler = RetentionScheduler::new(store.clone(), Duration::from_secs(30 * 86_400))
            .with_clock(Arc::new(FixedClock::new(now)));
        assert!(!scheduler.is_expired(&at_horizon));
        assert!(scheduler.is_expired(&past));

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.kept, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn empty_store_is_a_clean_cycle() {
        let scheduler = RetentionScheduler::new(Arc::new(MemoryArchiveStore::new()), Duration::from_secs(60));
        assert_eq!(scheduler.run_cycle().await.unwrap(), RetentionReport::default());
    }
}
