//! Refresh scheduler: fetch -> parse -> publish -> archive, on a fixed cadence.
//!
//! ## Cycle
//! `Idle -> Fetching -> Parsing -> Publishing -> Idle`. A transport or parse
//! failure moves to `Backoff` and the same cycle is retried after an
//! exponential delay, indefinitely. The cache is only ever touched by a
//! successful publish, so the last good snapshot stays visible through any
//! run of failures.
//!
//! ## Archive
//! The archive save happens after the publish and cannot undo it. A failed
//! save is logged and flagged as `archive_degraded` in [`RefreshStatus`].
//!
//! ## Cancellation
//! The token aborts an in-flight fetch or parse (the parse result is
//! dropped unseen) and any backoff sleep. An archive save that has started is
//! allowed to finish so no half-written entry is left behind.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use epi_source::{DataSource, TransportError};
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{MissedTickBehavior, interval, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    archive::{ArchiveEntry, ArchiveWriter},
    backoff::Backoff,
    cache::{PublishOutcome, SnapshotCache},
    clock::{Clock, SystemClock},
    model::{Generation, Snapshot},
    normalize::{ParseError, normalize},
};

/// Default refresh cadence.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Where the scheduler currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshState {
    /// Waiting for the next tick.
    #[default]
    Idle,
    /// Waiting on the source.
    Fetching,
    /// Normalizing the payload.
    Parsing,
    /// Swapping the snapshot in and archiving it.
    Publishing,
    /// Waiting to retry after a failure.
    Backoff {
        /// Failed attempts so far in this cycle.
        attempt: u32,
        /// Delay before the next attempt.
        delay: Duration,
    },
}

impl fmt::Display for RefreshState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshState::Idle => f.write_str("idle"),
            RefreshState::Fetching => f.write_str("fetching"),
            RefreshState::Parsing => f.write_str("parsing"),
            RefreshState::Publishing => f.write_str("publishing"),
            RefreshState::Backoff { attempt, delay } => {
                write!(f, "backoff (attempt {attempt}, retry in {delay:?})")
            }
        }
    }
}

/// Observable health of the scheduler, broadcast on a watch channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshStatus {
    /// Current state.
    pub state: RefreshState,
    /// Failed attempts since the last success.
    pub consecutive_failures: u32,
    /// Fetch time of the last published snapshot.
    pub last_success: Option<DateTime<Utc>>,
    /// Text of the most recent failure, cleared on success.
    pub last_error: Option<String>,
    /// Generation of the last snapshot this scheduler published.
    pub generation: Option<Generation>,
    /// The last archive save failed; durability is degraded until one succeeds.
    pub archive_degraded: bool,
}

/// A refresh attempt that did not publish.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// Source could not be reached or answered with an error.
    #[error("fetch failed: {0}")]
    Transport(#[from] TransportError),
    /// Payload was malformed.
    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),
    /// The parse task panicked.
    #[error("parse task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    /// Shutdown was requested mid-cycle.
    #[error("refresh cancelled")]
    Cancelled,
}

/// What happened to the archive copy of a cycle's snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// No archive configured.
    Disabled,
    /// The publish was stale, so nothing was archived.
    Skipped,
    /// Stored.
    Saved(ArchiveEntry),
    /// Save failed; the published snapshot stays.
    Failed(String),
}

/// Result of one successful fetch/parse/publish pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Cache outcome.
    pub publish: PublishOutcome,
    /// Archive outcome.
    pub archive: ArchiveOutcome,
    /// Fetch time stamped on the snapshot.
    pub fetched_at: DateTime<Utc>,
    /// Payload size.
    pub payload_bytes: usize,
    /// Countries in the new snapshot.
    pub countries: usize,
}

/// Drives refresh cycles against one source and one cache.
pub struct RefreshScheduler {
    source: Arc<dyn DataSource>,
    cache: Arc<SnapshotCache>,
    archive: Option<ArchiveWriter>,
    interval: Duration,
    backoff: Backoff,
    clock: Arc<dyn Clock>,
    generation_floor: Generation,
    status: watch::Sender<RefreshStatus>,
}

impl fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("source", &self.source.describe())
            .field("archive", &self.archive)
            .field("interval", &self.interval)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl RefreshScheduler {
    /// Scheduler with the default interval and backoff, no archive.
    pub fn new(source: Arc<dyn DataSource>, cache: Arc<SnapshotCache>) -> Self {
        let (status, _) = watch::channel(RefreshStatus::default());
        Self {
            source,
            cache,
            archive: None,
            interval: DEFAULT_INTERVAL,
            backoff: Backoff::default(),
            clock: Arc::new(SystemClock),
            generation_floor: Generation::new(0),
            status,
        }
    }

    /// Time between cycle starts.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Retry delays.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Archive every published snapshot.
    pub fn with_archive(mut self, archive: ArchiveWriter) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Clock used for fetch timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Never issue a generation at or below `floor`. Set from the highest
    /// archived generation so a restart does not overwrite existing entries.
    pub fn with_generation_floor(mut self, floor: Generation) -> Self {
        self.generation_floor = floor;
        self
    }

    /// Receiver for status updates.
    pub fn subscribe(&self) -> watch::Receiver<RefreshStatus> {
        self.status.subscribe()
    }

    /// Latest status.
    pub fn status(&self) -> RefreshStatus {
        self.status.borrow().clone()
    }

    fn set_state(&self, state: RefreshState) {
        debug!(%state, "refresh state");
        self.status.send_modify(|s| s.state = state);
    }

    fn next_generation(&self) -> Generation {
        self.cache
            .generation()
            .unwrap_or(Generation::new(0))
            .max(self.generation_floor)
            .next()
    }

    /// Runs until `cancel` fires. The first cycle starts immediately.
    ///
    /// Spawn this as a tokio task.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            source = %self.source.describe(),
            interval_secs = self.interval.as_secs(),
            archive = self.archive.is_some(),
            "refresh scheduler started"
        );

        'ticks: loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'ticks,
                _ = ticker.tick() => {}
            }

            let mut attempt = 0u32;
            loop {
                match self.run_cycle(&cancel).await {
                    Ok(_) => break,
                    Err(RefreshError::Cancelled) => break 'ticks,
                    Err(e) => {
                        attempt = attempt.saturating_add(1);
                        let delay = self.backoff.next_delay(attempt);
                        warn!(
                            error = %e,
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            "refresh failed; keeping current snapshot"
                        );
                        self.record_failure(&e, RefreshState::Backoff { attempt, delay });

                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break 'ticks,
                            _ = sleep(delay) => {}
                        }
                    }
                }
            }
        }

        self.set_state(RefreshState::Idle);
        info!("refresh scheduler shutting down");
    }

    /// One fetch/parse/publish/archive pass without retry.
    ///
    /// On error the cache is untouched. `Err(Cancelled)` means `cancel` fired
    /// before the publish.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, RefreshError> {
        self.set_state(RefreshState::Fetching);
        let fetched_at = self.clock.now();
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RefreshError::Cancelled),
            fetched = self.source.fetch() => fetched?,
        };
        let payload_bytes = payload.len();
        debug!(bytes = payload_bytes, "fetched payload");

        self.set_state(RefreshState::Parsing);
        let generation = self.next_generation();
        let parse = tokio::task::spawn_blocking(move || normalize(&payload, generation, fetched_at));
        let snapshot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RefreshError::Cancelled),
            parsed = parse => parsed??,
        };
        let countries = snapshot.data().countries.len();

        self.set_state(RefreshState::Publishing);
        let snapshot = Arc::new(snapshot);
        let publish = self.cache.publish(Arc::clone(&snapshot));

        let archive = match publish {
            PublishOutcome::Stale { .. } => ArchiveOutcome::Skipped,
            PublishOutcome::Published { previous, current } => {
                info!(
                    generation = %current,
                    previous = ?previous.map(|g| g.get()),
                    countries,
                    "published snapshot"
                );
                self.archive_snapshot(&snapshot).await
            }
        };

        self.status.send_modify(|s| {
            s.state = RefreshState::Idle;
            s.consecutive_failures = 0;
            s.last_error = None;
            if publish.is_published() {
                s.last_success = Some(fetched_at);
                s.generation = Some(snapshot.generation());
            }
            match &archive {
                ArchiveOutcome::Saved(_) => s.archive_degraded = false,
                ArchiveOutcome::Failed(_) => s.archive_degraded = true,
                ArchiveOutcome::Disabled | ArchiveOutcome::Skipped => {}
            }
        });

        Ok(CycleReport {
            publish,
            archive,
            fetched_at,
            payload_bytes,
            countries,
        })
    }

    async fn archive_snapshot(&self, snapshot: &Snapshot) -> ArchiveOutcome {
        let Some(writer) = &self.archive else {
            return ArchiveOutcome::Disabled;
        };
        match writer.save(snapshot).await {
            Ok(entry) => ArchiveOutcome::Saved(entry),
            Err(e) => {
                error!(
                    generation = %snapshot.generation(),
                    store = %writer.store().describe(),
                    error = %e,
                    "archive save failed; snapshot stays published"
                );
                ArchiveOutcome::Failed(e.to_string())
            }
        }
    }

    fn record_failure(&self, e: &RefreshError, state: RefreshState) {
        self.status.send_modify(|s| {
            s.state = state;
            s.consecutive_failures = s.consecutive_failures.saturating_add(1);
            s.last_error = Some(e.to_string());
        });
    }
}
