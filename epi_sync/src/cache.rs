//! Lock-free, read-mostly holder of the current [`Snapshot`].
//!
//! Readers call [`SnapshotCache::read`], which is one atomic load of an
//! `Arc<Snapshot>`; it never waits on a publish. The refresh scheduler calls
//! [`SnapshotCache::publish`] to swap in a fully built replacement.
//!
//! Implementation notes:
//! - Uses `arc-swap` for atomic pointer swaps + cheap reads (no RwLock).
//! - Starts empty; until the first publish, reads return [`NotInitialized`].
//! - Publishing is a compare-and-swap loop keyed on the generation: the higher
//!   generation always wins, and a stale publish is a reported no-op.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use thiserror::Error;
use tracing::warn;

use crate::model::{Generation, Snapshot};

/// The cache has not seen a successful publish yet. This is a pending state,
/// not an empty dataset.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("dataset not yet initialized")]
pub struct NotInitialized;

/// Result of [`SnapshotCache::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The snapshot is now current.
    Published {
        /// Generation that was replaced, if any.
        previous: Option<Generation>,
        /// Generation now visible.
        current: Generation,
    },
    /// Rejected: the cache already holds this or a newer generation.
    Stale {
        /// Generation that stays visible.
        current: Generation,
        /// Generation that was offered.
        offered: Generation,
    },
}

impl PublishOutcome {
    /// True if the offered snapshot became current.
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published { .. })
    }
}

/// Holds exactly one current snapshot.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    current: ArcSwapOption<Snapshot>,
}

impl SnapshotCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot.
    ///
    /// Fast path: one atomic load. The returned `Arc` stays valid (and
    /// unchanged) for as long as the caller holds it, whatever gets published
    /// meanwhile.
    pub fn read(&self) -> Result<Arc<Snapshot>, NotInitialized> {
        self.current.load_full().ok_or(NotInitialized)
    }

    /// Generation of the current snapshot, if any.
    pub fn generation(&self) -> Option<Generation> {
        let guard = self.current.load();
        (*guard).as_ref().map(|s| s.generation())
    }

    /// Makes `snapshot` current unless the cache already holds the same or a
    /// newer generation.
    ///
    /// Readers are never blocked: they keep seeing the previous snapshot until
    /// the swap lands, then the new one. Racing publishers retry the CAS
    /// against whatever won, so the outcome is "highest generation wins".
    pub fn publish(&self, snapshot: Arc<Snapshot>) -> PublishOutcome {
        let offered = snapshot.generation();
        let mut seen = self.current.load();
        loop {
            let previous = (*seen).as_ref().map(|s| s.generation());
            if let Some(current) = previous
                && offered <= current
            {
                warn!(%current, %offered, "rejected stale snapshot publish");
                return PublishOutcome::Stale { current, offered };
            }

            let swapped = self
                .current
                .compare_and_swap(&seen, Some(Arc::clone(&snapshot)));
            if same_slot(&swapped, &seen) {
                return PublishOutcome::Published {
                    previous,
                    current: offered,
                };
            }
            // Someone else published first; re-check against their snapshot.
            seen = swapped;
        }
    }
}

fn same_slot(a: &Option<Arc<Snapshot>>, b: &Option<Arc<Snapshot>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
