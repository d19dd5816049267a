//! Read-only queries over the current snapshot.
//!
//! Every call captures the cache's current `Arc<Snapshot>` once and answers
//! entirely from it, so a publish landing mid-call is never half observed.
//! Callers that need several reads from the same snapshot take a
//! [`SnapshotView`] via [`QueryFacade::view`].
//!
//! Unknown country codes and windows outside the data yield empty results.
//! [`NotInitialized`] is reserved for "nothing published yet".

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    bucket::Granularity,
    cache::{NotInitialized, SnapshotCache},
    model::{Bucket, Country, CountryCode, CountryRecord, Counts, DateRange, Generation, Snapshot},
};

/// Which buckets to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketScope<'a> {
    /// One country, by code (case-insensitive).
    Country(&'a str),
    /// Summed over every country.
    Global,
}

/// Identity of the snapshot answering queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotStatus {
    /// Publish order.
    pub generation: Generation,
    /// When the payload was fetched.
    pub fetched_at: DateTime<Utc>,
    /// Number of countries.
    pub countries: usize,
}

/// Query entry point for protocol layers.
#[derive(Debug, Clone)]
pub struct QueryFacade {
    cache: Arc<SnapshotCache>,
}

impl QueryFacade {
    /// Façade reading from `cache`.
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self { cache }
    }

    /// Pins the current snapshot for a multi-step resolution.
    pub fn view(&self) -> Result<SnapshotView, NotInitialized> {
        self.cache.read().map(SnapshotView::new)
    }

    /// All countries, ordered by code.
    pub fn countries(&self) -> Result<Vec<Country>, NotInitialized> {
        Ok(self.view()?.countries().cloned().collect())
    }

    /// One country's metadata.
    pub fn country(&self, code: &str) -> Result<Option<Country>, NotInitialized> {
        Ok(self.view()?.country(code).cloned())
    }

    /// Records of `code` inside `range`, ordered by date.
    pub fn records(&self, code: &str, range: DateRange) -> Result<Vec<CountryRecord>, NotInitialized> {
        Ok(self.view()?.records(code, range).to_vec())
    }

    /// Buckets of `granularity` overlapping `range`, ordered by start.
    pub fn buckets(
        &self,
        scope: BucketScope<'_>,
        granularity: Granularity,
        range: DateRange,
    ) -> Result<Vec<Bucket>, NotInitialized> {
        Ok(self.view()?.buckets(scope, granularity, range).to_vec())
    }

    /// Counts summed over the whole snapshot. Zero for an unknown country.
    pub fn totals(&self, scope: BucketScope<'_>) -> Result<Counts, NotInitialized> {
        Ok(self.view()?.totals(scope))
    }

    /// Which snapshot is being served.
    pub fn status(&self) -> Result<SnapshotStatus, NotInitialized> {
        Ok(self.view()?.status())
    }
}

/// Borrow-based reads against one pinned snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotView {
    snapshot: Arc<Snapshot>,
}

fn normalized(code: &str) -> Option<CountryCode> {
    CountryCode::parse(code)
}

impl SnapshotView {
    /// View over `snapshot`.
    pub fn new(snapshot: Arc<Snapshot>) -> Self {
        Self { snapshot }
    }

    /// The pinned snapshot.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Countries ordered by code.
    pub fn countries(&self) -> impl Iterator<Item = &Country> {
        self.snapshot.data().countries.values().map(|s| &s.country)
    }

    /// One country's metadata.
    pub fn country(&self, code: &str) -> Option<&Country> {
        let code = normalized(code)?;
        self.snapshot.country(code.as_str()).map(|s| &s.country)
    }

    /// Records of `code` inside `range`.
    pub fn records(&self, code: &str, range: DateRange) -> &[CountryRecord] {
        normalized(code)
            .and_then(|code| self.snapshot.country(code.as_str()))
            .map(|s| s.records_in(range))
            .unwrap_or_default()
    }

    /// Buckets for `scope` overlapping `range`.
    pub fn buckets(&self, scope: BucketScope<'_>, granularity: Granularity, range: DateRange) -> &[Bucket] {
        match scope {
            BucketScope::Global => self.snapshot.data().global.in_range(granularity, range),
            BucketScope::Country(code) => normalized(code)
                .and_then(|code| self.snapshot.country(code.as_str()))
                .map(|s| s.buckets.in_range(granularity, range))
                .unwrap_or_default(),
        }
    }

    /// Summed counts for `scope`.
    pub fn totals(&self, scope: BucketScope<'_>) -> Counts {
        match scope {
            BucketScope::Global => self.snapshot.data().totals,
            BucketScope::Country(code) => normalized(code)
                .and_then(|code| self.snapshot.country(code.as_str()))
                .map(|s| s.totals)
                .unwrap_or_default(),
        }
    }

    /// Identity of the pinned snapshot.
    pub fn status(&self) -> SnapshotStatus {
        SnapshotStatus {
            generation: self.snapshot.generation(),
            fetched_at: self.snapshot.fetched_at(),
            countries: self.snapshot.data().countries.len(),
        }
    }
}
