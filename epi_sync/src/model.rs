//! Canonical in-memory model of one published dataset.
//!
//! Everything here is immutable once a [`Snapshot`] is built: the normalizer
//! produces the whole tree (records, buckets, totals) up front and the cache
//! only ever hands out shared references to it.

use std::{borrow::Borrow, fmt, ops::AddAssign, sync::Arc};

use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::bucket::Granularity;

/// Strictly increasing publish counter. The first published snapshot is 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(u64);

impl Generation {
    /// Generation of the very first snapshot a fresh deployment publishes.
    pub const FIRST: Generation = Generation(1);

    /// Wraps a raw counter value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw counter value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The generation that follows this one.
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable region identifier, normalized to trimmed upper case ("za" -> "ZA").
///
/// Cheap to clone; records use it as their back-reference to [`Country`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CountryCode(Arc<str>);

impl CountryCode {
    /// Normalizes `raw`. Returns `None` when nothing is left after trimming.
    pub fn parse(raw: &str) -> Option<Self> {
        let code = raw.trim().to_uppercase();
        if code.is_empty() {
            None
        } else {
            Some(Self(code.into()))
        }
    }

    /// The normalized code.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CountryCode {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Latitude/longitude in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// -90..=90
    pub latitude: f64,
    /// -180..=180
    pub longitude: f64,
}

/// A geographic/administrative region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Country {
    /// Stable code.
    pub code: CountryCode,
    /// Display name.
    pub name: String,
    /// Optional centroid.
    pub location: Option<GeoPoint>,
}

/// Confirmed / recovered / deceased counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    /// Confirmed cases.
    pub confirmed: u64,
    /// Recoveries.
    pub recovered: u64,
    /// Deaths.
    pub deceased: u64,
}

impl AddAssign for Counts {
    fn add_assign(&mut self, rhs: Self) {
        self.confirmed = self.confirmed.saturating_add(rhs.confirmed);
        self.recovered = self.recovered.saturating_add(rhs.recovered);
        self.deceased = self.deceased.saturating_add(rhs.deceased);
    }
}

/// One day of observations for one country.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryRecord {
    /// Back-reference to the owning [`Country`].
    pub country: CountryCode,
    /// Calendar day of the observation.
    pub date: NaiveDate,
    /// Counts observed on `date`.
    pub counts: Counts,
}

/// Precomputed aggregate over a contiguous calendar range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Day, week or month.
    pub granularity: Granularity,
    /// First calendar day covered (inclusive).
    pub start: NaiveDate,
    /// Last calendar day covered (inclusive).
    pub end: NaiveDate,
    /// Sum of the daily counts that fall inside the range.
    pub counts: Counts,
    /// Number of daily records summed.
    pub observations: u32,
    /// Number of countries contributing (always 1 for a per-country bucket).
    pub countries: u32,
}

/// Buckets for every [`Granularity`], each list ordered by `start`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buckets {
    /// Daily buckets.
    pub day: Vec<Bucket>,
    /// Monday-aligned weekly buckets.
    pub week: Vec<Bucket>,
    /// Calendar-month buckets.
    pub month: Vec<Bucket>,
}

impl Buckets {
    /// Buckets of one granularity.
    pub fn get(&self, granularity: Granularity) -> &[Bucket] {
        match granularity {
            Granularity::Day => &self.day,
            Granularity::Week => &self.week,
            Granularity::Month => &self.month,
        }
    }

    pub(crate) fn get_mut(&mut self, granularity: Granularity) -> &mut Vec<Bucket> {
        match granularity {
            Granularity::Day => &mut self.day,
            Granularity::Week => &mut self.week,
            Granularity::Month => &mut self.month,
        }
    }

    /// Buckets of `granularity` overlapping `range`.
    pub fn in_range(&self, granularity: Granularity, range: DateRange) -> &[Bucket] {
        let all = self.get(granularity);
        if range.is_empty() {
            return &[];
        }
        // Sorted by start and non-overlapping, so ends are sorted too.
        let lo = match range.start {
            Some(start) => all.partition_point(|b| b.end < start),
            None => 0,
        };
        let hi = match range.end {
            Some(end) => all.partition_point(|b| b.start <= end),
            None => all.len(),
        };
        if lo >= hi { &[] } else { &all[lo..hi] }
    }
}

/// All data for one country inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountrySeries {
    /// Country metadata.
    pub country: Country,
    /// Records ordered by date, one per date.
    pub records: Vec<CountryRecord>,
    /// Per-country buckets.
    pub buckets: Buckets,
    /// Sum over all records.
    pub totals: Counts,
}

impl CountrySeries {
    /// Records whose date lies in `range`.
    pub fn records_in(&self, range: DateRange) -> &[CountryRecord] {
        if range.is_empty() {
            return &[];
        }
        let lo = match range.start {
            Some(start) => self.records.partition_point(|r| r.date < start),
            None => 0,
        };
        let hi = match range.end {
            Some(end) => self.records.partition_point(|r| r.date <= end),
            None => self.records.len(),
        };
        if lo >= hi { &[] } else { &self.records[lo..hi] }
    }
}

/// Normalized content of one payload: everything except publish metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Countries keyed by code, iterated in code order.
    pub countries: IndexMap<CountryCode, CountrySeries>,
    /// Buckets summed across all countries.
    pub global: Buckets,
    /// Sum over every record of every country.
    pub totals: Counts,
}

/// The atomic unit of visibility.
///
/// Fields are private: a snapshot is built once and then only read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    generation: Generation,
    fetched_at: DateTime<Utc>,
    data: Dataset,
}

impl Snapshot {
    /// Stamps a dataset with its publish metadata.
    pub fn new(generation: Generation, fetched_at: DateTime<Utc>, data: Dataset) -> Self {
        Self {
            generation,
            fetched_at,
            data,
        }
    }

    /// Publish order of this snapshot.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// When the payload behind this snapshot was fetched.
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// The normalized content.
    pub fn data(&self) -> &Dataset {
        &self.data
    }

    /// Looks up one country.
    pub fn country(&self, code: &str) -> Option<&CountrySeries> {
        self.data.countries.get(code)
    }

    /// Same content, different generation. Used when a restored archive entry
    /// is re-published.
    pub fn with_generation(self, generation: Generation) -> Self {
        Self { generation, ..self }
    }
}

/// Inclusive calendar window; either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    /// First day included, `None` for unbounded.
    pub start: Option<NaiveDate>,
    /// Last day included, `None` for unbounded.
    pub end: Option<NaiveDate>,
}

impl DateRange {
    /// Every date.
    pub const fn all() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    /// `start..=end`. An inverted window matches nothing.
    pub const fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// `start..`
    pub const fn from(start: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    /// `..=end`
    pub const fn until(end: NaiveDate) -> Self {
        Self {
            start: None,
            end: Some(end),
        }
    }

    /// True for an inverted window.
    pub fn is_empty(&self) -> bool {
        matches!((self.start, self.end), (Some(s), Some(e)) if s > e)
    }

    /// Whether `date` falls inside the window.
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.is_none_or(|s| date >= s) && self.end.is_none_or(|e| date <= e)
    }
}
