//! Calendar bucket mapping for daily records.
//!
//! - One stable epoch: Unix (1970-01-01), counted in whole days.
//! - Day: one bucket per calendar day.
//! - Week: Monday-aligned, using a week epoch of Monday 1969-12-29.
//! - Month: linear (year, month) indexing relative to 1970-01.
//!
//! Ids are signed so dates before 1970 map cleanly.

use std::{fmt, str::FromStr};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Bucket, Buckets, CountryRecord, Counts};

/// `NaiveDate::num_days_from_ce` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;

/// shift so Monday 1969-12-29 becomes week index 0
const WEEK_MONDAY_ANCHOR_OFFSET_DAYS: i64 = 3;

/// Bucket granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// calendar day
    Day,
    /// Monday-based week
    Week,
    /// calendar month
    Month,
}

impl Granularity {
    /// Every granularity, finest first. All of them are precomputed.
    pub const ALL: [Granularity; 3] = [Granularity::Day, Granularity::Week, Granularity::Month];
}

/// Unknown granularity name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown granularity {0:?} (expected day, week or month)")]
pub struct UnknownGranularity(pub String);

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        })
    }
}

/// Accepts `day`/`week`/`month` (any case) and the short forms `D`/`W`/`M`.
impl FromStr for Granularity {
    type Err = UnknownGranularity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "D" => return Ok(Granularity::Day),
            "W" => return Ok(Granularity::Week),
            "M" => return Ok(Granularity::Month),
            _ => {}
        }
        match s.trim().to_lowercase().as_str() {
            "day" | "daily" => Ok(Granularity::Day),
            "week" | "weekly" => Ok(Granularity::Week),
            "month" | "monthly" => Ok(Granularity::Month),
            _ => Err(UnknownGranularity(s.to_string())),
        }
    }
}

fn days_since_epoch(date: NaiveDate) -> i64 {
    i64::from(date.num_days_from_ce()) - UNIX_EPOCH_DAYS_FROM_CE
}

fn date_from_epoch_days(days: i64) -> Option<NaiveDate> {
    let from_ce = i32::try_from(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?).ok()?;
    NaiveDate::from_num_days_from_ce_opt(from_ce)
}

/// Compute the bucket id of a calendar day.
pub fn bucket_id(date: NaiveDate, granularity: Granularity) -> i64 {
    match granularity {
        Granularity::Day => days_since_epoch(date),
        Granularity::Week => (days_since_epoch(date) + WEEK_MONDAY_ANCHOR_OFFSET_DAYS).div_euclid(7),
        Granularity::Month => {
            (i64::from(date.year()) - 1970) * 12 + i64::from(date.month0())
        }
    }
}

/// First day of a bucket. `None` only outside chrono's date range.
pub fn bucket_start(id: i64, granularity: Granularity) -> Option<NaiveDate> {
    match granularity {
        Granularity::Day => date_from_epoch_days(id),
        Granularity::Week => {
            date_from_epoch_days(id.checked_mul(7)? - WEEK_MONDAY_ANCHOR_OFFSET_DAYS)
        }
        Granularity::Month => {
            let year = i32::try_from(1970 + id.div_euclid(12)).ok()?;
            let month = u32::try_from(id.rem_euclid(12) + 1).ok()?;
            NaiveDate::from_ymd_opt(year, month, 1)
        }
    }
}

/// Last day of a bucket (inclusive).
pub fn bucket_end(id: i64, granularity: Granularity) -> Option<NaiveDate> {
    // widths vary for months: take the day before the next bucket
    bucket_start(id.checked_add(1)?, granularity)?.pred_opt()
}

/// Calendar bounds of the bucket containing `date`.
pub fn bounds_of(date: NaiveDate, granularity: Granularity) -> Option<(NaiveDate, NaiveDate)> {
    let id = bucket_id(date, granularity);
    Some((bucket_start(id, granularity)?, bucket_end(id, granularity)?))
}

/// Aggregates date-ordered records of one country into buckets of every
/// granularity. Returns `None` if a bucket boundary falls outside chrono's
/// representable range.
pub(crate) fn country_buckets(records: &[CountryRecord]) -> Option<Buckets> {
    let mut out = Buckets::default();
    for granularity in Granularity::ALL {
        let list = out.get_mut(granularity);
        let mut current: Option<(i64, Bucket)> = None;
        for record in records {
            let id = bucket_id(record.date, granularity);
            if let Some((open_id, bucket)) = current.as_mut()
                && *open_id == id
            {
                bucket.counts += record.counts;
                bucket.observations += 1;
                continue;
            }
            if let Some((_, done)) = current.take() {
                list.push(done);
            }
            current = Some((
                id,
                Bucket {
                    granularity,
                    start: bucket_start(id, granularity)?,
                    end: bucket_end(id, granularity)?,
                    counts: record.counts,
                    observations: 1,
                    countries: 1,
                },
            ));
        }
        if let Some((_, done)) = current {
            list.push(done);
        }
    }
    Some(out)
}

/// Sums per-country buckets into global buckets; buckets with the same
/// calendar range are merged and their `countries` counted.
pub(crate) fn merge_buckets<'a>(per_country: impl IntoIterator<Item = &'a Buckets>) -> Buckets {
    use std::collections::BTreeMap;

    let mut acc: [BTreeMap<NaiveDate, Bucket>; 3] = Default::default();
    for buckets in per_country {
        for (slot, granularity) in acc.iter_mut().zip(Granularity::ALL) {
            for bucket in buckets.get(granularity) {
                slot.entry(bucket.start)
                    .and_modify(|g| {
                        g.counts += bucket.counts;
                        g.observations += bucket.observations;
                        g.countries += 1;
                    })
                    .or_insert_with(|| bucket.clone());
            }
        }
    }

    let mut out = Buckets::default();
    for (slot, granularity) in acc.into_iter().zip(Granularity::ALL) {
        *out.get_mut(granularity) = slot.into_values().collect();
    }
    out
}

/// Sum of all record counts.
pub(crate) fn totals(records: &[CountryRecord]) -> Counts {
    let mut sum = Counts::default();
    for r in records {
        sum += r.counts;
    }
    sum
}

// -------------------- tests --------------------
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn week_is_monday_aligned() {
        // 2020-03-05 is a Thursday
        let (start, end) = bounds_of(d(2020, 3, 5), Granularity::Week).unwrap();
        assert_eq!(start, d(2020, 3, 2));
        assert_eq!(end, d(2020, 3, 8));
        // pre-epoch dates still land on Mondays
        let (start, _) = bounds_of(d(1969, 12, 31), Granularity::Week).unwrap();
        assert_eq!(start, d(1969, 12, 29));
    }

    #[test]
    fn month_bounds_and_leap_day() {
        let (start, end) = bounds_of(d(2024, 2, 29), Granularity::Month).unwrap();
        assert_eq!(start, d(2024, 2, 1));
        assert_eq!(end, d(2024, 2, 29));
        let (start, end) = bounds_of(d(2020, 12, 15), Granularity::Month).unwrap();
        assert_eq!((start, end), (d(2020, 12, 1), d(2020, 12, 31)));
    }

    #[test]
    fn day_bucket_is_the_day() {
        assert_eq!(bucket_id(d(1970, 1, 1), Granularity::Day), 0);
        assert_eq!(bounds_of(d(2021, 7, 4), Granularity::Day), Some((d(2021, 7, 4), d(2021, 7, 4))));
    }

    #[test]
    fn parses_granularity_names() {
        assert_eq!("Weekly".parse::<Granularity>(), Ok(Granularity::Week));
        assert_eq!("M".parse::<Granularity>(), Ok(Granularity::Month));
        assert_eq!("m".parse::<Granularity>().ok(), None);
        assert!("fortnight".parse::<Granularity>().is_err());
    }

    proptest! {
        #[test]
        fn bucket_contains_its_date(days in -40_000i64..80_000, g in 0usize..3) {
            let granularity = Granularity::ALL[g];
            let date = date_from_epoch_days(days).unwrap();
            let id = bucket_id(date, granularity);
            let (start, end) = bounds_of(date, granularity).unwrap();
            prop_assert!(start <= date && date <= end);
            prop_assert_eq!(bucket_id(start, granularity), id);
            prop_assert_eq!(bucket_id(end, granularity), id);
            prop_assert_eq!(bucket_id(end.succ_opt().unwrap(), granularity), id + 1);
        }
    }
}
