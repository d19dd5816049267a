//! Parser/normalizer: raw payload bytes -> [`Snapshot`].
//!
//! ## What this does
//! - Deserializes the flat `records` document published upstream.
//! - Validates every record (calendar date, non-negative counts, coordinates)
//!   and normalizes country codes (trim, upper case).
//! - Groups records per country, orders them by date and rejects duplicate
//!   `(country, date)` pairs instead of picking one.
//! - Precomputes day/week/month buckets per country and globally.
//!
//! The functions here are pure: no I/O, no shared state. The same bytes always
//! produce the same [`Dataset`]; publish metadata (generation, fetch time) is
//! supplied by the caller.

use std::collections::hash_map::{Entry, HashMap};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    bucket,
    model::{
        Country, CountryCode, CountryRecord, CountrySeries, Counts, Dataset, Generation, GeoPoint,
        Snapshot,
    },
};

/// Dates outside these years are rejected as implausible.
const MIN_YEAR: i32 = 1900;
const MAX_YEAR: i32 = 2200;

/// Why a payload could not be turned into a snapshot. Record indexes are
/// 0-based positions in the `records` array.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Not JSON, or not a document with a `records` array.
    #[error("payload is not a valid dataset document: {0}")]
    Json(#[from] serde_json::Error),

    /// An element of `records` is not a JSON object.
    #[error("record {record}: expected an object")]
    NotAnObject {
        /// Offending record.
        record: usize,
    },

    /// A required field is absent.
    #[error("record {record}: missing field {field}")]
    MissingField {
        /// Offending record.
        record: usize,
        /// Field name.
        field: &'static str,
    },

    /// A field holds a value of the wrong type.
    #[error("record {record}: invalid {field}: {source}")]
    InvalidField {
        /// Offending record.
        record: usize,
        /// Field name.
        field: &'static str,
        /// Decoder error for that field alone.
        source: serde_json::Error,
    },

    /// `date` is not a `YYYY-MM-DD` calendar day.
    #[error("record {record}: invalid date {value:?}")]
    InvalidDate {
        /// Offending record.
        record: usize,
        /// Raw value.
        value: String,
    },

    /// `date` parsed but is outside the accepted years.
    #[error("record {record}: date {date} is out of range")]
    DateOutOfRange {
        /// Offending record.
        record: usize,
        /// Parsed date.
        date: NaiveDate,
    },

    /// A count is negative.
    #[error("record {record}: {field} is negative ({value})")]
    NegativeCount {
        /// Offending record.
        record: usize,
        /// `confirmed`, `recovered` or `deceased`.
        field: &'static str,
        /// Raw value.
        value: i64,
    },

    /// A required text field is blank.
    #[error("record {record}: {field} is empty")]
    EmptyField {
        /// Offending record.
        record: usize,
        /// Field name.
        field: &'static str,
    },

    /// A coordinate is not finite or out of range.
    #[error("record {record}: {field} {value} is not a valid coordinate")]
    InvalidCoordinate {
        /// Offending record.
        record: usize,
        /// `latitude` or `longitude`.
        field: &'static str,
        /// Raw value.
        value: f64,
    },

    /// Only one of latitude/longitude is present.
    #[error("record {record}: latitude and longitude must be given together")]
    PartialCoordinates {
        /// Offending record.
        record: usize,
    },

    /// Records of one country disagree on its metadata.
    #[error("record {record}: {field} of {code} conflicts with record {first}")]
    ConflictingCountry {
        /// Offending record.
        record: usize,
        /// First record that introduced the country.
        first: usize,
        /// Country code.
        code: CountryCode,
        /// `country` or `location`.
        field: &'static str,
    },

    /// Two records for the same country and date.
    #[error("records {first} and {second}: duplicate entry for {code} on {date}")]
    DuplicateRecord {
        /// Country code.
        code: CountryCode,
        /// Duplicated day.
        date: NaiveDate,
        /// Earlier record.
        first: usize,
        /// Later record.
        second: usize,
    },
}

// Records stay untyped here so a bad field can be reported with its index.
#[derive(Debug, Deserialize)]
struct RawDocument {
    records: Vec<Value>,
}

#[derive(Debug)]
struct RawRecord {
    date: String,
    country_code: String,
    country: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    confirmed: i64,
    recovered: i64,
    deceased: i64,
}

impl RawRecord {
    fn decode(record: usize, value: Value) -> Result<Self, ParseError> {
        let Value::Object(mut fields) = value else {
            return Err(ParseError::NotAnObject { record });
        };
        Ok(Self {
            date: required(&mut fields, record, "date")?,
            country_code: required(&mut fields, record, "countryCode")?,
            country: required(&mut fields, record, "country")?,
            latitude: optional(&mut fields, record, "latitude")?,
            longitude: optional(&mut fields, record, "longitude")?,
            confirmed: required(&mut fields, record, "confirmed")?,
            recovered: required(&mut fields, record, "recovered")?,
            deceased: required(&mut fields, record, "deceased")?,
        })
    }
}

fn required<T: DeserializeOwned>(
    fields: &mut Map<String, Value>,
    record: usize,
    field: &'static str,
) -> Result<T, ParseError> {
    let value = fields
        .remove(field)
        .ok_or(ParseError::MissingField { record, field })?;
    serde_json::from_value(value).map_err(|source| ParseError::InvalidField {
        record,
        field,
        source,
    })
}

/// Absent and `null` both read as `None`.
fn optional<T: DeserializeOwned>(
    fields: &mut Map<String, Value>,
    record: usize,
    field: &'static str,
) -> Result<Option<T>, ParseError> {
    match fields.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| ParseError::InvalidField {
                record,
                field,
                source,
            }),
    }
}

struct Pending {
    country: Country,
    first_record: usize,
    // (date, counts, record index)
    rows: Vec<(NaiveDate, Counts, usize)>,
}

/// Parses `payload` and stamps the result with publish metadata.
pub fn normalize(
    payload: &[u8],
    generation: Generation,
    fetched_at: DateTime<Utc>,
) -> Result<Snapshot, ParseError> {
    Ok(Snapshot::new(generation, fetched_at, parse_dataset(payload)?))
}

/// Parses and validates `payload` into a fully derived [`Dataset`].
pub fn parse_dataset(payload: &[u8]) -> Result<Dataset, ParseError> {
    let doc: RawDocument = serde_json::from_slice(payload)?;

    let mut pending: HashMap<CountryCode, Pending> = HashMap::new();
    for (idx, value) in doc.records.into_iter().enumerate() {
        let raw = RawRecord::decode(idx, value)?;
        let date = parse_date(idx, &raw.date)?;
        let counts = Counts {
            confirmed: non_negative(idx, "confirmed", raw.confirmed)?,
            recovered: non_negative(idx, "recovered", raw.recovered)?,
            deceased: non_negative(idx, "deceased", raw.deceased)?,
        };
        let code = CountryCode::parse(&raw.country_code).ok_or(ParseError::EmptyField {
            record: idx,
            field: "countryCode",
        })?;
        let name = raw.country.trim();
        if name.is_empty() {
            return Err(ParseError::EmptyField {
                record: idx,
                field: "country",
            });
        }
        let location = location(idx, raw.latitude, raw.longitude)?;

        match pending.entry(code) {
            Entry::Occupied(mut slot) => {
                let known = &slot.get().country;
                let field = if known.name != name {
                    Some("country")
                } else if known.location != location {
                    Some("location")
                } else {
                    None
                };
                if let Some(field) = field {
                    return Err(ParseError::ConflictingCountry {
                        record: idx,
                        first: slot.get().first_record,
                        code: slot.key().clone(),
                        field,
                    });
                }
                slot.get_mut().rows.push((date, counts, idx));
            }
            Entry::Vacant(slot) => {
                let country = Country {
                    code: slot.key().clone(),
                    name: name.to_string(),
                    location,
                };
                slot.insert(Pending {
                    country,
                    first_record: idx,
                    rows: vec![(date, counts, idx)],
                });
            }
        }
    }

    // Code order keeps iteration and error reporting deterministic.
    let mut ordered: Vec<Pending> = pending.into_values().collect();
    ordered.sort_by(|a, b| a.country.code.cmp(&b.country.code));

    let mut countries = IndexMap::with_capacity(ordered.len());
    let mut totals = Counts::default();
    for mut p in ordered {
        p.rows.sort_by_key(|&(date, _, idx)| (date, idx));
        if let Some(pair) = p.rows.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(ParseError::DuplicateRecord {
                code: p.country.code.clone(),
                date: pair[0].0,
                first: pair[0].2,
                second: pair[1].2,
            });
        }

        let first_date = p.rows[0].0;
        let records: Vec<CountryRecord> = p
            .rows
            .into_iter()
            .map(|(date, counts, _)| CountryRecord {
                country: p.country.code.clone(),
                date,
                counts,
            })
            .collect();
        // Dates are bounded by MIN_YEAR/MAX_YEAR, so bucket bounds always exist.
        let buckets = bucket::country_buckets(&records).ok_or(ParseError::DateOutOfRange {
            record: p.first_record,
            date: first_date,
        })?;
        let series_totals = bucket::totals(&records);
        totals += series_totals;

        countries.insert(
            p.country.code.clone(),
            CountrySeries {
                country: p.country,
                records,
                buckets,
                totals: series_totals,
            },
        );
    }

    let global = bucket::merge_buckets(countries.values().map(|s: &CountrySeries| &s.buckets));
    Ok(Dataset {
        countries,
        global,
        totals,
    })
}

fn parse_date(record: usize, raw: &str) -> Result<NaiveDate, ParseError> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        ParseError::InvalidDate {
            record,
            value: raw.to_string(),
        }
    })?;
    if !(MIN_YEAR..=MAX_YEAR).contains(&date.year()) {
        return Err(ParseError::DateOutOfRange { record, date });
    }
    Ok(date)
}

fn non_negative(record: usize, field: &'static str, value: i64) -> Result<u64, ParseError> {
    u64::try_from(value).map_err(|_| ParseError::NegativeCount {
        record,
        field,
        value,
    })
}

fn location(
    record: usize,
    latitude: Option<f64>,
    longitude: Option<f64>,
) -> Result<Option<GeoPoint>, ParseError> {
    match (latitude, longitude) {
        (None, None) => Ok(None),
        (Some(latitude), Some(longitude)) => {
            check_coordinate(record, "latitude", latitude, 90.0)?;
            check_coordinate(record, "longitude", longitude, 180.0)?;
            Ok(Some(GeoPoint {
                latitude,
                longitude,
            }))
        }
        _ => Err(ParseError::PartialCoordinates { record }),
    }
}

fn check_coordinate(
    record: usize,
    field: &'static str,
    value: f64,
    limit: f64,
) -> Result<(), ParseError> {
    if value.is_finite() && value.abs() <= limit {
        Ok(())
    } else {
        Err(ParseError::InvalidCoordinate {
            record,
            field,
            value,
        })
    }
}
