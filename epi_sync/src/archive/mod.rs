//! Durable archive of published snapshots.
//!
//! - [`ArchiveStore`] is the storage boundary: put/get/list/delete of opaque
//!   blobs addressed by [`ArchiveKey`]. One entry per generation.
//! - [`ArchiveWriter`] owns the blob format (a versioned JSON envelope) and is
//!   what the refresh scheduler and warm start talk to.
//!
//! Backends: [`fs::FsArchiveStore`], [`sqlite::SqliteArchiveStore`],
//! [`memory::MemoryArchiveStore`].

pub mod fs;
pub mod memory;
pub mod sqlite;

use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{Generation, Snapshot};

const KEY_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Blob envelope version written by [`ArchiveWriter::save`].
pub const ARCHIVE_FORMAT: u32 = 1;

/// Identity of one archive entry: generation plus fetch time.
///
/// Rendered as `g{generation:020}-{fetched_at:%Y%m%dT%H%M%SZ}`, which sorts
/// lexicographically in generation order. The fetch time is truncated to whole
/// seconds; retention computes ages from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveKey {
    generation: Generation,
    fetched_at: DateTime<Utc>,
}

impl ArchiveKey {
    /// Key for a snapshot with this generation and fetch time.
    pub fn new(generation: Generation, fetched_at: DateTime<Utc>) -> Self {
        Self {
            generation,
            fetched_at: fetched_at.trunc_subsecs(0),
        }
    }

    /// Key under which `snapshot` is archived.
    pub fn for_snapshot(snapshot: &Snapshot) -> Self {
        Self::new(snapshot.generation(), snapshot.fetched_at())
    }

    /// Generation part.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Fetch time part (whole seconds).
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Age of the entry at `now`. Negative if the key lies in the future.
    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.fetched_at
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "g{:020}-{}",
            self.generation.get(),
            self.fetched_at.format(KEY_TIME_FORMAT)
        )
    }
}

/// A string that is not a valid [`ArchiveKey`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid archive key {0:?}")]
pub struct InvalidArchiveKey(pub String);

impl FromStr for ArchiveKey {
    type Err = InvalidArchiveKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidArchiveKey(s.to_string());
        let rest = s.strip_prefix('g').ok_or_else(invalid)?;
        let (digits, time) = rest.split_once('-').ok_or_else(invalid)?;
        if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let generation = digits.parse::<u64>().map_err(|_| invalid())?;
        let fetched_at = NaiveDateTime::parse_from_str(time, KEY_TIME_FORMAT)
            .map_err(|_| invalid())?
            .and_utc();
        Ok(Self::new(Generation::new(generation), fetched_at))
    }
}

/// One stored entry as reported by [`ArchiveStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Entry identity.
    pub key: ArchiveKey,
    /// Size of the stored blob.
    pub byte_len: u64,
}

/// Archive read/write failure. Never fatal to the schedulers.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem operation failed.
    #[error("{op} {path}: {source}")]
    Io {
        /// What was attempted.
        op: &'static str,
        /// File or directory involved.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Could not open the database.
    #[error("sqlite connect: {0}")]
    Connect(#[from] diesel::ConnectionError),
    /// Query failed.
    #[error("sqlite query: {0}")]
    Database(#[from] diesel::result::Error),
    /// Schema migrations failed.
    #[error("sqlite migrations: {0}")]
    Migration(String),
    /// Snapshot could not be serialized.
    #[error("encode snapshot {key}: {source}")]
    Encode {
        /// Entry being written.
        key: ArchiveKey,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// Stored blob is not a valid envelope.
    #[error("decode archive entry {key}: {source}")]
    Decode {
        /// Entry being read.
        key: ArchiveKey,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// Stored blob was written by an unknown format version.
    #[error("archive entry {key} has unsupported format {format}")]
    UnsupportedFormat {
        /// Entry being read.
        key: ArchiveKey,
        /// Version found in the blob.
        format: u32,
    },
    /// Blob content does not match the key it is stored under.
    #[error("archive entry {key} holds generation {found}")]
    KeyMismatch {
        /// Entry being read.
        key: ArchiveKey,
        /// Generation inside the blob.
        found: Generation,
    },
    /// No entry under this key.
    #[error("archive entry {0} not found")]
    NotFound(ArchiveKey),
    /// The blocking task running the operation died.
    #[error("archive task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    /// Test-injected or otherwise unclassified failure.
    #[error("{0}")]
    Other(String),
}

/// Storage boundary for archived snapshot blobs.
///
/// Entries are addressed by generation: a `put` for a generation that already
/// exists replaces it, whatever the fetch time in the key.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Stores `blob` under `key`, replacing any entry of the same generation.
    async fn put(&self, key: &ArchiveKey, blob: Vec<u8>) -> Result<ArchiveEntry, StorageError>;

    /// Blob stored under `key`, if any.
    async fn get(&self, key: &ArchiveKey) -> Result<Option<Vec<u8>>, StorageError>;

    /// All entries, ordered by generation. Unreadable keys are skipped.
    async fn list(&self) -> Result<Vec<ArchiveEntry>, StorageError>;

    /// Removes the entry. `Ok(false)` if it was already gone.
    async fn delete(&self, key: &ArchiveKey) -> Result<bool, StorageError>;
}

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    format: u32,
    snapshot: &'a Snapshot,
}

#[derive(Deserialize)]
struct EnvelopeHeader {
    format: u32,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    snapshot: Snapshot,
}

/// Serializes snapshots into an [`ArchiveStore`] and reads them back.
#[derive(Clone)]
pub struct ArchiveWriter {
    store: Arc<dyn ArchiveStore>,
}

impl fmt::Debug for ArchiveWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveWriter")
            .field("store", &self.store.describe())
            .finish()
    }
}

impl ArchiveWriter {
    /// Writer over `store`.
    pub fn new(store: Arc<dyn ArchiveStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn ArchiveStore> {
        &self.store
    }

    /// Archives `snapshot`. Saving the same generation again overwrites it.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<ArchiveEntry, StorageError> {
        let key = ArchiveKey::for_snapshot(snapshot);
        let blob = encode(&key, snapshot)?;
        let entry = self.store.put(&key, blob).await?;
        info!(key = %entry.key, bytes = entry.byte_len, "archived snapshot");
        Ok(entry)
    }

    /// Reads back the snapshot stored under `key`.
    pub async fn load(&self, key: &ArchiveKey) -> Result<Snapshot, StorageError> {
        let blob = self
            .store
            .get(key)
            .await?
            .ok_or(StorageError::NotFound(*key))?;
        decode(key, &blob)
    }

    /// The snapshot with the highest archived generation, if any.
    pub async fn latest(&self) -> Result<Option<Snapshot>, StorageError> {
        let entries = self.store.list().await?;
        let Some(newest) = entries.iter().max_by_key(|e| e.key.generation()) else {
            debug!(store = %self.store.describe(), "archive is empty");
            return Ok(None);
        };
        self.load(&newest.key).await.map(Some)
    }

    /// Every entry in the store.
    pub async fn entries(&self) -> Result<Vec<ArchiveEntry>, StorageError> {
        self.store.list().await
    }
}

fn encode(key: &ArchiveKey, snapshot: &Snapshot) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(&EnvelopeOut {
        format: ARCHIVE_FORMAT,
        snapshot,
    })
    .map_err(|source| StorageError::Encode { key: *key, source })
}

fn decode(key: &ArchiveKey, blob: &[u8]) -> Result<Snapshot, StorageError> {
    let header: EnvelopeHeader = serde_json::from_slice(blob)
        .map_err(|source| StorageError::Decode { key: *key, source })?;
    if header.format != ARCHIVE_FORMAT {
        return Err(StorageError::UnsupportedFormat {
            key: *key,
            format: header.format,
        });
    }
    let envelope: EnvelopeIn = serde_json::from_slice(blob)
        .map_err(|source| StorageError::Decode { key: *key, source })?;
    let found = envelope.snapshot.generation();
    if found != key.generation() {
        return Err(StorageError::KeyMismatch { key: *key, found });
    }
    Ok(envelope.snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use chrono::TimeZone;

    const PAYLOAD: &str = r#"{"records":[
        {"date":"2020-03-05","countryCode":"za","country":"South Africa","latitude":-30.5595,"longitude":22.9375,"confirmed":1,"recovered":0,"deceased":0},
        {"date":"2020-03-06","countryCode":"ZA","country":"South Africa","latitude":-30.5595,"longitude":22.9375,"confirmed":2,"recovered":0,"deceased":0}
    ]}"#;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 3, 7, h, m, s).unwrap()
    }

    #[test]
    fn key_renders_and_parses() {
        let key = ArchiveKey::new(Generation::new(42), at(6, 30, 5));
        let text = key.to_string();
        assert_eq!(text, "g00000000000000000042-20200307T063005Z");
        assert_eq!(text.parse::<ArchiveKey>().unwrap(), key);
    }

    #[test]
    fn key_drops_subseconds() {
        let fetched = at(1, 2, 3) + TimeDelta::milliseconds(750);
        let key = ArchiveKey::new(Generation::FIRST, fetched);
        assert_eq!(key.fetched_at(), at(1, 2, 3));
    }

    #[test]
    fn keys_sort_by_generation() {
        let a = ArchiveKey::new(Generation::new(9), at(23, 0, 0)).to_string();
        let b = ArchiveKey::new(Generation::new(10), at(1, 0, 0)).to_string();
        assert!(a < b);
    }

    #[test]
    fn rejects_foreign_names() {
        for bad in [
            "",
            "snapshot.json",
            "g42-20200307T063005Z",
            "g0000000000000000004x-20200307T063005Z",
            "g00000000000000000042-2020-03-07",
            "g00000000000000000042",
        ] {
            assert!(bad.parse::<ArchiveKey>().is_err(), "{bad}");
        }
    }

    #[test]
    fn envelope_round_trips_snapshot() {
        let snapshot = normalize(PAYLOAD.as_bytes(), Generation::new(3), at(0, 0, 0)).unwrap();
        let key = ArchiveKey::for_snapshot(&snapshot);
        let blob = encode(&key, &snapshot).unwrap();
        assert_eq!(decode(&key, &blob).unwrap(), snapshot);
    }

    #[test]
    fn envelope_checks_version_and_generation() {
        let snapshot = normalize(PAYLOAD.as_bytes(), Generation::new(3), at(0, 0, 0)).unwrap();
        let key = ArchiveKey::for_snapshot(&snapshot);

        let mut value: serde_json::Value =
            serde_json::from_slice(&encode(&key, &snapshot).unwrap()).unwrap();
        value["format"] = 2.into();
        let blob = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            decode(&key, &blob),
            Err(StorageError::UnsupportedFormat { format: 2, .. })
        ));

        let other = ArchiveKey::new(Generation::new(4), at(0, 0, 0));
        let blob = encode(&key, &snapshot).unwrap();
        assert!(matches!(
            decode(&other, &blob),
            Err(StorageError::KeyMismatch { .. })
        ));

        assert!(matches!(
            decode(&key, b"not json"),
            Err(StorageError::Decode { .. })
        ));
    }
}
