//! SQLite archive backend (`snapshot_archive` table, one row per generation).
//!
//! Diesel is synchronous, so every call runs on tokio's blocking pool against
//! one shared connection.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use diesel::{SqliteConnection, prelude::*, upsert::excluded};
use tracing::warn;

use crate::{
    db::{connection::connect_sqlite, migrate},
    schema::snapshot_archive::dsl as sa,
};

use super::{ArchiveEntry, ArchiveKey, ArchiveStore, StorageError};

#[derive(Insertable)]
#[diesel(table_name = crate::schema::snapshot_archive)]
struct NewArchiveRow<'a> {
    generation: i64,
    archive_key: &'a str,
    fetched_at: &'a str,
    payload: &'a [u8],
    byte_len: i64,
    written_at: &'a str,
}

/// Archive stored in a SQLite database file.
pub struct SqliteArchiveStore {
    url: String,
    conn: Arc<Mutex<SqliteConnection>>,
}

impl SqliteArchiveStore {
    /// Opens (creating if needed) the database at `url` and migrates it.
    pub async fn open(url: impl Into<String>) -> Result<Self, StorageError> {
        let url = url.into();
        let conn = {
            let url = url.clone();
            tokio::task::spawn_blocking(move || {
                let mut conn = connect_sqlite(&url)?;
                migrate::run_pending(&mut conn)?;
                Ok::<_, StorageError>(conn)
            })
            .await??
        };
        Ok(Self {
            url,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn);
            f(&mut guard)
        })
        .await?
    }
}

fn lock(conn: &Mutex<SqliteConnection>) -> MutexGuard<'_, SqliteConnection> {
    // a panicked query leaves nothing half-applied outside its transaction
    conn.lock().unwrap_or_else(|e| e.into_inner())
}

fn to_db_generation(key: &ArchiveKey) -> Result<i64, StorageError> {
    i64::try_from(key.generation().get())
        .map_err(|_| StorageError::Other(format!("generation {} exceeds sqlite range", key.generation())))
}

#[async_trait]
impl ArchiveStore for SqliteArchiveStore {
    fn describe(&self) -> String {
        format!("sqlite:{}", self.url)
    }

    async fn put(&self, key: &ArchiveKey, blob: Vec<u8>) -> Result<ArchiveEntry, StorageError> {
        let key = *key;
        let generation = to_db_generation(&key)?;
        self.with_conn(move |conn| {
            let key_text = key.to_string();
            let fetched_at = key.fetched_at().to_rfc3339_opts(SecondsFormat::Secs, true);
            let written_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            let byte_len = blob.len() as u64;
            let row = NewArchiveRow {
                generation,
                archive_key: &key_text,
                fetched_at: &fetched_at,
                payload: &blob,
                byte_len: byte_len as i64,
                written_at: &written_at,
            };

            diesel::insert_into(sa::snapshot_archive)
                .values(&row)
                .on_conflict(sa::generation)
                .do_update()
                .set((
                    sa::archive_key.eq(excluded(sa::archive_key)),
                    sa::fetched_at.eq(excluded(sa::fetched_at)),
                    sa::payload.eq(excluded(sa::payload)),
                    sa::byte_len.eq(excluded(sa::byte_len)),
                    sa::written_at.eq(excluded(sa::written_at)),
                ))
                .execute(conn)?;

            Ok(ArchiveEntry { key, byte_len })
        })
        .await
    }

    async fn get(&self, key: &ArchiveKey) -> Result<Option<Vec<u8>>, StorageError> {
        let key_text = key.to_string();
        self.with_conn(move |conn| {
            let payload = sa::snapshot_archive
                .filter(sa::archive_key.eq(&key_text))
                .select(sa::payload)
                .first::<Vec<u8>>(conn)
                .optional()?;
            Ok(payload)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<ArchiveEntry>, StorageError> {
        self.with_conn(|conn| {
            let rows: Vec<(String, i64)> = sa::snapshot_archive
                .select((sa::archive_key, sa::byte_len))
                .order(sa::generation.asc())
                .load(conn)?;

            let mut entries = Vec::with_capacity(rows.len());
            for (text, byte_len) in rows {
                match text.parse::<ArchiveKey>() {
                    Ok(key) => entries.push(ArchiveEntry {
                        key,
                        byte_len: u64::try_from(byte_len).unwrap_or_default(),
                    }),
                    Err(e) => warn!(error = %e, "skipping unreadable archive row"),
                }
            }
            Ok(entries)
        })
        .await
    }

    async fn delete(&self, key: &ArchiveKey) -> Result<bool, StorageError> {
        let key_text = key.to_string();
        self.with_conn(move |conn| {
            let n = diesel::delete(sa::snapshot_archive.filter(sa::archive_key.eq(&key_text)))
                .execute(conn)?;
            Ok(n > 0)
        })
        .await
    }
}
