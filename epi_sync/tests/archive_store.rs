mod common;

use std::sync::Arc;

use common::{PAYLOAD_V1, PAYLOAD_V2, at};
use diesel::{QueryableByName, RunQueryDsl, sql_query, sql_types::Integer, sql_types::Text};
use epi_sync::{
    archive::{
        ArchiveKey, ArchiveStore, ArchiveWriter, StorageError, fs::FsArchiveStore,
        memory::MemoryArchiveStore, sqlite::SqliteArchiveStore,
    },
    cache::SnapshotCache,
    db::connection::connect_sqlite,
    model::{Generation, Snapshot},
    normalize::normalize,
    service::{archived_generation, restore_latest},
};
use tempfile::TempDir;

fn snapshot(payload: &str, generation: u64, day: u32) -> Snapshot {
    normalize(payload.as_bytes(), Generation::new(generation), at(2020, 3, day)).unwrap()
}

async fn backends(dir: &TempDir) -> Vec<Arc<dyn ArchiveStore>> {
    let db = dir.path().join("archive.db");
    vec![
        Arc::new(MemoryArchiveStore::new()),
        Arc::new(FsArchiveStore::new(dir.path().join("files"))),
        Arc::new(
            SqliteArchiveStore::open(db.to_string_lossy().into_owned())
                .await
                .unwrap(),
        ),
    ]
}

#[tokio::test]
async fn save_and_load_round_trip_on_every_backend() {
    let dir = TempDir::new().unwrap();
    for store in backends(&dir).await {
        let writer = ArchiveWriter::new(Arc::clone(&store));
        let original = snapshot(PAYLOAD_V1, 1, 7);

        let entry = writer.save(&original).await.unwrap();
        assert_eq!(entry.key, ArchiveKey::for_snapshot(&original));
        assert!(entry.byte_len > 0);

        let loaded = writer.load(&entry.key).await.unwrap();
        assert_eq!(loaded, original, "{}", store.describe());
    }
}

#[tokio::test]
async fn resaving_a_generation_never_duplicates() {
    let dir = TempDir::new().unwrap();
    for store in backends(&dir).await {
        let writer = ArchiveWriter::new(Arc::clone(&store));
        writer.save(&snapshot(PAYLOAD_V1, 4, 7)).await.unwrap();
        writer.save(&snapshot(PAYLOAD_V1, 4, 7)).await.unwrap();
        // same generation, later fetch time: replaces the earlier entry
        writer.save(&snapshot(PAYLOAD_V2, 4, 8)).await.unwrap();

        let entries = writer.entries().await.unwrap();
        assert_eq!(entries.len(), 1, "{}", store.describe());
        assert_eq!(entries[0].key.fetched_at(), at(2020, 3, 8));

        let latest = writer.latest().await.unwrap().unwrap();
        assert_eq!(latest.data().countries.len(), 3);
    }
}

#[tokio::test]
async fn latest_picks_highest_generation() {
    let dir = TempDir::new().unwrap();
    for store in backends(&dir).await {
        let writer = ArchiveWriter::new(Arc::clone(&store));
        assert_eq!(writer.latest().await.unwrap(), None);

        writer.save(&snapshot(PAYLOAD_V2, 9, 9)).await.unwrap();
        writer.save(&snapshot(PAYLOAD_V1, 10, 1)).await.unwrap();
        writer.save(&snapshot(PAYLOAD_V1, 2, 20)).await.unwrap();

        let latest = writer.latest().await.unwrap().unwrap();
        assert_eq!(latest.generation(), Generation::new(10), "{}", store.describe());
        assert_eq!(archived_generation(&writer).await, Some(Generation::new(10)));
    }
}

#[tokio::test]
async fn load_of_missing_key_is_not_found() {
    let writer = ArchiveWriter::new(Arc::new(MemoryArchiveStore::new()));
    let key = ArchiveKey::new(Generation::new(3), at(2020, 1, 1));
    assert!(matches!(writer.load(&key).await, Err(StorageError::NotFound(k)) if k == key));
}

#[tokio::test]
async fn warm_start_publishes_latest_archive() {
    let dir = TempDir::new().unwrap();
    let writer = ArchiveWriter::new(Arc::new(FsArchiveStore::new(dir.path())));
    writer.save(&snapshot(PAYLOAD_V1, 5, 7)).await.unwrap();
    writer.save(&snapshot(PAYLOAD_V2, 6, 8)).await.unwrap();

    let cache = SnapshotCache::new();
    assert_eq!(restore_latest(&cache, &writer).await, Some(Generation::new(6)));
    let restored = cache.read().unwrap();
    assert_eq!(restored.generation(), Generation::new(6));
    assert_eq!(restored.fetched_at(), at(2020, 3, 8));
}

#[tokio::test]
async fn warm_start_from_corrupt_entry_starts_empty() {
    let dir = TempDir::new().unwrap();
    let key = ArchiveKey::new(Generation::new(2), at(2020, 3, 1));
    std::fs::write(dir.path().join(format!("{key}.json")), b"{\"format\":1,\"snap").unwrap();

    let writer = ArchiveWriter::new(Arc::new(FsArchiveStore::new(dir.path())));
    let cache = SnapshotCache::new();
    assert_eq!(restore_latest(&cache, &writer).await, None);
    assert!(cache.read().is_err());
}

#[derive(QueryableByName)]
struct JournalMode {
    #[diesel(sql_type = Text)]
    journal_mode: String,
}

#[derive(QueryableByName)]
struct BusyTimeout {
    #[diesel(sql_type = Integer, column_name = "timeout")]
    busy_timeout: i32,
}

#[test]
fn sqlite_connections_use_wal_and_busy_timeout() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pragmas.db");
    let mut conn = connect_sqlite(&path.to_string_lossy()).unwrap();

    let jm: JournalMode = sql_query("PRAGMA journal_mode;").get_result(&mut conn).unwrap();
    assert_eq!(jm.journal_mode.to_lowercase(), "wal");

    let bt: BusyTimeout = sql_query("PRAGMA busy_timeout;").get_result(&mut conn).unwrap();
    assert_eq!(bt.busy_timeout, 5000);
}
