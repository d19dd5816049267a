//! Embedded schema migrations.

use diesel::{SqliteConnection, connection::SimpleConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tracing::debug;

use crate::archive::StorageError;

use super::connection::connect_sqlite;

/// Embedded Diesel migrations bundled with this crate.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Runs pending migrations on the SQLite database at `url`.
pub fn run_sqlite(url: &str) -> Result<(), StorageError> {
    let mut conn = connect_sqlite(url)?;
    run_pending(&mut conn)
}

/// Runs pending migrations on an open connection.
pub fn run_pending(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    conn.batch_execute("PRAGMA journal_mode=WAL;")?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    for version in applied {
        debug!(%version, "applied migration");
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use diesel::Connection;

    #[test]
    fn migrations_apply_on_temp_file() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let path = temp.path().to_string_lossy().to_string();

        run_sqlite(&path).expect("migration run");
        // idempotent
        run_sqlite(&path).expect("second run");

        let mut conn = SqliteConnection::establish(&path).unwrap();
        conn.batch_execute(
            "INSERT INTO snapshot_archive (generation, archive_key, fetched_at, payload, byte_len, written_at) \
             VALUES (1, 'g00000000000000000001-20200101T000000Z', '2020-01-01T00:00:00Z', x'7b7d', 2, '2020-01-01T00:00:00Z')",
        )
        .unwrap();
    }
}
