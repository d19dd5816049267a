//! SQLite connection helpers.

use diesel::{Connection, RunQueryDsl, SqliteConnection, sql_query};

use crate::archive::StorageError;

/// Open a SQLite connection and apply connection-wide PRAGMAs.
pub fn connect_sqlite(database_url: &str) -> Result<SqliteConnection, StorageError> {
    let mut conn = SqliteConnection::establish(database_url)?;

    // readers don't block the single writer
    sql_query("PRAGMA journal_mode=WAL;").execute(&mut conn)?;
    sql_query("PRAGMA foreign_keys=ON;").execute(&mut conn)?;
    sql_query("PRAGMA busy_timeout=5000;").execute(&mut conn)?;
    Ok(conn)
}
