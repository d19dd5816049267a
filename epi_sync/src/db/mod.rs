//! SQLite plumbing for the archive backend.
//!
//! - [`connection::connect_sqlite`] opens a connection and applies WAL,
//!   foreign_keys=ON and a 5000ms busy_timeout.
//! - [`migrate::run_sqlite`] applies the embedded Diesel migrations.
//!
//! Example:
//! ```no_run
//! use epi_sync::db::{connection, migrate};
//!
//! let db_path = std::env::temp_dir().join("epi_sync_example.db");
//! let url = db_path.to_str().unwrap();
//! migrate::run_sqlite(url).expect("migrations");
//! let _conn = connection::connect_sqlite(url).expect("connect");
//! ```

pub mod connection;
pub mod migrate;
