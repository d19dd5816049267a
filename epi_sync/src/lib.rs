//! Refresh-and-cache core for a published epidemiological dataset.
//!
//! A [`refresh::RefreshScheduler`] pulls the raw payload from an
//! [`epi_source::DataSource`], [`normalize`]s it into an immutable
//! [`model::Snapshot`] and publishes it to the [`cache::SnapshotCache`]; every
//! published snapshot is also written to an [`archive`] store, which the
//! [`retention::RetentionScheduler`] prunes. Readers go through
//! [`query::QueryFacade`].

#![deny(missing_docs)]

pub mod archive;
pub mod backoff;
pub mod bucket;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod model;
pub mod normalize;
pub mod query;
pub mod refresh;
pub mod retention;
/// Diesel table definitions.
#[allow(missing_docs)]
pub mod schema;
pub mod service;
pub mod telemetry;
