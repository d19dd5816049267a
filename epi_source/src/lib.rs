//! Client side of the published open dataset.
//!
//! The refresh pipeline only needs one thing from upstream: the raw bytes of
//! the latest dataset. [`DataSource`] is that narrow contract; [`HttpSource`]
//! pulls it from the publisher over HTTPS and [`FileSource`] reads a local copy
//! (offline runs, fixtures, replays).

pub mod file;
pub mod http;
pub mod source;

pub use file::FileSource;
pub use http::{HttpSource, HttpSourceConfig};
pub use source::{DataSource, SourceInitError, TransportError};
