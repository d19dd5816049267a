//! Payload read from the local filesystem.

use std::path::PathBuf;

use async_trait::async_trait;
use snafu::ResultExt;

use crate::source::{DataSource, ReadSnafu, TransportError};

/// Serves the contents of a file as the upstream payload.
///
/// The file is re-read on every fetch, so replacing it on disk is picked up by
/// the next refresh cycle.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Creates a source reading `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DataSource for FileSource {
    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }

    async fn fetch(&self) -> Result<Vec<u8>, TransportError> {
        tokio::fs::read(&self.path).await.context(ReadSnafu {
            path: self.path.display().to_string(),
        })
    }
}
