//! Filesystem archive backend: one `<key>.json` file per entry.
//!
//! Writes land in a dot-prefixed temp file that is synced and then renamed
//! over the final name, so a crash leaves either the old entry or the new one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

use super::{ArchiveEntry, ArchiveKey, ArchiveStore, StorageError};

const EXTENSION: &str = "json";

/// Archive rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsArchiveStore {
    dir: PathBuf,
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> StorageError + 'a {
    move |source| StorageError::Io {
        op,
        path: path.display().to_string(),
        source,
    }
}

impl FsArchiveStore {
    /// Store under `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &ArchiveKey) -> PathBuf {
        self.dir.join(format!("{key}.{EXTENSION}"))
    }

    /// Keys of every entry file, unreadable names skipped.
    async fn scan(&self) -> Result<Vec<(ArchiveKey, PathBuf)>, StorageError> {
        let mut out = Vec::new();
        let mut rd = match fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(io_err("read dir", &self.dir)(e)),
        };
        while let Some(item) = rd.next_entry().await.map_err(io_err("read dir", &self.dir))? {
            let path = item.path();
            let name = item.file_name();
            let Some(name) = name.to_str() else {
                warn!(path = %path.display(), "skipping non-utf8 file in archive dir");
                continue;
            };
            if name.starts_with('.') {
                // in-flight or abandoned temp file
                continue;
            }
            let Some(stem) = name.strip_suffix(&format!(".{EXTENSION}")) else {
                warn!(path = %path.display(), "skipping foreign file in archive dir");
                continue;
            };
            match stem.parse::<ArchiveKey>() {
                Ok(key) => out.push((key, path)),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable archive file"),
            }
        }
        out.sort_by_key(|(key, _)| *key);
        Ok(out)
    }

    /// One entry per generation: drops copies written under another fetch time.
    async fn remove_superseded(&self, key: &ArchiveKey) -> Result<(), StorageError> {
        for (other, path) in self.scan().await? {
            if other.generation() == key.generation() && other != *key {
                debug!(replaced = %other, "removing superseded archive file");
                fs::remove_file(&path).await.map_err(io_err("remove", &path))?;
            }
        }
        Ok(())
    }
}

async fn write_synced(path: &Path, blob: &[u8]) -> Result<(), StorageError> {
    let mut file = fs::File::create(path).await.map_err(io_err("create", path))?;
    file.write_all(blob).await.map_err(io_err("write", path))?;
    file.sync_all().await.map_err(io_err("sync", path))
}

#[async_trait]
impl ArchiveStore for FsArchiveStore {
    fn describe(&self) -> String {
        format!("fs:{}", self.dir.display())
    }

    async fn put(&self, key: &ArchiveKey, blob: Vec<u8>) -> Result<ArchiveEntry, StorageError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(io_err("create dir", &self.dir))?;

        let target = self.path_for(key);
        let tmp = self.dir.join(format!(".{key}.{EXTENSION}.tmp"));
        if let Err(e) = write_synced(&tmp, &blob).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_err("rename", &target)(e));
        }

        // The entry is durable from here on; leftovers are retried on the next put.
        if let Err(e) = self.remove_superseded(key).await {
            warn!(key = %key, error = %e, "could not remove superseded archive files");
        }

        Ok(ArchiveEntry {
            key: *key,
            byte_len: blob.len() as u64,
        })
    }

    async fn get(&self, key: &ArchiveKey) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("read", &path)(e)),
        }
    }

    async fn list(&self) -> Result<Vec<ArchiveEntry>, StorageError> {
        let mut entries = Vec::new();
        for (key, path) in self.scan().await? {
            let meta = match fs::metadata(&path).await {
                Ok(meta) => meta,
                // deleted between scan and stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err("stat", &path)(e)),
            };
            entries.push(ArchiveEntry {
                key,
                byte_len: meta.len(),
            });
        }
        Ok(entries)
    }

    async fn delete(&self, key: &ArchiveKey) -> Result<bool, StorageError> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err("remove", &path)(e)),
        }
    }
}
