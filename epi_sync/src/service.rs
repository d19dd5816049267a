//! Wiring: settings -> source, archive, cache, schedulers, query façade.

use std::sync::Arc;

use anyhow::Context;
use epi_source::{DataSource, FileSource, HttpSource, HttpSourceConfig, SourceInitError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    archive::{
        ArchiveStore, ArchiveWriter, StorageError, fs::FsArchiveStore, memory::MemoryArchiveStore,
        sqlite::SqliteArchiveStore,
    },
    cache::SnapshotCache,
    config::{ArchiveBackend, ArchiveSettings, Settings, SourceKind, SourceSettings},
    model::Generation,
    query::QueryFacade,
    refresh::{CycleReport, RefreshError, RefreshScheduler, RefreshStatus},
    retention::RetentionScheduler,
};

/// Builds the configured upstream source.
pub fn build_source(settings: &SourceSettings) -> Result<Arc<dyn DataSource>, SourceInitError> {
    match settings.kind {
        SourceKind::File => {
            let path = settings.path.clone().unwrap_or_default();
            Ok(Arc::new(FileSource::new(path)))
        }
        SourceKind::Http => {
            let mut config = HttpSourceConfig::new(settings.url.clone().unwrap_or_default());
            config.api_key_header = settings.api_key_header.clone();
            config.timeout = settings.timeout.get();
            if let Some(var) = &settings.api_key_env {
                config = config.with_api_key_env(var)?;
            }
            Ok(Arc::new(HttpSource::new(config)?))
        }
    }
}

/// Opens the configured archive store; `None` when archiving is disabled.
pub async fn open_archive(
    settings: &ArchiveSettings,
) -> Result<Option<Arc<dyn ArchiveStore>>, StorageError> {
    let path = settings.path.clone().unwrap_or_default();
    let store: Arc<dyn ArchiveStore> = match settings.backend {
        ArchiveBackend::Disabled => return Ok(None),
        ArchiveBackend::Memory => Arc::new(MemoryArchiveStore::new()),
        ArchiveBackend::Filesystem => Arc::new(FsArchiveStore::new(path)),
        ArchiveBackend::Sqlite => {
            Arc::new(SqliteArchiveStore::open(path.to_string_lossy().into_owned()).await?)
        }
    };
    info!(store = %store.describe(), "archive opened");
    Ok(Some(store))
}

/// Highest archived generation, or `None` for an empty or unreadable archive.
pub async fn archived_generation(writer: &ArchiveWriter) -> Option<Generation> {
    match writer.entries().await {
        Ok(entries) => entries.iter().map(|e| e.key.generation()).max(),
        Err(e) => {
            warn!(error = %e, "could not list archive; generations restart from the cache");
            None
        }
    }
}

/// Publishes the newest archived snapshot into `cache`.
///
/// Failures are logged and leave the cache as it was (uninitialized on a
/// fresh start).
pub async fn restore_latest(cache: &SnapshotCache, writer: &ArchiveWriter) -> Option<Generation> {
    match writer.latest().await {
        Ok(Some(snapshot)) => {
            let generation = snapshot.generation();
            let fetched_at = snapshot.fetched_at();
            let outcome = cache.publish(Arc::new(snapshot));
            info!(%generation, %fetched_at, published = outcome.is_published(), "restored snapshot from archive");
            Some(generation)
        }
        Ok(None) => {
            info!("archive empty; starting without a snapshot");
            None
        }
        Err(e) => {
            warn!(error = %e, "archive restore failed; starting without a snapshot");
            None
        }
    }
}

/// Everything `epi-sync run` needs, assembled from [`Settings`].
pub struct Service {
    cache: Arc<SnapshotCache>,
    refresh: RefreshScheduler,
    retention: Option<RetentionScheduler>,
    status: watch::Receiver<RefreshStatus>,
}

impl Service {
    /// Builds the source and archive, optionally restores the newest archived
    /// snapshot, and prepares both schedulers.
    pub async fn build(settings: &Settings) -> anyhow::Result<Self> {
        let source = build_source(&settings.source).context("build source")?;
        let store = open_archive(&settings.archive).await.context("open archive")?;
        let cache = Arc::new(SnapshotCache::new());

        let mut refresh = RefreshScheduler::new(source, Arc::clone(&cache))
            .with_interval(settings.refresh.interval.get())
            .with_backoff(settings.refresh.backoff.to_backoff());

        let mut retention = None;
        if let Some(store) = store {
            let writer = ArchiveWriter::new(Arc::clone(&store));
            if settings.archive.restore_on_start {
                restore_latest(&cache, &writer).await;
            }
            if let Some(floor) = archived_generation(&writer).await {
                refresh = refresh.with_generation_floor(floor);
            }
            refresh = refresh.with_archive(writer);
            retention = Some(
                RetentionScheduler::new(store, settings.retention.horizon.get())
                    .with_interval(settings.retention.interval.get()),
            );
        }

        let status = refresh.subscribe();
        Ok(Self {
            cache,
            refresh,
            retention,
            status,
        })
    }

    /// Query façade over this service's cache.
    pub fn query(&self) -> QueryFacade {
        QueryFacade::new(Arc::clone(&self.cache))
    }

    /// Refresh status updates.
    pub fn status(&self) -> watch::Receiver<RefreshStatus> {
        self.status.clone()
    }

    /// One refresh cycle without retry.
    pub async fn refresh_once(&self) -> Result<CycleReport, RefreshError> {
        self.refresh.run_cycle(&CancellationToken::new()).await
    }

    /// Runs both schedulers until `cancel` fires, then waits for them to stop.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let refresh = tokio::spawn(self.refresh.run(cancel.child_token()));
        let retention = self
            .retention
            .map(|r| tokio::spawn(r.run(cancel.child_token())));

        refresh.await.context("refresh task")?;
        if let Some(retention) = retention {
            retention.await.context("retention task")?;
        }
        Ok(())
    }
}
