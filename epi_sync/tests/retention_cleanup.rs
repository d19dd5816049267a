mod common;

use std::{sync::Arc, sync::atomic::Ordering, time::Duration};

use chrono::TimeDelta;
use common::{FlakyStore, at};
use epi_sync::{
    archive::{ArchiveKey, ArchiveStore, fs::FsArchiveStore},
    clock::FixedClock,
    model::Generation,
    retention::{RetentionReport, RetentionScheduler},
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const THIRTY_DAYS: Duration = Duration::from_secs(30 * 24 * 60 * 60);

async fn seed_ages(store: &dyn ArchiveStore, ages_days: &[i64]) -> Vec<ArchiveKey> {
    let now = at(2021, 6, 1);
    let mut keys = Vec::new();
    for (i, days) in ages_days.iter().enumerate() {
        let key = ArchiveKey::new(Generation::new(i as u64 + 1), now - TimeDelta::days(*days));
        store.put(&key, b"{}".to_vec()).await.unwrap();
        keys.push(key);
    }
    keys
}

#[tokio::test]
async fn deletes_only_entries_past_the_horizon() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FsArchiveStore::new(dir.path()));
    let keys = seed_ages(store.as_ref(), &[1, 10, 40]).await;

    let report = RetentionScheduler::new(store.clone(), THIRTY_DAYS)
        .with_clock(Arc::new(FixedClock::new(at(2021, 6, 1))))
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(
        report,
        RetentionReport {
            examined: 3,
            deleted: 1,
            kept: 2,
            failed: 0
        }
    );
    let left: Vec<_> = store.list().await.unwrap().into_iter().map(|e| e.key).collect();
    assert_eq!(left, keys[..2].to_vec());
}

#[tokio::test]
async fn one_stuck_entry_does_not_block_the_rest() {
    let store = FlakyStore::new();
    seed_ages(store.as_ref(), &[31, 45, 60, 2]).await;
    store.fail_deletes.lock().unwrap().insert(Generation::new(2));

    let scheduler = RetentionScheduler::new(store.clone(), THIRTY_DAYS)
        .with_clock(Arc::new(FixedClock::new(at(2021, 6, 1))));
    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.deleted, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.kept, 1);

    let left: Vec<_> = store
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.key.generation().get())
        .collect();
    assert_eq!(left, vec![2, 4]);

    // unstuck: the next cycle picks it up
    store.fail_deletes.lock().unwrap().clear();
    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!((report.deleted, report.kept, report.failed), (1, 1, 0));
}

#[tokio::test]
async fn listing_failure_aborts_only_that_cycle() {
    let store = FlakyStore::new();
    seed_ages(store.as_ref(), &[90]).await;
    store.fail_list.store(true, Ordering::SeqCst);

    let scheduler = RetentionScheduler::new(store.clone(), THIRTY_DAYS)
        .with_clock(Arc::new(FixedClock::new(at(2021, 6, 1))));
    assert!(scheduler.run_cycle().await.is_err());

    store.fail_list.store(false, Ordering::SeqCst);
    assert_eq!(scheduler.run_cycle().await.unwrap().deleted, 1);
}

#[tokio::test(start_paused = true)]
async fn scheduler_prunes_on_its_own_cadence() {
    let store = FlakyStore::new();
    let clock = FixedClock::new(at(2021, 6, 1));
    seed_ages(store.as_ref(), &[29]).await;

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(
        RetentionScheduler::new(store.clone(), THIRTY_DAYS)
            .with_interval(Duration::from_secs(3600))
            .with_clock(Arc::new(clock.clone()))
            .run(cancel.clone()),
    );

    // first cycle runs at once and keeps the 29-day entry
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(store.inner.len(), 1);

    clock.advance(TimeDelta::days(2));
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(store.inner.is_empty());

    cancel.cancel();
    handle.await.unwrap();
}
