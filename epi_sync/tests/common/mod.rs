#![allow(dead_code)]

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use epi_source::{DataSource, TransportError, source::UnavailableSnafu};
use epi_sync::{
    archive::{ArchiveEntry, ArchiveKey, ArchiveStore, StorageError, memory::MemoryArchiveStore},
    model::Generation,
};
use tokio::sync::Notify;

/// Two countries, one week of March 2020.
pub const PAYLOAD_V1: &str = r#"{"records":[
  {"date":"2020-03-02","countryCode":"IT","country":"Italy","latitude":41.87,"longitude":12.56,"confirmed":100,"recovered":1,"deceased":2},
  {"date":"2020-03-03","countryCode":"IT","country":"Italy","latitude":41.87,"longitude":12.56,"confirmed":150,"recovered":2,"deceased":4},
  {"date":"2020-03-05","countryCode":"ZA","country":"South Africa","latitude":-30.5595,"longitude":22.9375,"confirmed":1,"recovered":0,"deceased":0}
]}"#;

/// V1 plus a third country and a later day.
pub const PAYLOAD_V2: &str = r#"{"records":[
  {"date":"2020-03-02","countryCode":"IT","country":"Italy","latitude":41.87,"longitude":12.56,"confirmed":100,"recovered":1,"deceased":2},
  {"date":"2020-03-03","countryCode":"IT","country":"Italy","latitude":41.87,"longitude":12.56,"confirmed":150,"recovered":2,"deceased":4},
  {"date":"2020-03-05","countryCode":"ZA","country":"South Africa","latitude":-30.5595,"longitude":22.9375,"confirmed":1,"recovered":0,"deceased":0},
  {"date":"2020-03-06","countryCode":"ZA","country":"South Africa","latitude":-30.5595,"longitude":22.9375,"confirmed":2,"recovered":0,"deceased":0},
  {"date":"2020-03-06","countryCode":"FR","country":"France","confirmed":40,"recovered":0,"deceased":1}
]}"#;

/// Duplicate (ZA, 2020-03-05).
pub const PAYLOAD_DUPLICATE: &str = r#"{"records":[
  {"date":"2020-03-05","countryCode":"ZA","country":"South Africa","confirmed":1,"recovered":0,"deceased":0},
  {"date":"2020-03-05","countryCode":"za","country":"South Africa","confirmed":3,"recovered":0,"deceased":0}
]}"#;

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

/// One scripted answer of [`ScriptedSource`].
#[derive(Debug, Clone)]
pub enum Step {
    Payload(&'static str),
    Fail(&'static str),
    /// Never answers; the fetch only ends when its future is dropped.
    Hang,
}

/// Source answering from a script; the last step repeats forever.
pub struct ScriptedSource {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Step>,
    pub fetches: AtomicUsize,
    pub started: Notify,
}

impl ScriptedSource {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        let steps: VecDeque<Step> = steps.into_iter().collect();
        let last = steps.back().cloned().unwrap_or(Step::Hang);
        Arc::new(Self {
            steps: Mutex::new(steps),
            last: Mutex::new(last),
            fetches: AtomicUsize::new(0),
            started: Notify::new(),
        })
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for ScriptedSource {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn fetch(&self) -> Result<Vec<u8>, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        let step = {
            let mut steps = self.steps.lock().unwrap();
            steps
                .pop_front()
                .unwrap_or_else(|| self.last.lock().unwrap().clone())
        };
        match step {
            Step::Payload(p) => Ok(p.as_bytes().to_vec()),
            Step::Fail(message) => Err(UnavailableSnafu { message }.build()),
            Step::Hang => std::future::pending().await,
        }
    }
}

/// Memory store with switchable failures.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryArchiveStore,
    pub fail_puts: AtomicBool,
    pub fail_list: AtomicBool,
    pub fail_deletes: Mutex<HashSet<Generation>>,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ArchiveStore for FlakyStore {
    fn describe(&self) -> String {
        "flaky".to_string()
    }

    async fn put(&self, key: &ArchiveKey, blob: Vec<u8>) -> Result<ArchiveEntry, StorageError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Other("disk full".into()));
        }
        self.inner.put(key, blob).await
    }

    async fn get(&self, key: &ArchiveKey) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key).await
    }

    async fn list(&self) -> Result<Vec<ArchiveEntry>, StorageError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(StorageError::Other("listing unavailable".into()));
        }
        self.inner.list().await
    }

    async fn delete(&self, key: &ArchiveKey) -> Result<bool, StorageError> {
        if self.fail_deletes.lock().unwrap().contains(&key.generation()) {
            return Err(StorageError::Other(format!("{key} is locked")));
        }
        self.inner.delete(key).await
    }
}
