#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use compatdb_adapters::{ArchiveSelector, ListError, RemoteLister};
use compatdb_core::{Checkpoint, DedupKey, Game, Report, ReportVersion};
use compatdb_storage::{
    ArchiveFetcher, DocumentStore, FetchError, FetchedResponse, HttpFetch, MemoryStore, StoreError,
};
use compatdb_sync::{ManualClock, SyncPipeline};
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::StatusCode;
use tempfile::TempDir;
use uuid::Uuid;

pub const RAW_BASE: &str = "https://raw.example.test/protondb-data/master";
pub const BASELINE_CHECKPOINT: &str = "reports_oct31_2019.tar.gz";
pub const BASELINE_ARCHIVE: &str = "reports/reports_nov1_2019.tar.gz";

pub fn fixture(name: &str) -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/reports")
        .join(name);
    fs::read(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}

/// Gzipped tar holding `payload` at `reports/<name>` plus an unrelated text file.
pub fn report_archive(name: &str, payload: &[u8]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let readme = b"community reports";
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(readme.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "README.txt", readme.as_slice())
        .expect("append readme");

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(payload.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, format!("reports/{name}"), payload)
        .expect("append payload");

    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip")
}

#[derive(Default)]
pub struct FakeLister {
    paths: Mutex<Vec<String>>,
}

impl FakeLister {
    pub fn set_paths(&self, paths: &[&str]) {
        *self.paths.lock().expect("lister lock") = paths.iter().map(|p| p.to_string()).collect();
    }
}

#[async_trait]
impl RemoteLister for FakeLister {
    async fn list_paths(&self) -> Result<Vec<String>, ListError> {
        Ok(self.paths.lock().expect("lister lock").clone())
    }
}

#[derive(Default)]
pub struct FakeHttp {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl FakeHttp {
    pub fn serve(&self, archive: &str, body: Vec<u8>) {
        self.bodies
            .lock()
            .expect("http lock")
            .insert(format!("{RAW_BASE}/{archive}"), body);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("http lock").clone()
    }
}

#[async_trait]
impl HttpFetch for FakeHttp {
    async fn get_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.requests.lock().expect("http lock").push(url.to_string());
        match self.bodies.lock().expect("http lock").get(url) {
            Some(body) => Ok(FetchedResponse {
                status: StatusCode::OK,
                final_url: url.to_string(),
                body: body.clone(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

/// `MemoryStore` that can be told to fail selected writes.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_checkpoint_saves: AtomicUsize,
    fail_report_insert_at: Mutex<Option<usize>>,
    report_inserts: AtomicUsize,
    armed: AtomicBool,
}

impl FlakyStore {
    /// Make the next `count` checkpoint saves fail.
    pub fn fail_checkpoint_saves(&self, count: usize) {
        self.fail_checkpoint_saves.store(count, Ordering::SeqCst);
    }

    /// Make the `nth` report insert from now (zero based) fail once.
    pub fn fail_report_insert_at(&self, nth: usize) {
        self.report_inserts.store(0, Ordering::SeqCst);
        *self.fail_report_insert_at.lock().expect("flaky lock") = Some(nth);
        self.armed.store(true, Ordering::SeqCst);
    }

    fn injected(what: &str) -> StoreError {
        StoreError::InvalidDocument(format!("injected {what} failure"))
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        self.inner.load_checkpoint().await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let remaining = self.fail_checkpoint_saves.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_checkpoint_saves.store(remaining - 1, Ordering::SeqCst);
            return Err(Self::injected("checkpoint save"));
        }
        self.inner.save_checkpoint(checkpoint).await
    }

    async fn record_checked(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.record_checked(at).await
    }

    async fn find_game(&self, app_id: &str) -> Result<Option<Game>, StoreError> {
        self.inner.find_game(app_id).await
    }

    async fn insert_game_if_absent(&self, game: &Game) -> Result<Game, StoreError> {
        self.inner.insert_game_if_absent(game).await
    }

    async fn set_game_title(&self, game_id: Uuid, title: &str) -> Result<(), StoreError> {
        self.inner.set_game_title(game_id, title).await
    }

    async fn append_game_report(&self, game_id: Uuid, report_id: Uuid) -> Result<(), StoreError> {
        self.inner.append_game_report(game_id, report_id).await
    }

    async fn search_games_by_title(&self, pattern: &str) -> Result<Vec<Game>, StoreError> {
        self.inner.search_games_by_title(pattern).await
    }

    async fn count_games(&self) -> Result<u64, StoreError> {
        self.inner.count_games().await
    }

    async fn insert_report(&self, report: &Report) -> Result<(), StoreError> {
        if self.armed.load(Ordering::SeqCst) {
            let seen = self.report_inserts.fetch_add(1, Ordering::SeqCst);
            let mut target = self.fail_report_insert_at.lock().expect("flaky lock");
            if *target == Some(seen) {
                *target = None;
                self.armed.store(false, Ordering::SeqCst);
                return Err(Self::injected("report insert"));
            }
        }
        self.inner.insert_report(report).await
    }

    async fn update_report(&self, report: &Report) -> Result<(), StoreError> {
        self.inner.update_report(report).await
    }

    async fn get_report(&self, report_id: Uuid) -> Result<Option<Report>, StoreError> {
        self.inner.get_report(report_id).await
    }

    async fn find_matching_report(&self, key: &DedupKey) -> Result<Option<Uuid>, StoreError> {
        self.inner.find_matching_report(key).await
    }

    async fn reports_for_game(
        &self,
        app_id: &str,
        version: Option<ReportVersion>,
    ) -> Result<Vec<Report>, StoreError> {
        self.inner.reports_for_game(app_id, version).await
    }

    async fn count_reports(&self, version: Option<ReportVersion>) -> Result<u64, StoreError> {
        self.inner.count_reports(version).await
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap()
}

pub struct Harness {
    pub store: Arc<FlakyStore>,
    pub lister: Arc<FakeLister>,
    pub http: Arc<FakeHttp>,
    pub clock: Arc<ManualClock>,
    pub work_dir: TempDir,
    pub pipeline: Arc<SyncPipeline>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(FlakyStore::default());
        let lister = Arc::new(FakeLister::default());
        let http = Arc::new(FakeHttp::default());
        let clock = Arc::new(ManualClock::new(start_time()));
        let work_dir = tempfile::tempdir().expect("work dir");

        let pipeline = SyncPipeline::new(
            lister.clone(),
            ArchiveSelector::new("reports/", ".tar.gz", BASELINE_ARCHIVE),
            ArchiveFetcher::new(http.clone(), RAW_BASE, work_dir.path()),
            store.clone(),
            BASELINE_CHECKPOINT,
            clock.clone(),
        );

        Self {
            store,
            lister,
            http,
            clock,
            work_dir,
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn work_dir_entries(&self) -> usize {
        fs::read_dir(self.work_dir.path())
            .expect("read work dir")
            .count()
    }
}
