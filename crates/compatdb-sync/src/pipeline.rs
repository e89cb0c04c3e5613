use std::sync::Arc;

use anyhow::Context;
use compatdb_adapters::{
    parse_payload, ArchiveSelector, GitHubTreeLister, ListError, ParseError, RemoteLister,
    Selection,
};
use compatdb_core::{Checkpoint, ReportBatch, ReportVersion};
use compatdb_storage::{
    ArchiveError, ArchiveFetcher, DocumentStore, FetchedArchive, HttpFetch, HttpFetcher,
    StoreError,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::ingest::{IngestSummary, IngestionUpserter};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("resolving next archive: {0}")]
    List(#[from] ListError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Advanced(IngestSummary),
    Unchanged,
}

/// Ingestion progress for an archive whose checkpoint has not been stored yet.
#[derive(Debug, Clone)]
struct PendingArchive {
    archive: String,
    sha256: String,
    summary: IngestSummary,
    /// Records already handled, in ingestion order.
    processed: usize,
    complete: bool,
}

/// One ingestion cycle: select, fetch, parse, dedupe/upsert, checkpoint.
///
/// A cycle that fails after ingesting part or all of an archive keeps its
/// progress in memory, so the next attempt on the same archive content only
/// handles the records that are left.
pub struct SyncPipeline {
    lister: Arc<dyn RemoteLister>,
    selector: ArchiveSelector,
    fetcher: ArchiveFetcher,
    store: Arc<dyn DocumentStore>,
    checkpoints: CheckpointStore,
    upserter: IngestionUpserter,
    clock: Arc<dyn Clock>,
    pending: Mutex<Option<PendingArchive>>,
}

impl SyncPipeline {
    pub fn new(
        lister: Arc<dyn RemoteLister>,
        selector: ArchiveSelector,
        fetcher: ArchiveFetcher,
        store: Arc<dyn DocumentStore>,
        baseline_checkpoint: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            lister,
            selector,
            fetcher,
            checkpoints: CheckpointStore::new(store.clone(), baseline_checkpoint),
            upserter: IngestionUpserter::new(store.clone()),
            store,
            clock,
            pending: Mutex::new(None),
        }
    }

    /// Wire the GitHub lister and raw-content fetcher described by `config`.
    pub fn from_config(config: &SyncConfig, store: Arc<dyn DocumentStore>) -> anyhow::Result<Self> {
        let http: Arc<dyn HttpFetch> = Arc::new(
            HttpFetcher::new(config.http_client()).context("building http fetcher")?,
        );
        let lister = Arc::new(GitHubTreeLister::new(
            http.clone(),
            config.tree_api_base.clone(),
            config.repo_owner.clone(),
            config.repo_name.clone(),
            config.repo_branch.clone(),
        ));
        let fetcher = ArchiveFetcher::new(http, config.raw_base_url.clone(), config.work_dir.clone());
        Ok(Self::new(
            lister,
            config.selector(),
            fetcher,
            store,
            config.baseline_checkpoint.clone(),
            Arc::new(SystemClock),
        ))
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn load_checkpoint(&self) -> Result<Checkpoint, CycleError> {
        Ok(self.checkpoints.load_or_seed(self.clock.now()).await?)
    }

    /// Run one cycle against `checkpoint`, which is only modified once the new state is stored.
    pub async fn run_cycle(&self, checkpoint: &mut Checkpoint) -> Result<CycleOutcome, CycleError> {
        let span = info_span!("cycle", last_processed = %checkpoint.last_processed_file);
        self.run_cycle_inner(checkpoint).instrument(span).await
    }

    async fn run_cycle_inner(&self, checkpoint: &mut Checkpoint) -> Result<CycleOutcome, CycleError> {
        let selection = self
            .selector
            .next_archive(self.lister.as_ref(), &checkpoint.last_processed_file)
            .await?;
        let archive = match selection {
            Selection::Next(archive) if archive != checkpoint.last_processed_file => archive,
            _ => {
                self.checkpoints
                    .record_checked(checkpoint, self.clock.now())
                    .await?;
                info!("no newer archive");
                return Ok(CycleOutcome::Unchanged);
            }
        };

        let pending = self
            .pending
            .lock()
            .await
            .take()
            .filter(|pending| pending.archive == archive);
        let progress = match pending {
            Some(progress) if progress.complete => {
                info!(archive = %archive, "archive already ingested; storing checkpoint");
                progress
            }
            pending => self.fetch_and_ingest(&archive, pending).await?,
        };

        if let Err(err) = self
            .checkpoints
            .advance(checkpoint, &archive, self.clock.now())
            .await
        {
            *self.pending.lock().await = Some(progress);
            return Err(err.into());
        }
        let summary = progress.summary;
        info!(
            archive = %summary.archive,
            version = %summary.version,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            rejected = summary.rejected,
            "cycle complete"
        );
        Ok(CycleOutcome::Advanced(summary))
    }

    async fn fetch_and_ingest(
        &self,
        archive: &str,
        pending: Option<PendingArchive>,
    ) -> Result<PendingArchive, CycleError> {
        let (fetched, batch) = match self.fetch_payload(archive).await {
            Ok(found) => found,
            Err(err) => {
                *self.pending.lock().await = pending;
                return Err(err);
            }
        };

        let mut progress = match pending {
            Some(progress) if progress.sha256 == fetched.archive_sha256 => {
                info!(processed = progress.processed, "resuming partially ingested archive");
                progress
            }
            stale => {
                if stale.is_some() {
                    warn!(archive = %archive, "archive content changed since the failed attempt; ingesting from the start");
                }
                self.start_progress(archive, &fetched.archive_sha256, &batch)
                    .await?
            }
        };
        if let Err(err) = self.resume_batch(&mut progress, batch).await {
            *self.pending.lock().await = Some(progress);
            return Err(err.into());
        }

        let extracted = fetched.extracted.path().to_path_buf();
        if let Err(err) = fetched.extracted.purge() {
            warn!(error = %err, dir = %extracted.display(), "failed to remove extraction directory");
        }
        Ok(progress)
    }

    async fn fetch_payload(&self, archive: &str) -> Result<(FetchedArchive, ReportBatch), CycleError> {
        let fetched = self.fetcher.fetch(archive).await?;
        info!(
            archive = %archive,
            sha256 = %fetched.archive_sha256,
            payload = %fetched.payload_path.display(),
            bytes = fetched.payload.len(),
            "archive extracted"
        );
        let batch = parse_payload(&fetched.payload)?;
        Ok((fetched, batch))
    }

    /// Feed a decoded batch through dedup and upsert.
    ///
    /// V2 batches run in reverse payload order once any V2 report is stored.
    pub async fn ingest_batch(
        &self,
        archive: &str,
        batch: ReportBatch,
    ) -> Result<IngestSummary, StoreError> {
        let mut progress = self.start_progress(archive, "", &batch).await?;
        self.resume_batch(&mut progress, batch).await?;
        Ok(progress.summary)
    }

    async fn start_progress(
        &self,
        archive: &str,
        sha256: &str,
        batch: &ReportBatch,
    ) -> Result<PendingArchive, StoreError> {
        let mut summary = IngestSummary::new(archive, batch.version(), batch.len());
        if matches!(batch, ReportBatch::V2(_))
            && self.store.count_reports(Some(ReportVersion::V2)).await? > 0
        {
            summary.reversed = true;
        }
        Ok(PendingArchive {
            archive: archive.to_string(),
            sha256: sha256.to_string(),
            summary,
            processed: 0,
            complete: false,
        })
    }

    /// Ingest the records of `batch` that `progress` has not handled yet.
    async fn resume_batch(
        &self,
        progress: &mut PendingArchive,
        batch: ReportBatch,
    ) -> Result<(), StoreError> {
        match batch {
            ReportBatch::V1(records) => {
                for record in records.iter().skip(progress.processed) {
                    let outcome = self.upserter.ingest_v1(record).await?;
                    progress.summary.record(&outcome);
                    progress.processed += 1;
                }
            }
            ReportBatch::V2(mut records) => {
                if progress.summary.reversed {
                    records.reverse();
                }
                for record in records.iter().skip(progress.processed) {
                    let outcome = self.upserter.ingest_v2(record).await?;
                    progress.summary.record(&outcome);
                    progress.processed += 1;
                }
            }
        }
        progress.complete = true;
        Ok(())
    }
}
