//! Checkpointed ingestion cycle and the scheduler that drives it.

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod ingest;
pub mod pipeline;
pub mod scheduler;

pub use checkpoint::{CheckpointError, CheckpointStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use ingest::{IngestSummary, IngestionUpserter, RecordOutcome, ReportDeduplicator};
pub use pipeline::{CycleError, CycleOutcome, SyncPipeline};
pub use scheduler::{format_days, time_remaining, CycleReport, Scheduler, SchedulerStatus};

pub const CRATE_NAME: &str = "compatdb-sync";
