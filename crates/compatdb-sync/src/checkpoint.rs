use std::sync::Arc;

use chrono::{DateTime, Utc};
use compatdb_core::{archive_precedes, Checkpoint};
use compatdb_storage::{DocumentStore, StoreError};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint would move from {current:?} to {candidate:?}, which is not newer")]
    Regression { current: String, candidate: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reads and writes the single ingestion-progress record.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn DocumentStore>,
    baseline: String,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn DocumentStore>, baseline: impl Into<String>) -> Self {
        Self {
            store,
            baseline: baseline.into(),
        }
    }

    /// Stored checkpoint, or a freshly persisted baseline seed on first run.
    pub async fn load_or_seed(&self, now: DateTime<Utc>) -> Result<Checkpoint, CheckpointError> {
        if let Some(existing) = self.store.load_checkpoint().await? {
            info!(
                last_processed_file = %existing.last_processed_file,
                last_processed_time = %existing.last_processed_time,
                "loaded checkpoint"
            );
            return Ok(existing);
        }

        let seed = Checkpoint::new(self.baseline.clone(), now);
        self.store.save_checkpoint(&seed).await?;
        info!(last_processed_file = %seed.last_processed_file, "seeded checkpoint");
        Ok(seed)
    }

    /// Persist `archive` as the last processed archive, then update `current`.
    ///
    /// `current` is left untouched if the write fails or `archive` is not
    /// strictly newer than what it already records.
    pub async fn advance(
        &self,
        current: &mut Checkpoint,
        archive: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CheckpointError> {
        if !current.last_processed_file.is_empty()
            && !archive_precedes(&current.last_processed_file, archive)
        {
            return Err(CheckpointError::Regression {
                current: current.last_processed_file.clone(),
                candidate: archive.to_string(),
            });
        }

        let next = Checkpoint {
            last_processed_file: archive.to_string(),
            last_processed_time: at,
            last_checked_time: Some(at),
        };
        self.store.save_checkpoint(&next).await?;
        info!(from = %current.last_processed_file, to = %archive, "checkpoint advanced");
        *current = next;
        Ok(())
    }

    /// Stamp a cycle that found nothing new.
    pub async fn record_checked(
        &self,
        current: &mut Checkpoint,
        at: DateTime<Utc>,
    ) -> Result<(), CheckpointError> {
        self.store.record_checked(at).await?;
        current.last_checked_time = Some(at);
        Ok(())
    }
}
