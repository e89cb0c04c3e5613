use async_trait::async_trait;
use chrono::{DateTime, Utc};
use compatdb_core::{Checkpoint, DedupKey, Game, Report, ReportVersion};
use regex::RegexBuilder;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("invalid stored document: {0}")]
    InvalidDocument(String),
}

/// Document persistence used by the ingestion pipeline and by read-side collaborators.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError>;
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;
    /// Stamp the checkpoint as checked without touching the processed-archive fields.
    async fn record_checked(&self, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn find_game(&self, app_id: &str) -> Result<Option<Game>, StoreError>;
    /// Insert `game` unless a game with the same app id exists; returns the stored game.
    async fn insert_game_if_absent(&self, game: &Game) -> Result<Game, StoreError>;
    async fn set_game_title(&self, game_id: Uuid, title: &str) -> Result<(), StoreError>;
    async fn append_game_report(&self, game_id: Uuid, report_id: Uuid) -> Result<(), StoreError>;
    async fn search_games_by_title(&self, pattern: &str) -> Result<Vec<Game>, StoreError>;
    async fn count_games(&self) -> Result<u64, StoreError>;

    async fn insert_report(&self, report: &Report) -> Result<(), StoreError>;
    async fn update_report(&self, report: &Report) -> Result<(), StoreError>;
    async fn get_report(&self, report_id: Uuid) -> Result<Option<Report>, StoreError>;
    async fn find_matching_report(&self, key: &DedupKey) -> Result<Option<Uuid>, StoreError>;
    async fn reports_for_game(
        &self,
        app_id: &str,
        version: Option<ReportVersion>,
    ) -> Result<Vec<Report>, StoreError>;
    async fn count_reports(&self, version: Option<ReportVersion>) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    checkpoint: Option<Checkpoint>,
    games: Vec<Game>,
    reports: Vec<Report>,
}

/// In-process store for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn game_mut<'a>(games: &'a mut [Game], game_id: Uuid) -> Result<&'a mut Game, StoreError> {
    games
        .iter_mut()
        .find(|g| g.id == game_id)
        .ok_or_else(|| StoreError::NotFound {
            kind: "game",
            id: game_id.to_string(),
        })
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.state.lock().await.checkpoint.clone())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.state.lock().await.checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    async fn record_checked(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.checkpoint.as_mut() {
            Some(checkpoint) => {
                checkpoint.last_checked_time = Some(at);
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: "checkpoint",
                id: "process_status".to_string(),
            }),
        }
    }

    async fn find_game(&self, app_id: &str) -> Result<Option<Game>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.games.iter().find(|g| g.app_id == app_id).cloned())
    }

    async fn insert_game_if_absent(&self, game: &Game) -> Result<Game, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.games.iter().find(|g| g.app_id == game.app_id) {
            return Ok(existing.clone());
        }
        state.games.push(game.clone());
        Ok(game.clone())
    }

    async fn set_game_title(&self, game_id: Uuid, title: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        game_mut(&mut state.games, game_id)?.title = Some(title.to_string());
        Ok(())
    }

    async fn append_game_report(&self, game_id: Uuid, report_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        game_mut(&mut state.games, game_id)?.reports.push(report_id);
        Ok(())
    }

    async fn search_games_by_title(&self, pattern: &str) -> Result<Vec<Game>, StoreError> {
        let re = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|err| StoreError::InvalidQuery(err.to_string()))?;
        let state = self.state.lock().await;
        Ok(state
            .games
            .iter()
            .filter(|g| g.title.as_deref().is_some_and(|t| re.is_match(t)))
            .cloned()
            .collect())
    }

    async fn count_games(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.games.len() as u64)
    }

    async fn insert_report(&self, report: &Report) -> Result<(), StoreError> {
        self.state.lock().await.reports.push(report.clone());
        Ok(())
    }

    async fn update_report(&self, report: &Report) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let existing = state
            .reports
            .iter_mut()
            .find(|r| r.id == report.id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "report",
                id: report.id.to_string(),
            })?;
        *existing = report.clone();
        Ok(())
    }

    async fn get_report(&self, report_id: Uuid) -> Result<Option<Report>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.reports.iter().find(|r| r.id == report_id).cloned())
    }

    async fn find_matching_report(&self, key: &DedupKey) -> Result<Option<Uuid>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .reports
            .iter()
            .find(|r| r.report_version == ReportVersion::V2 && key.matches(&r.data))
            .map(|r| r.id))
    }

    async fn reports_for_game(
        &self,
        app_id: &str,
        version: Option<ReportVersion>,
    ) -> Result<Vec<Report>, StoreError> {
        let state = self.state.lock().await;
        let Some(game) = state.games.iter().find(|g| g.app_id == app_id) else {
            return Ok(Vec::new());
        };
        Ok(state
            .reports
            .iter()
            .filter(|r| game.reports.contains(&r.id))
            .filter(|r| version.map_or(true, |v| r.report_version == v))
            .cloned()
            .collect())
    }

    async fn count_reports(&self, version: Option<ReportVersion>) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .reports
            .iter()
            .filter(|r| version.map_or(true, |v| r.report_version == v))
            .count() as u64)
    }
}
