use std::sync::Arc;

use compatdb_core::{
    normalize_app_id, AppIdError, DedupKey, Game, ParsedReport, Report, ReportV1, ReportV2,
    ReportVersion, WireReport,
};
use compatdb_storage::{DocumentStore, StoreError};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};
use uuid::Uuid;

/// Content-equality gate for V2 records.
#[derive(Clone)]
pub struct ReportDeduplicator {
    store: Arc<dyn DocumentStore>,
}

impl ReportDeduplicator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Id of a stored V2 report whose nine key fields equal the candidate's.
    pub async fn existing(
        &self,
        candidate: &Map<String, JsonValue>,
    ) -> Result<Option<Uuid>, StoreError> {
        let key = DedupKey::from_payload(candidate);
        self.store.find_matching_report(&key).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted {
        game_id: Uuid,
        report_id: Uuid,
        game_created: bool,
        title_updated: bool,
    },
    Duplicate {
        existing: Uuid,
    },
    Rejected(AppIdError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub archive: String,
    pub version: ReportVersion,
    pub records: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub games_created: usize,
    pub titles_updated: usize,
    /// Records were taken newest first because V2 reports already existed.
    pub reversed: bool,
}

impl IngestSummary {
    pub fn new(archive: impl Into<String>, version: ReportVersion, records: usize) -> Self {
        Self {
            archive: archive.into(),
            version,
            records,
            inserted: 0,
            duplicates: 0,
            rejected: 0,
            games_created: 0,
            titles_updated: 0,
            reversed: false,
        }
    }

    pub fn record(&mut self, outcome: &RecordOutcome) {
        match outcome {
            RecordOutcome::Inserted {
                game_created,
                title_updated,
                ..
            } => {
                self.inserted += 1;
                self.games_created += usize::from(*game_created);
                self.titles_updated += usize::from(*title_updated);
            }
            RecordOutcome::Duplicate { .. } => self.duplicates += 1,
            RecordOutcome::Rejected(_) => self.rejected += 1,
        }
    }
}

/// Writes accepted records: game get-or-create, title refresh, report insert and link.
#[derive(Clone)]
pub struct IngestionUpserter {
    store: Arc<dyn DocumentStore>,
    dedup: ReportDeduplicator,
}

impl IngestionUpserter {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            dedup: ReportDeduplicator::new(store.clone()),
            store,
        }
    }

    pub async fn ingest_v1(
        &self,
        parsed: &ParsedReport<ReportV1>,
    ) -> Result<RecordOutcome, StoreError> {
        self.ingest(parsed, None).await
    }

    pub async fn ingest_v2(
        &self,
        parsed: &ParsedReport<ReportV2>,
    ) -> Result<RecordOutcome, StoreError> {
        self.ingest(parsed, Some(&self.dedup)).await
    }

    /// Stored game for `app_id`, creating it with `title` if absent. The flag is true on creation.
    pub async fn get_or_create_game(
        &self,
        app_id: &str,
        title: Option<&str>,
    ) -> Result<(Game, bool), StoreError> {
        if let Some(game) = self.store.find_game(app_id).await? {
            return Ok((game, false));
        }
        let candidate = Game::new(app_id, title.map(str::to_string));
        let stored = self.store.insert_game_if_absent(&candidate).await?;
        let created = stored.id == candidate.id;
        Ok((stored, created))
    }

    async fn ingest<T: WireReport>(
        &self,
        parsed: &ParsedReport<T>,
        dedup: Option<&ReportDeduplicator>,
    ) -> Result<RecordOutcome, StoreError> {
        let app_id = match parsed
            .record
            .app_id_value()
            .ok_or(AppIdError::Missing)
            .and_then(normalize_app_id)
        {
            Ok(app_id) => app_id,
            Err(err) => {
                warn!(error = %err, version = %T::VERSION, "skipping record without usable app id");
                return Ok(RecordOutcome::Rejected(err));
            }
        };

        let title = parsed.record.title();
        let (game, game_created) = self.get_or_create_game(&app_id, title).await?;

        let mut title_updated = false;
        if let Some(title) = title {
            if game.title.as_deref() != Some(title) {
                self.store.set_game_title(game.id, title).await?;
                title_updated = true;
                debug!(%app_id, title, "game title updated");
            }
        }

        if let Some(dedup) = dedup {
            if let Some(existing) = dedup.existing(&parsed.raw).await? {
                debug!(%app_id, %existing, "duplicate report skipped");
                return Ok(RecordOutcome::Duplicate { existing });
            }
        }

        let report = Report::new(parsed.raw.clone(), T::VERSION);
        self.store.insert_report(&report).await?;
        self.store.append_game_report(game.id, report.id).await?;

        Ok(RecordOutcome::Inserted {
            game_id: game.id,
            report_id: report.id,
            game_created,
            title_updated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compatdb_storage::MemoryStore;
    use serde_json::json;

    fn v2(app_id: JsonValue, title: &str, timestamp: i64) -> ParsedReport<ReportV2> {
        let raw = match json!({
            "app": { "steam": { "appId": app_id }, "title": title },
            "timestamp": timestamp,
            "responses": { "verdict": "yes" },
            "systemInfo": { "cpu": "Ryzen", "gpu": "RX 6800", "gpuDriver": "Mesa",
                            "kernel": "6.5", "os": "Arch", "ram": "32 GB" }
        }) {
            JsonValue::Object(map) => map,
            _ => unreachable!(),
        };
        let record = serde_json::from_value(JsonValue::Object(raw.clone())).expect("v2 record");
        ParsedReport { record, raw }
    }

    fn v1(app_id: JsonValue, title: Option<&str>) -> ParsedReport<ReportV1> {
        let raw = match json!({ "appId": app_id, "title": title, "rating": "Gold" }) {
            JsonValue::Object(map) => map,
            _ => unreachable!(),
        };
        let record = serde_json::from_value(JsonValue::Object(raw.clone())).expect("v1 record");
        ParsedReport { record, raw }
    }

    #[tokio::test]
    async fn v2_duplicates_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let upserter = IngestionUpserter::new(store.clone());
        let record = v2(json!("620"), "Portal 2", 1_600_000_000);

        let first = upserter.ingest_v2(&record).await.expect("first");
        let RecordOutcome::Inserted { report_id, game_created, .. } = first else {
            panic!("expected an insert");
        };
        assert!(game_created);

        let second = upserter.ingest_v2(&record).await.expect("second");
        assert_eq!(second, RecordOutcome::Duplicate { existing: report_id });
        assert_eq!(store.count_reports(None).await.expect("count"), 1);

        let game = store.find_game("620").await.expect("find").expect("game");
        assert_eq!(game.reports, vec![report_id]);
    }

    #[tokio::test]
    async fn v1_records_are_never_deduplicated() {
        let store = Arc::new(MemoryStore::new());
        let upserter = IngestionUpserter::new(store.clone());
        let record = v1(json!("400"), Some("Portal"));

        upserter.ingest_v1(&record).await.expect("first");
        upserter.ingest_v1(&record).await.expect("second");

        assert_eq!(store.count_reports(Some(ReportVersion::V1)).await.expect("count"), 2);
        assert_eq!(store.count_games().await.expect("games"), 1);
    }

    #[tokio::test]
    async fn title_changes_update_the_existing_game() {
        let store = Arc::new(MemoryStore::new());
        let upserter = IngestionUpserter::new(store.clone());

        upserter
            .ingest_v1(&v1(json!("4.56e8"), Some("Old Title")))
            .await
            .expect("v1");
        let outcome = upserter
            .ingest_v2(&v2(json!(456000000), "New Title", 1))
            .await
            .expect("v2");

        assert!(matches!(
            outcome,
            RecordOutcome::Inserted { game_created: false, title_updated: true, .. }
        ));
        let game = store.find_game("456000000").await.expect("find").expect("game");
        assert_eq!(game.title.as_deref(), Some("New Title"));
        assert_eq!(game.reports.len(), 2);
        assert_eq!(store.count_games().await.expect("games"), 1);
    }

    #[tokio::test]
    async fn untitled_records_keep_the_stored_title() {
        let store = Arc::new(MemoryStore::new());
        let upserter = IngestionUpserter::new(store.clone());

        upserter.ingest_v1(&v1(json!("10"), Some("Counter-Strike"))).await.expect("titled");
        let outcome = upserter.ingest_v1(&v1(json!("10"), None)).await.expect("untitled");

        assert!(matches!(outcome, RecordOutcome::Inserted { title_updated: false, .. }));
        let game = store.find_game("10").await.expect("find").expect("game");
        assert_eq!(game.title.as_deref(), Some("Counter-Strike"));
    }

    #[tokio::test]
    async fn records_without_app_id_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        let upserter = IngestionUpserter::new(store.clone());

        let outcome = upserter.ingest_v1(&v1(json!(null), Some("Nameless"))).await.expect("ingest");
        assert_eq!(outcome, RecordOutcome::Rejected(AppIdError::Missing));
        assert_eq!(store.count_games().await.expect("games"), 0);
        assert_eq!(store.count_reports(None).await.expect("reports"), 0);
    }

    #[test]
    fn summary_tallies_outcomes() {
        let mut summary = IngestSummary::new("reports/reports_nov1_2019.tar.gz", ReportVersion::V2, 3);
        summary.record(&RecordOutcome::Inserted {
            game_id: Uuid::new_v4(),
            report_id: Uuid::new_v4(),
            game_created: true,
            title_updated: false,
        });
        summary.record(&RecordOutcome::Duplicate { existing: Uuid::new_v4() });
        summary.record(&RecordOutcome::Rejected(AppIdError::Missing));

        assert_eq!(
            (summary.inserted, summary.duplicates, summary.rejected, summary.games_created),
            (1, 1, 1, 1)
        );
    }
}
