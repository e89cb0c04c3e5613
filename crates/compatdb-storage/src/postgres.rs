use async_trait::async_trait;
use chrono::{DateTime, Utc};
use compatdb_core::{Checkpoint, DedupKey, Game, Report, ReportVersion};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::store::{DocumentStore, StoreError};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS games (
        id UUID PRIMARY KEY,
        app_id TEXT NOT NULL,
        title TEXT,
        reports UUID[] NOT NULL DEFAULT '{}'
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS games_app_id_key ON games (app_id)",
    "CREATE INDEX IF NOT EXISTS games_title_idx ON games (title)",
    "CREATE TABLE IF NOT EXISTS reports (
        id UUID PRIMARY KEY,
        data JSONB NOT NULL,
        report_version TEXT NOT NULL CHECK (report_version IN ('V1', 'V2')),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS reports_version_idx ON reports (report_version)",
    "CREATE TABLE IF NOT EXISTS process_status (
        id SMALLINT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
        last_processed_file TEXT NOT NULL,
        last_processed_time TIMESTAMPTZ NOT NULL,
        last_checked_time TIMESTAMPTZ
    )",
];

/// Postgres-backed store keeping report payloads as JSONB documents.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!(statements = SCHEMA.len(), "schema ensured");
        Ok(())
    }
}

fn game_from_row(row: &PgRow) -> Result<Game, StoreError> {
    Ok(Game {
        id: row.try_get("id")?,
        app_id: row.try_get("app_id")?,
        title: row.try_get("title")?,
        reports: row.try_get("reports")?,
    })
}

fn report_from_row(row: &PgRow) -> Result<Report, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let data = match row.try_get::<JsonValue, _>("data")? {
        JsonValue::Object(map) => map,
        other => {
            return Err(StoreError::InvalidDocument(format!(
                "report {id} data is not an object: {other}"
            )))
        }
    };
    let version: String = row.try_get("report_version")?;
    let report_version = version
        .parse::<ReportVersion>()
        .map_err(|err| StoreError::InvalidDocument(err.to_string()))?;
    Ok(Report {
        id,
        data,
        report_version,
    })
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query(
            "SELECT last_processed_file, last_processed_time, last_checked_time
             FROM process_status WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<Checkpoint, StoreError> {
            Ok(Checkpoint {
                last_processed_file: row.try_get("last_processed_file")?,
                last_processed_time: row.try_get("last_processed_time")?,
                last_checked_time: row.try_get("last_checked_time")?,
            })
        })
        .transpose()
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO process_status (id, last_processed_file, last_processed_time, last_checked_time)
             VALUES (1, $1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET
                last_processed_file = EXCLUDED.last_processed_file,
                last_processed_time = EXCLUDED.last_processed_time,
                last_checked_time = EXCLUDED.last_checked_time",
        )
        .bind(&checkpoint.last_processed_file)
        .bind(checkpoint.last_processed_time)
        .bind(checkpoint.last_checked_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_checked(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE process_status SET last_checked_time = $1 WHERE id = 1")
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "checkpoint",
                id: "process_status".to_string(),
            });
        }
        Ok(())
    }

    async fn find_game(&self, app_id: &str) -> Result<Option<Game>, StoreError> {
        let row = sqlx::query("SELECT id, app_id, title, reports FROM games WHERE app_id = $1")
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(game_from_row).transpose()
    }

    async fn insert_game_if_absent(&self, game: &Game) -> Result<Game, StoreError> {
        sqlx::query(
            "INSERT INTO games (id, app_id, title, reports) VALUES ($1, $2, $3, $4)
             ON CONFLICT (app_id) DO NOTHING",
        )
        .bind(game.id)
        .bind(&game.app_id)
        .bind(&game.title)
        .bind(&game.reports)
        .execute(&self.pool)
        .await?;

        self.find_game(&game.app_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: "game",
                id: game.app_id.clone(),
            })
    }

    async fn set_game_title(&self, game_id: Uuid, title: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE games SET title = $2 WHERE id = $1")
            .bind(game_id)
            .bind(title)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "game",
                id: game_id.to_string(),
            });
        }
        Ok(())
    }

    async fn append_game_report(&self, game_id: Uuid, report_id: Uuid) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE games SET reports = array_append(reports, $2) WHERE id = $1")
                .bind(game_id)
                .bind(report_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "game",
                id: game_id.to_string(),
            });
        }
        Ok(())
    }

    async fn search_games_by_title(&self, pattern: &str) -> Result<Vec<Game>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, app_id, title, reports FROM games WHERE title ~* $1 ORDER BY title",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("2201B") => {
                StoreError::InvalidQuery(db.message().to_string())
            }
            other => StoreError::Database(other),
        })?;
        rows.iter().map(game_from_row).collect()
    }

    async fn count_games(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM games")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn insert_report(&self, report: &Report) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO reports (id, data, report_version) VALUES ($1, $2, $3)")
            .bind(report.id)
            .bind(JsonValue::Object(report.data.clone()))
            .bind(report.report_version.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_report(&self, report: &Report) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE reports SET data = $2, report_version = $3 WHERE id = $1")
                .bind(report.id)
                .bind(JsonValue::Object(report.data.clone()))
                .bind(report.report_version.as_str())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "report",
                id: report.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_report(&self, report_id: Uuid) -> Result<Option<Report>, StoreError> {
        let row = sqlx::query("SELECT id, data, report_version FROM reports WHERE id = $1")
            .bind(report_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(report_from_row).transpose()
    }

    async fn find_matching_report(&self, key: &DedupKey) -> Result<Option<Uuid>, StoreError> {
        let mut sql = String::from("SELECT id FROM reports WHERE report_version = 'V2'");
        let mut values = Vec::new();
        for (path, value) in key.fields() {
            values.push(value.cloned());
            sql.push_str(&format!(
                " AND (data #> '{{{}}}') IS NOT DISTINCT FROM ${}",
                path.join(","),
                values.len()
            ));
        }
        sql.push_str(" LIMIT 1");

        let mut query = sqlx::query_scalar::<_, Uuid>(&sql);
        for value in values {
            query = query.bind(value);
        }
        Ok(query.fetch_optional(&self.pool).await?)
    }

    async fn reports_for_game(
        &self,
        app_id: &str,
        version: Option<ReportVersion>,
    ) -> Result<Vec<Report>, StoreError> {
        let rows = sqlx::query(
            "SELECT r.id, r.data, r.report_version
             FROM games g JOIN reports r ON r.id = ANY(g.reports)
             WHERE g.app_id = $1 AND ($2::TEXT IS NULL OR r.report_version = $2)
             ORDER BY r.created_at",
        )
        .bind(app_id)
        .bind(version.map(ReportVersion::as_str))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(report_from_row).collect()
    }

    async fn count_reports(&self, version: Option<ReportVersion>) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM reports WHERE ($1::TEXT IS NULL OR report_version = $1)",
        )
        .bind(version.map(ReportVersion::as_str))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}
