//! SQLite event log for the pipeline daemon.
//!
//! Append-only store of observability events read by external collectors.

use chrono::{DateTime, Utc};
use pipeline_core::{events::EventPayload, Id};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

pub const EVENT_LOG_FILE: &str = "events.db";

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EventLogError>;

/// An event as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEvent {
    pub id: Id,
    /// Event type name (e.g., `PHASE_STARTED`, `HUMAN_REQUIRED`).
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<Id>,
    pub payload_json: String,
}

#[derive(Debug)]
pub struct EventLog {
    pool: Pool<Sqlite>,
}

impl EventLog {
    /// Open (or create) the log at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Apply the schema compiled into the binary.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    sqlx::query(trimmed).execute(&self.pool).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn append(&self, payload: &EventPayload) -> Result<LoggedEvent> {
        let id = Id::new();
        let now = Utc::now();
        let event_type = payload.event_type().as_str().to_string();
        let task_id = payload.task_id().cloned();
        let payload_json = payload.to_json()?;

        sqlx::query(
            "INSERT INTO events (id, type, ts, task_id, payload_json) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id.0.as_str())
        .bind(&event_type)
        .bind(now.timestamp_millis())
        .bind(task_id.as_ref().map(|id| id.0.as_str()))
        .bind(&payload_json)
        .execute(&self.pool)
        .await?;

        Ok(LoggedEvent {
            id,
            event_type,
            timestamp: now,
            task_id,
            payload_json,
        })
    }

    /// All events in append order.
    pub async fn list(&self) -> Result<Vec<LoggedEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, type, ts, task_id, payload_json FROM events ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    /// Events recorded for one task, in append order.
    pub async fn list_for_task(&self, task_id: &Id) -> Result<Vec<LoggedEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, type, ts, task_id, payload_json FROM events WHERE task_id = ?1 ORDER BY seq ASC",
        )
        .bind(task_id.0.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    ts: i64,
    task_id: Option<String>,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> LoggedEvent {
        LoggedEvent {
            id: Id::from_string(self.id),
            event_type: self.event_type,
            timestamp: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
            task_id: self.task_id.map(Id::from_string),
            payload_json: self.payload_json,
        }
    }
}
