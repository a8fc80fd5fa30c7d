mod alerts;
mod notification;
mod publish;
mod task_log;
pub mod types;

pub use task_log::NewDeadLetterArchive;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::platform::{NativePlatform, Platform};

pub const DB_FILE_NAME: &str = "alert-relay.db";

/// Durable state owned by the pipeline: publish log, notification log,
/// compensation task log, the alert archive and permanently failed
/// dead letters.
#[derive(Clone)]
pub struct AlertStore {
    db: Arc<Mutex<Connection>>,
}

impl AlertStore {
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            tokio::fs::create_dir_all(data_dir).await?;
        }
        NativePlatform::restrict_dir_permissions(data_dir);

        let db_path = data_dir.join(DB_FILE_NAME);
        let db = Connection::open(&db_path)?;
        NativePlatform::restrict_file_permissions(&db_path);
        init_schema(&db)?;
        info!("Alert store opened at {}", db_path.display());

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}

fn init_schema(db: &Connection) -> Result<()> {
    db.execute(
        "CREATE TABLE IF NOT EXISTS alert_publish_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL UNIQUE,
            alert_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL,
            retries INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL,
            error_message TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            sent_at INTEGER
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS alert_notification_log (
            record_id TEXT PRIMARY KEY,
            notification_id TEXT NOT NULL,
            alert_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            client_id TEXT NOT NULL,
            channel TEXT NOT NULL DEFAULT 'sse',
            status TEXT NOT NULL,
            ack_required INTEGER NOT NULL,
            ack_received INTEGER NOT NULL DEFAULT 0,
            ack_timeout_seconds INTEGER NOT NULL,
            retries INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL,
            content TEXT NOT NULL,
            error_message TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            sent_at INTEGER,
            ack_at INTEGER,
            UNIQUE (notification_id, client_id)
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS compensation_task_log (
            task_id TEXT PRIMARY KEY,
            task_type TEXT NOT NULL,
            result TEXT NOT NULL,
            processed_count INTEGER NOT NULL,
            success_count INTEGER NOT NULL,
            failed_count INTEGER NOT NULL,
            started_at INTEGER NOT NULL,
            completed_at INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            error_message TEXT,
            executor_host TEXT NOT NULL,
            details TEXT
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS alerts (
            alert_id TEXT PRIMARY KEY,
            message_id TEXT NOT NULL,
            task_id INTEGER NOT NULL,
            camera_id INTEGER NOT NULL,
            skill_id TEXT NOT NULL,
            alert_type TEXT NOT NULL,
            alert_level INTEGER NOT NULL,
            alert_name TEXT NOT NULL,
            description TEXT NOT NULL,
            alert_count INTEGER NOT NULL,
            first_timestamp INTEGER NOT NULL,
            last_timestamp INTEGER NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS dead_letter_archive (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT,
            alert_id TEXT,
            reason TEXT NOT NULL,
            dead_reason TEXT NOT NULL,
            death_count INTEGER NOT NULL,
            retry_count INTEGER NOT NULL,
            first_death_at INTEGER,
            payload TEXT NOT NULL,
            archived_at INTEGER NOT NULL
        )",
        [],
    )?;

    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_publish_status_created ON alert_publish_log(status, created_at)",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_notification_status_updated ON alert_notification_log(status, updated_at)",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_task_log_type_started ON compensation_task_log(task_type, started_at)",
        [],
    )?;

    Ok(())
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

/// `('A','B')` list for status filters built from fixed enum strings.
pub(crate) fn status_list(values: &[&'static str]) -> String {
    let quoted: Vec<String> = values.iter().map(|v| format!("'{}'", v)).collect();
    format!("({})", quoted.join(","))
}

/// In-memory store for tests.
#[cfg(test)]
pub fn test_store() -> AlertStore {
    AlertStore::open_in_memory().expect("open in-memory store")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_db_file() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let _store = AlertStore::open(&data_dir).await.unwrap();
        assert!(data_dir.join(DB_FILE_NAME).exists());
        // reopening keeps the schema idempotent
        let _again = AlertStore::open(&data_dir).await.unwrap();
    }

    #[test]
    fn status_list_quotes_values() {
        assert_eq!(status_list(&["PENDING", "FAILED"]), "('PENDING','FAILED')");
    }
}
