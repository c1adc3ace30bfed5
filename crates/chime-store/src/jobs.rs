//! SQLite-backed job repository.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior, params};
use tracing::info;

use chime_scheduler::{JobDetails, JobRepository, JobStatus, RepositoryError};

use crate::error::StoreError;

/// Schema for the jobs table. The full record lives in `document`; the
/// indexed columns exist for the status/fire-time/priority range queries.
/// Upserts keep the original rowid, which preserves insertion order within
/// a priority level.
const JOBS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id             TEXT PRIMARY KEY,
    status         TEXT NOT NULL,
    priority       INTEGER NOT NULL,
    next_fire_time INTEGER,
    last_update    INTEGER NOT NULL,
    document       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_fire_time ON jobs(next_fire_time);
";

/// Durable job repository over a SQLite database file.
#[derive(Clone)]
pub struct SqliteJobRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobRepository {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        conn.execute_batch(JOBS_SCHEMA)?;
        info!(path = %path.as_ref().display(), "opened job store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Expose the underlying connection for co-located stores.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    fn row_to_job(document: String) -> Result<JobDetails, StoreError> {
        Ok(serde_json::from_str(&document)?)
    }

    /// Build `status IN (...)` placeholders plus their bound values.
    fn status_filter(statuses: &[JobStatus]) -> (String, Vec<rusqlite::types::Value>) {
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let values = statuses
            .iter()
            .map(|s| rusqlite::types::Value::Text(s.to_string()))
            .collect();
        (placeholders, values)
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn save(&self, job: JobDetails) -> Result<JobDetails, RepositoryError> {
        let stored = job.clone();
        self.with_conn(move |conn| {
            let document = serde_json::to_string(&job)?;
            let next_fire_time = job
                .trigger
                .has_next_fire_time()
                .map(|t| t.timestamp_millis());
            conn.execute(
                "INSERT INTO jobs (id, status, priority, next_fire_time, last_update, document)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                     status = excluded.status,
                     priority = excluded.priority,
                     next_fire_time = excluded.next_fire_time,
                     last_update = excluded.last_update,
                     document = excluded.document",
                params![
                    job.id,
                    job.status.to_string(),
                    job.priority,
                    next_fire_time,
                    job.last_update.timestamp_millis(),
                    document,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(RepositoryError::from)?;
        Ok(stored)
    }

    async fn get(&self, id: &str) -> Result<Option<JobDetails>, RepositoryError> {
        let id = id.to_string();
        let document = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare("SELECT document FROM jobs WHERE id = ?1")?;
                let mut rows = stmt.query(params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(RepositoryError::from)?;
        document
            .map(Self::row_to_job)
            .transpose()
            .map_err(RepositoryError::from)
    }

    async fn exists(&self, id: &str) -> Result<bool, RepositoryError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
        .map_err(RepositoryError::from)
    }

    async fn delete(&self, id: &str) -> Result<Option<JobDetails>, RepositoryError> {
        let id = id.to_string();
        let document = self
            .with_conn(move |conn| {
                // Competing deletes must not both observe the row.
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let existing: Option<String> = {
                    let mut stmt = tx.prepare("SELECT document FROM jobs WHERE id = ?1")?;
                    let mut rows = stmt.query(params![id])?;
                    match rows.next()? {
                        Some(row) => Some(row.get(0)?),
                        None => None,
                    }
                };
                if existing.is_some() {
                    tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
                }
                tx.commit()?;
                Ok(existing)
            })
            .await
            .map_err(RepositoryError::from)?;
        document
            .map(Self::row_to_job)
            .transpose()
            .map_err(RepositoryError::from)
    }

    async fn find_by_status(
        &self,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobDetails>, RepositoryError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let (placeholders, values) = Self::status_filter(statuses);
        let documents = self
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT document FROM jobs WHERE status IN ({placeholders})
                     ORDER BY priority DESC, rowid ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(values), |row| {
                    row.get::<_, String>(0)
                })?;
                let mut documents = Vec::new();
                for row in rows {
                    documents.push(row?);
                }
                Ok(documents)
            })
            .await
            .map_err(RepositoryError::from)?;
        documents
            .into_iter()
            .map(|d| Self::row_to_job(d).map_err(RepositoryError::from))
            .collect()
    }

    async fn find_by_status_in_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobDetails>, RepositoryError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let (placeholders, mut values) = Self::status_filter(statuses);
        values.push(rusqlite::types::Value::Integer(from.timestamp_millis()));
        values.push(rusqlite::types::Value::Integer(to.timestamp_millis()));
        let documents = self
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT document FROM jobs
                     WHERE status IN ({placeholders})
                       AND next_fire_time IS NOT NULL
                       AND next_fire_time >= ?
                       AND next_fire_time <= ?
                     ORDER BY priority DESC, rowid ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(values), |row| {
                    row.get::<_, String>(0)
                })?;
                let mut documents = Vec::new();
                for row in rows {
                    documents.push(row?);
                }
                Ok(documents)
            })
            .await
            .map_err(RepositoryError::from)?;
        documents
            .into_iter()
            .map(|d| Self::row_to_job(d).map_err(RepositoryError::from))
            .collect()
    }
}
