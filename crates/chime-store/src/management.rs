//! SQLite-backed management store for the scheduling lease.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior, params};

use chime_scheduler::{
    ComputeUpdate, JobServiceManagementInfo, LeaseError, ManagementStore, RepositoryError,
};

use crate::error::StoreError;

const MANAGEMENT_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS management (
    id             TEXT PRIMARY KEY,
    token          TEXT,
    last_heartbeat INTEGER
);
";

/// Durable management record store. The single advisory row is read and
/// written inside immediate transactions, which take the database write
/// lock and serialize competing claims.
#[derive(Clone)]
pub struct SqliteManagementStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteManagementStore {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        conn.execute_batch(MANAGEMENT_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Share the job repository's connection so both stores live in one
    /// database file.
    pub fn with_connection(conn: Arc<Mutex<Connection>>) -> Result<Self, StoreError> {
        {
            let guard = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            guard.execute_batch(MANAGEMENT_SCHEMA)?;
        }
        Ok(Self { conn })
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

    fn read_row(
        tx: &rusqlite::Transaction<'_>,
        id: &str,
    ) -> Result<JobServiceManagementInfo, StoreError> {
        let mut stmt =
            tx.prepare("SELECT token, last_heartbeat FROM management WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => {
                let token: Option<String> = row.get(0)?;
                let heartbeat_millis: Option<i64> = row.get(1)?;
                Ok(JobServiceManagementInfo {
                    id: id.to_string(),
                    token,
                    last_heartbeat: heartbeat_millis.and_then(DateTime::from_timestamp_millis),
                })
            }
            None => Ok(JobServiceManagementInfo::unheld(id)),
        }
    }

    fn write_row(
        tx: &rusqlite::Transaction<'_>,
        info: &JobServiceManagementInfo,
    ) -> Result<(), StoreError> {
        tx.execute(
            "INSERT INTO management (id, token, last_heartbeat)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 token = excluded.token,
                 last_heartbeat = excluded.last_heartbeat",
            params![
                info.id,
                info.token,
                info.last_heartbeat.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl ManagementStore for SqliteManagementStore {
    async fn get_and_update(
        &self,
        id: &str,
        update: ComputeUpdate,
    ) -> Result<JobServiceManagementInfo, RepositoryError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = Self::read_row(&tx, &id)?;
            let stored = match update(current.clone()) {
                Some(updated) => {
                    Self::write_row(&tx, &updated)?;
                    updated
                }
                None => {
                    // First read still materializes the unheld row.
                    Self::write_row(&tx, &current)?;
                    current
                }
            };
            tx.commit()?;
            Ok(stored)
        })
        .await
        .map_err(RepositoryError::from)
    }

    async fn heartbeat(
        &self,
        info: &JobServiceManagementInfo,
    ) -> Result<JobServiceManagementInfo, LeaseError> {
        let Some(token) = info.token.clone() else {
            return Err(LeaseError::Lost);
        };
        let id = info.id.clone();
        let refreshed = self
            .with_conn(move |conn| {
                let now = Utc::now();
                let changed = conn.execute(
                    "UPDATE management SET last_heartbeat = ?1 WHERE id = ?2 AND token = ?3",
                    params![now.timestamp_millis(), id, token],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                Ok(Some(JobServiceManagementInfo {
                    id,
                    token: Some(token),
                    last_heartbeat: Some(now),
                }))
            })
            .await
            .map_err(|e| LeaseError::Store(RepositoryError::from(e)))?;
        refreshed.ok_or(LeaseError::Lost)
    }

    async fn release(
        &self,
        info: &JobServiceManagementInfo,
    ) -> Result<bool, RepositoryError> {
        let Some(token) = info.token.clone() else {
            return Ok(false);
        };
        let id = info.id.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE management SET token = NULL, last_heartbeat = NULL
                 WHERE id = ?1 AND token = ?2",
                params![id, token],
            )?;
            Ok(changed > 0)
        })
        .await
        .map_err(RepositoryError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    const RECORD: &str = "scheduling-lease";

    fn claim(token: &str) -> ComputeUpdate {
        let token = token.to_string();
        Box::new(move |current: JobServiceManagementInfo| {
            current.token.is_none().then(|| JobServiceManagementInfo {
                id: current.id,
                token: Some(token),
                last_heartbeat: Some(Utc::now()),
            })
        })
    }

    #[tokio::test]
    async fn test_claim_and_read_back() {
        let dir = tempdir().unwrap();
        let store = SqliteManagementStore::open(dir.path().join("mgmt.db")).unwrap();

        let stored = store.get_and_update(RECORD, claim("instance-a")).await.unwrap();
        assert_eq!(stored.token.as_deref(), Some("instance-a"));
        assert!(stored.last_heartbeat.is_some());

        // Second claimant observes the row held and leaves it unchanged.
        let observed = store.get_and_update(RECORD, claim("instance-b")).await.unwrap();
        assert_eq!(observed.token.as_deref(), Some("instance-a"));
    }

    #[tokio::test]
    async fn test_heartbeat_requires_matching_token() {
        let dir = tempdir().unwrap();
        let store = SqliteManagementStore::open(dir.path().join("mgmt.db")).unwrap();
        let held = store.get_and_update(RECORD, claim("instance-a")).await.unwrap();

        let refreshed = store.heartbeat(&held).await.unwrap();
        assert!(refreshed.last_heartbeat.unwrap() >= held.last_heartbeat.unwrap());

        let intruder = JobServiceManagementInfo {
            id: RECORD.to_string(),
            token: Some("instance-b".to_string()),
            last_heartbeat: None,
        };
        assert!(matches!(
            store.heartbeat(&intruder).await,
            Err(LeaseError::Lost)
        ));
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let dir = tempdir().unwrap();
        let store = SqliteManagementStore::open(dir.path().join("mgmt.db")).unwrap();
        let held = store.get_and_update(RECORD, claim("instance-a")).await.unwrap();

        let intruder = JobServiceManagementInfo {
            id: RECORD.to_string(),
            token: Some("instance-b".to_string()),
            last_heartbeat: None,
        };
        assert!(!store.release(&intruder).await.unwrap());
        assert!(store.release(&held).await.unwrap());

        let after = store.get_and_update(RECORD, Box::new(|_| None)).await.unwrap();
        assert!(after.token.is_none());
        assert!(after.last_heartbeat.is_none());
    }

    #[tokio::test]
    async fn test_stale_takeover_via_compute_update() {
        let dir = tempdir().unwrap();
        let store = SqliteManagementStore::open(dir.path().join("mgmt.db")).unwrap();

        // Seed a stale holder.
        store
            .get_and_update(
                RECORD,
                Box::new(|current| {
                    Some(JobServiceManagementInfo {
                        id: current.id,
                        token: Some("instance-a".to_string()),
                        last_heartbeat: Some(Utc::now() - Duration::minutes(5)),
                    })
                }),
            )
            .await
            .unwrap();

        // Competitor claims when the heartbeat is older than its threshold.
        let threshold = Duration::seconds(10);
        let stored = store
            .get_and_update(
                RECORD,
                Box::new(move |current| {
                    let stale = current
                        .last_heartbeat
                        .map(|hb| Utc::now() - hb > threshold)
                        .unwrap_or(true);
                    stale.then(|| JobServiceManagementInfo {
                        id: current.id,
                        token: Some("instance-b".to_string()),
                        last_heartbeat: Some(Utc::now()),
                    })
                }),
            )
            .await
            .unwrap();
        assert_eq!(stored.token.as_deref(), Some("instance-b"));
    }
}
