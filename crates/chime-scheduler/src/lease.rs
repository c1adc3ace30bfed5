//! Lease coordination for in-memory scheduling ownership.
//!
//! A single advisory management record tracks which service instance owns
//! the in-memory scheduling window. The holder refreshes a heartbeat; a
//! competing instance may claim the record once the heartbeat is older than
//! the configured staleness threshold.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::RepositoryError;

/// The advisory ownership record. `token` and `last_heartbeat` are absent
/// while no instance holds the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobServiceManagementInfo {
    pub id: String,
    pub token: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl JobServiceManagementInfo {
    /// An unheld record.
    pub fn unheld(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: None,
            last_heartbeat: None,
        }
    }
}

/// Errors from lease operations.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The caller's token no longer matches the record; ownership is gone.
    #[error("lease token no longer held")]
    Lost,

    /// Backing store failure.
    #[error(transparent)]
    Store(#[from] RepositoryError),
}

/// Decides, given the current record, whether to write an updated one.
/// Returning `None` leaves the record unchanged.
pub type ComputeUpdate =
    Box<dyn FnOnce(JobServiceManagementInfo) -> Option<JobServiceManagementInfo> + Send>;

/// Store for the management record.
///
/// `get_and_update` must read the record under the store's lock or
/// transaction, apply the closure, and write back atomically, because
/// competing instances race on the claim.
#[async_trait]
pub trait ManagementStore: Send + Sync {
    /// Read the record (creating an unheld one if absent), apply `update`,
    /// persist the result if any, and return the record as stored.
    async fn get_and_update(
        &self,
        id: &str,
        update: ComputeUpdate,
    ) -> Result<JobServiceManagementInfo, RepositoryError>;

    /// Refresh `last_heartbeat`, but only while `info.token` still matches
    /// the stored token. A mismatch means the lease was lost.
    async fn heartbeat(
        &self,
        info: &JobServiceManagementInfo,
    ) -> Result<JobServiceManagementInfo, LeaseError>;

    /// Clear token and heartbeat. Succeeds only if the caller still holds
    /// the token.
    async fn release(&self, info: &JobServiceManagementInfo) -> Result<bool, RepositoryError>;
}

/// Non-durable management store for tests and single-instance deployments.
pub struct InMemoryManagementStore {
    records: Mutex<HashMap<String, JobServiceManagementInfo>>,
}

impl InMemoryManagementStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryManagementStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManagementStore for InMemoryManagementStore {
    async fn get_and_update(
        &self,
        id: &str,
        update: ComputeUpdate,
    ) -> Result<JobServiceManagementInfo, RepositoryError> {
        let mut records = self.records.lock().await;
        let current = records
            .entry(id.to_string())
            .or_insert_with(|| JobServiceManagementInfo::unheld(id));
        if let Some(updated) = update(current.clone()) {
            *current = updated;
        }
        Ok(current.clone())
    }

    async fn heartbeat(
        &self,
        info: &JobServiceManagementInfo,
    ) -> Result<JobServiceManagementInfo, LeaseError> {
        let mut records = self.records.lock().await;
        let current = records
            .get_mut(&info.id)
            .filter(|current| current.token == info.token && info.token.is_some())
            .ok_or(LeaseError::Lost)?;
        current.last_heartbeat = Some(Utc::now());
        Ok(current.clone())
    }

    async fn release(
        &self,
        info: &JobServiceManagementInfo,
    ) -> Result<bool, RepositoryError> {
        let mut records = self.records.lock().await;
        match records.get_mut(&info.id) {
            Some(current) if current.token == info.token && info.token.is_some() => {
                current.token = None;
                current.last_heartbeat = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Acquires and maintains the scheduling lease for one service instance.
///
/// Publishes leadership over a watch channel consumed by the scheduler and
/// window controller. Losing the lease demotes this instance (local timer
/// firing stops) and re-election continues in the background; it is never
/// escalated to a process crash.
pub struct LeaseKeeper {
    store: Arc<dyn ManagementStore>,
    record_id: String,
    token: String,
    heartbeat_interval: std::time::Duration,
    heartbeat_expiration: Duration,
    leadership_tx: watch::Sender<bool>,
}

impl LeaseKeeper {
    /// Create a keeper identified by `token` (typically the instance id).
    /// Returns the keeper and the leadership signal receiver.
    pub fn new(
        store: Arc<dyn ManagementStore>,
        record_id: impl Into<String>,
        token: impl Into<String>,
        config: &SchedulerConfig,
    ) -> (Self, watch::Receiver<bool>) {
        let (leadership_tx, leadership_rx) = watch::channel(false);
        (
            Self {
                store,
                record_id: record_id.into(),
                token: token.into(),
                heartbeat_interval: std::time::Duration::from_millis(
                    config.heartbeat_interval_millis,
                ),
                heartbeat_expiration: Duration::milliseconds(
                    config.heartbeat_expiration_millis as i64,
                ),
                leadership_tx,
            },
            leadership_rx,
        )
    }

    /// This instance's lease token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether this instance currently believes it holds the lease.
    pub fn is_leader(&self) -> bool {
        *self.leadership_tx.borrow()
    }

    fn info(&self) -> JobServiceManagementInfo {
        JobServiceManagementInfo {
            id: self.record_id.clone(),
            token: Some(self.token.clone()),
            last_heartbeat: None,
        }
    }

    /// Try to claim the lease. Succeeds when the record is unheld, already
    /// ours, or its heartbeat is stale past the expiration threshold.
    pub async fn try_acquire(&self) -> Result<bool, RepositoryError> {
        let token = self.token.clone();
        let expiration = self.heartbeat_expiration;
        let stored = self
            .store
            .get_and_update(
                &self.record_id,
                Box::new(move |current| {
                    let now = Utc::now();
                    let stale = current
                        .last_heartbeat
                        .map(|hb| now - hb > expiration)
                        .unwrap_or(true);
                    let claimable = current.token.is_none()
                        || current.token.as_deref() == Some(token.as_str())
                        || stale;
                    claimable.then(|| JobServiceManagementInfo {
                        id: current.id,
                        token: Some(token),
                        last_heartbeat: Some(now),
                    })
                }),
            )
            .await?;

        let leader = stored.token.as_deref() == Some(self.token.as_str());
        if leader && !self.is_leader() {
            info!(token = %self.token, "acquired scheduling lease");
        }
        self.set_leader(leader);
        Ok(leader)
    }

    /// Refresh the heartbeat. On [`LeaseError::Lost`] this instance is
    /// demoted and must stop firing local timers.
    pub async fn heartbeat_once(&self) -> Result<(), LeaseError> {
        match self.store.heartbeat(&self.info()).await {
            Ok(_) => Ok(()),
            Err(LeaseError::Lost) => {
                warn!(token = %self.token, "scheduling lease lost, demoting instance");
                self.set_leader(false);
                Err(LeaseError::Lost)
            }
            Err(e) => Err(e),
        }
    }

    /// Release the lease if still held.
    pub async fn release(&self) -> Result<bool, RepositoryError> {
        self.set_leader(false);
        self.store.release(&self.info()).await
    }

    /// Notify watchers only on actual transitions.
    fn set_leader(&self, leader: bool) {
        self.leadership_tx.send_if_modified(|current| {
            if *current != leader {
                *current = leader;
                true
            } else {
                false
            }
        });
    }

    /// Run the acquire/heartbeat loop until shutdown, releasing on exit.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(token = %self.token, "lease keeper starting");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if self.is_leader() {
                match self.heartbeat_once().await {
                    Ok(()) => debug!(token = %self.token, "heartbeat refreshed"),
                    Err(LeaseError::Lost) => {
                        // Demoted; fall through and compete again next tick.
                    }
                    Err(e) => warn!(error = %e, "heartbeat failed"),
                }
            } else if let Err(e) = self.try_acquire().await {
                warn!(error = %e, "lease acquisition failed");
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = sleep(self.heartbeat_interval) => {}
            }
        }

        if let Err(e) = self.release().await {
            warn!(error = %e, "failed to release lease on shutdown");
        }
        info!(token = %self.token, "lease keeper shut down");
    }
}
