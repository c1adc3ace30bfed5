//! Service command for running Chime's scheduling loops.
//!
//! Builds every collaborator explicitly and wires them together:
//! - Job repository and management store (SQLite or in-memory)
//! - HTTP callback executor behind the dispatcher
//! - Scheduler event loop, window controller, lease keeper
//! - Notification log consumer

use std::path::PathBuf;
use std::sync::Arc;

use miette::{IntoDiagnostic, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use chime_scheduler::{
    Dispatcher, InMemoryJobRepository, InMemoryManagementStore, JobRepository, JobScheduler,
    LeaseKeeper, ManagementStore, NotificationPublisher, SchedulerConfig, WindowController,
};
use chime_store::{SqliteJobRepository, SqliteManagementStore};

use crate::callback::HttpCallbackExecutor;

/// Id of the single advisory lease record.
const LEASE_RECORD_ID: &str = "scheduling-lease";

/// Configuration for the service command.
pub struct ServiceConfig {
    /// SQLite database file; `None` runs with non-durable in-memory stores.
    pub db_path: Option<PathBuf>,
    /// Identity written into the lease record; generated when omitted.
    pub instance_id: Option<String>,
    pub scheduler: SchedulerConfig,
}

/// Run the scheduling service until ctrl-c.
pub async fn run_service(config: ServiceConfig) -> Result<()> {
    let (repository, management): (Arc<dyn JobRepository>, Arc<dyn ManagementStore>) =
        match &config.db_path {
            Some(path) => {
                let jobs = SqliteJobRepository::open(path).into_diagnostic()?;
                let management =
                    SqliteManagementStore::with_connection(jobs.connection()).into_diagnostic()?;
                (Arc::new(jobs), Arc::new(management))
            }
            None => {
                warn!("no database path configured, job state will not survive restarts");
                (
                    Arc::new(InMemoryJobRepository::new()),
                    Arc::new(InMemoryManagementStore::new()),
                )
            }
        };

    let instance_id = config
        .instance_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(instance_id = %instance_id, "starting chime service");

    let publisher = NotificationPublisher::new();
    let (lease_keeper, leadership_rx) = LeaseKeeper::new(
        Arc::clone(&management),
        LEASE_RECORD_ID,
        instance_id,
        &config.scheduler,
    );
    let lease_keeper = Arc::new(lease_keeper);

    let scheduler = Arc::new(
        JobScheduler::new(
            Arc::clone(&repository),
            Dispatcher::new(Arc::new(HttpCallbackExecutor::new())),
            publisher.clone(),
            config.scheduler.clone(),
        )
        .with_leadership(leadership_rx.clone()),
    );

    let window = WindowController::new(
        Arc::clone(&repository),
        Arc::clone(&scheduler),
        config.scheduler.clone(),
    )
    .with_leadership(leadership_rx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let lease_handle = tokio::spawn({
        let lease_keeper = Arc::clone(&lease_keeper);
        let shutdown_rx = shutdown_rx.clone();
        async move { lease_keeper.run(shutdown_rx).await }
    });
    let scheduler_handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let shutdown_rx = shutdown_rx.clone();
        async move { scheduler.run(shutdown_rx).await }
    });
    let window_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { window.run(shutdown_rx).await }
    });

    // Mirror status changes into the service log.
    let events_handle = tokio::spawn({
        let mut events = publisher.subscribe();
        async move {
            loop {
                match events.recv().await {
                    Ok(event) => info!(
                        job_id = %event.job_id,
                        status = %event.status,
                        retries = event.retries,
                        executions = event.execution_counter,
                        "job status changed"
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification log consumer lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });

    tokio::signal::ctrl_c().await.into_diagnostic()?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(lease_handle, scheduler_handle, window_handle);
    events_handle.abort();
    info!("chime service stopped");
    Ok(())
}
