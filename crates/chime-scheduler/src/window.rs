//! Window controller: loads the upcoming chunk of jobs into memory.
//!
//! Only a rolling window of upcoming jobs is ever held as live timers,
//! regardless of how many jobs are persisted far in the future. Each pass
//! queries the repository for scheduled/retrying jobs due within the next
//! chunk and feeds them into the scheduler's registration path; jobs already
//! tracked in-memory are skipped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::repository::JobRepository;
use crate::scheduler::JobScheduler;
use crate::types::JobStatus;

/// Statuses eligible for window loading.
const LOADABLE: [JobStatus; 2] = [JobStatus::Scheduled, JobStatus::Retry];

/// Periodically reloads the upcoming scheduling window from the repository.
pub struct WindowController {
    repository: Arc<dyn JobRepository>,
    scheduler: Arc<JobScheduler>,
    config: SchedulerConfig,
    leadership_rx: Option<watch::Receiver<bool>>,
}

impl WindowController {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        scheduler: Arc<JobScheduler>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repository,
            scheduler,
            config,
            leadership_rx: None,
        }
    }

    /// Only load windows while this instance holds the scheduling lease.
    pub fn with_leadership(mut self, leadership_rx: watch::Receiver<bool>) -> Self {
        self.leadership_rx = Some(leadership_rx);
        self
    }

    fn is_leader(&self) -> bool {
        self.leadership_rx
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(true)
    }

    /// Load one window `[from, now + chunk]` and register every job not
    /// already tracked in-memory. Returns the number of jobs registered.
    pub async fn load_window(&self, from: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let to = Utc::now() + self.config.chunk_duration();
        let jobs = self
            .repository
            .find_by_status_in_window(from, to, &LOADABLE)
            .await?;

        let mut registered = 0;
        for job in jobs {
            let job_id = job.id.clone();
            match self.scheduler.register_loaded(job).await {
                Ok(true) => registered += 1,
                Ok(false) => {}
                Err(SchedulerError::InvalidSchedule { reason, .. }) => {
                    // Overdue job found on a reload and force-execute is off.
                    // Left persisted for the operator; it is picked up again
                    // once the flag is enabled.
                    warn!(job_id = %job_id, reason, "could not register loaded job");
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "failed to register loaded job");
                }
            }
        }
        debug!(registered, until = %to, "window pass complete");
        Ok(registered)
    }

    /// Run the periodic loading loop until shutdown.
    ///
    /// The first pass queries from the epoch floor so that a restarted
    /// instance reconstructs every job the previous incarnation had in
    /// memory, including overdue ones, before any gap can occur. Leadership
    /// transitions wake the loop so a fresh leader does not wait out a full
    /// chunk interval before loading.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            chunk_minutes = self.config.scheduler_chunk_in_minutes,
            "window controller starting"
        );
        let interval = std::time::Duration::from_secs(self.config.scheduler_chunk_in_minutes * 60);
        let mut leadership_rx = self.leadership_rx.clone();
        let mut from = DateTime::<Utc>::MIN_UTC;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if self.is_leader() {
                let pass_started = Utc::now();
                match self.load_window(from).await {
                    Ok(count) => {
                        if count > 0 {
                            info!(count, "loaded jobs into the scheduling window");
                        }
                        // Next pass picks up where this one started looking.
                        from = pass_started;
                    }
                    Err(e) => warn!(error = %e, "window load failed"),
                }
            } else {
                // A fresh leader must reconstruct the full window.
                from = DateTime::<Utc>::MIN_UTC;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = sleep(interval) => {}
                _ = Self::leadership_changed(&mut leadership_rx) => {}
            }
        }

        info!("window controller shut down");
    }

    async fn leadership_changed(rx: &mut Option<watch::Receiver<bool>>) {
        match rx {
            Some(rx) => {
                if rx.changed().await.is_err() {
                    // Keeper gone; leadership can no longer change.
                    std::future::pending::<()>().await
                }
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Dispatcher, ExecutionResponse, RecipientExecutor};
    use crate::error::ExecutionError;
    use crate::events::NotificationPublisher;
    use crate::repository::InMemoryJobRepository;
    use crate::trigger::Trigger;
    use crate::types::{JobDetails, Recipient};
    use async_trait::async_trait;
    use chrono::Duration;

    struct NoopExecutor;

    #[async_trait]
    impl RecipientExecutor for NoopExecutor {
        async fn execute(&self, job: &JobDetails) -> Result<ExecutionResponse, ExecutionError> {
            Ok(ExecutionResponse {
                job_id: job.id.clone(),
                message: None,
            })
        }
    }

    fn setup(config: SchedulerConfig) -> (Arc<InMemoryJobRepository>, Arc<JobScheduler>, WindowController) {
        let repository = Arc::new(InMemoryJobRepository::new());
        let scheduler = Arc::new(JobScheduler::new(
            Arc::clone(&repository) as Arc<dyn JobRepository>,
            Dispatcher::new(Arc::new(NoopExecutor)),
            NotificationPublisher::new(),
            config.clone(),
        ));
        let controller = WindowController::new(
            Arc::clone(&repository) as Arc<dyn JobRepository>,
            Arc::clone(&scheduler),
            config,
        );
        (repository, scheduler, controller)
    }

    fn job(id: &str, fire_in_secs: i64) -> JobDetails {
        JobDetails::new(
            id,
            Trigger::point_in_time(Utc::now() + Duration::seconds(fire_in_secs)),
            Recipient::Http {
                url: "http://localhost/cb".to_string(),
                payload: None,
            },
        )
    }

    #[tokio::test]
    async fn test_loads_jobs_due_within_chunk() {
        let (repository, scheduler, controller) = setup(SchedulerConfig::default());
        repository.save(job("due-soon", 60)).await.unwrap();
        repository.save(job("due-later", 3_600)).await.unwrap();

        let count = controller.load_window(DateTime::<Utc>::MIN_UTC).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(scheduler.active_timers(), 1);
    }

    #[tokio::test]
    async fn test_skips_jobs_already_tracked() {
        let (_repository, scheduler, controller) = setup(SchedulerConfig::default());
        scheduler.schedule(job("tracked", 60)).await.unwrap();

        let count = controller.load_window(DateTime::<Utc>::MIN_UTC).await.unwrap();
        assert_eq!(count, 0);
        assert_eq!(scheduler.active_timers(), 1);
    }

    #[tokio::test]
    async fn test_loads_retry_jobs() {
        let (repository, scheduler, controller) = setup(SchedulerConfig::default());
        let mut retrying = job("retrying", 30);
        retrying.status = JobStatus::Retry;
        retrying.retries = 2;
        repository.save(retrying).await.unwrap();

        let count = controller.load_window(DateTime::<Utc>::MIN_UTC).await.unwrap();
        assert_eq!(count, 1);
        let loaded = scheduler.get("retrying").await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Retry);
        assert!(loaded.scheduled_id.is_some());
    }

    #[tokio::test]
    async fn test_overdue_job_left_persisted_without_force() {
        let (repository, scheduler, controller) = setup(SchedulerConfig::default());
        repository.save(job("overdue", -60)).await.unwrap();

        let count = controller.load_window(DateTime::<Utc>::MIN_UTC).await.unwrap();
        assert_eq!(count, 0);
        assert_eq!(scheduler.active_timers(), 0);
        assert!(repository.get("overdue").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_overdue_job_registered_with_force() {
        let (repository, scheduler, controller) = setup(SchedulerConfig {
            force_execute_expired_jobs: true,
            ..Default::default()
        });
        repository.save(job("overdue", -60)).await.unwrap();

        let count = controller.load_window(DateTime::<Utc>::MIN_UTC).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(scheduler.active_timers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leadership_gain_triggers_immediate_pass() {
        let (repository, scheduler, controller) = setup(SchedulerConfig::default());
        let (leadership_tx, leadership_rx) = watch::channel(false);
        let controller = Arc::new(controller.with_leadership(leadership_rx));
        repository.save(job("due-soon", 60)).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.run(shutdown_rx).await }
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(scheduler.active_timers(), 0);

        // Gaining the lease wakes the loop without waiting out the interval.
        leadership_tx.send(true).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(scheduler.active_timers(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_not_leader_skips_loading() {
        let (repository, scheduler, controller) = setup(SchedulerConfig::default());
        let (_leadership_tx, leadership_rx) = watch::channel(false);
        let controller = controller.with_leadership(leadership_rx);
        repository.save(job("due-soon", 60)).await.unwrap();

        assert!(!controller.is_leader());
        // run() consults leadership; a direct pass is still possible for
        // tests, so emulate the loop's gating here.
        if controller.is_leader() {
            controller.load_window(DateTime::<Utc>::MIN_UTC).await.unwrap();
        }
        assert_eq!(scheduler.active_timers(), 0);
    }
}
