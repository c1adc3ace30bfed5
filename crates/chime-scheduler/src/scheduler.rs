//! Scheduler core: the job state machine.
//!
//! All state transitions for a job funnel through this type: scheduling,
//! timer registration, dispatch, success/failure handling, retries, and
//! cancellation. Fired timers and execution outcomes arrive on channels and
//! are processed by a single event loop, which serializes transitions while
//! leaving delivery of different jobs fully parallel.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::dispatcher::{Dispatcher, ExecutionOutcome, ExecutionResponse};
use crate::error::{ExecutionError, RepositoryError, SchedulerError};
use crate::events::{JobStatusEvent, NotificationPublisher};
use crate::repository::JobRepository;
use crate::timer::{FiredTimer, TimerService};
use crate::trigger::Trigger;
use crate::types::{JobDetails, JobStatus};

/// Minimal delay applied when force-executing a job whose fire time passed.
const EXPIRED_JOB_DELAY_MILLIS: i64 = 1;

/// The scheduler.
pub struct JobScheduler {
    repository: Arc<dyn JobRepository>,
    timers: TimerService,
    dispatcher: Dispatcher,
    publisher: NotificationPublisher,
    config: SchedulerConfig,
    /// Cache of live in-memory registrations: job id to the fire time last
    /// armed. Reconstructible from the repository; never authoritative.
    registered: DashMap<String, DateTime<Utc>>,
    outcome_tx: mpsc::UnboundedSender<ExecutionOutcome>,
    fired_rx: Mutex<Option<mpsc::UnboundedReceiver<FiredTimer>>>,
    outcome_rx: Mutex<Option<mpsc::UnboundedReceiver<ExecutionOutcome>>>,
    leadership_rx: Option<watch::Receiver<bool>>,
}

impl JobScheduler {
    /// Create a scheduler over the given repository and dispatcher.
    pub fn new(
        repository: Arc<dyn JobRepository>,
        dispatcher: Dispatcher,
        publisher: NotificationPublisher,
        config: SchedulerConfig,
    ) -> Self {
        let (timers, fired_rx) = TimerService::new();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            repository,
            timers,
            dispatcher,
            publisher,
            config,
            registered: DashMap::new(),
            outcome_tx,
            fired_rx: Mutex::new(Some(fired_rx)),
            outcome_rx: Mutex::new(Some(outcome_rx)),
            leadership_rx: None,
        }
    }

    /// Gate timer firing on the given leadership signal. Without one the
    /// instance always considers itself the owner (single-instance mode).
    pub fn with_leadership(mut self, leadership_rx: watch::Receiver<bool>) -> Self {
        self.leadership_rx = Some(leadership_rx);
        self
    }

    /// Whether this instance currently owns the in-memory window.
    pub fn is_leader(&self) -> bool {
        self.leadership_rx
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(true)
    }

    /// Number of live timer registrations.
    pub fn active_timers(&self) -> usize {
        self.timers.active_count()
    }

    /// Schedule a job, or re-schedule an id that already exists.
    ///
    /// Replace-by-id: if the stored job is still `Scheduled`, its
    /// registration is canceled and the old record deleted before the
    /// incoming descriptor is applied. A `Retry` record keeps running under
    /// its own clock. Any other stored status means the job is already
    /// resolved and the call returns the stored row unchanged.
    pub async fn schedule(&self, job: JobDetails) -> Result<JobDetails, SchedulerError> {
        if let Some(existing) = self.repository.get(&job.id).await? {
            match existing.status {
                JobStatus::Scheduled => {
                    info!(job_id = %job.id, "replacing scheduled job");
                    self.unregister(&existing);
                    self.repository.delete(&existing.id).await?;
                }
                JobStatus::Retry => {
                    return self.ensure_retry_registered(existing).await;
                }
                _ => {
                    debug!(job_id = %job.id, status = %existing.status, "job already resolved");
                    return Ok(existing);
                }
            }
        }
        self.do_schedule(job).await
    }

    /// Fetch a job by id. Terminal jobs are deleted on transition, so a
    /// resolved job reads back as absent.
    pub async fn get(&self, id: &str) -> Result<Option<JobDetails>, SchedulerError> {
        Ok(self.repository.get(id).await?)
    }

    /// List persisted jobs in the given statuses, priority first.
    pub async fn list_by_status(
        &self,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobDetails>, SchedulerError> {
        Ok(self.repository.find_by_status(statuses).await?)
    }

    /// Cancel a job: disarm its timer if registered, then delete the
    /// persisted record. Idempotent; canceling an unknown id is a no-op.
    pub async fn cancel(&self, id: &str) -> Result<Option<JobDetails>, SchedulerError> {
        if let Some(existing) = self.repository.get(id).await? {
            self.unregister(&existing);
        }
        match self.repository.delete(id).await? {
            Some(mut job) => {
                job.status = JobStatus::Canceled;
                job.scheduled_id = None;
                job.last_update = Utc::now();
                self.publisher.publish(JobStatusEvent::from_job(&job));
                info!(job_id = %id, "canceled job");
                Ok(Some(job))
            }
            None => {
                debug!(job_id = %id, "cancel of unknown job, nothing to do");
                Ok(None)
            }
        }
    }

    /// Feed a job loaded by the window controller into the registration
    /// path. Returns false when the job is already tracked in-memory.
    pub async fn register_loaded(&self, job: JobDetails) -> Result<bool, SchedulerError> {
        if self.registered.contains_key(&job.id) {
            return Ok(false);
        }
        let Some(fire_time) = job.trigger.has_next_fire_time() else {
            // A persisted job without an upcoming occurrence is residue of an
            // interrupted transition; drop it.
            warn!(job_id = %job.id, "loaded job has no upcoming fire time, deleting");
            self.repository.delete(&job.id).await?;
            return Ok(false);
        };
        self.register(job, fire_time).await?;
        Ok(true)
    }

    /// Run the event loop until shutdown: consumes fired timers and
    /// execution outcomes, reacts to leadership loss.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let fired = self.fired_rx.lock().await.take();
        let outcome = self.outcome_rx.lock().await.take();
        let (Some(mut fired_rx), Some(mut outcome_rx)) = (fired, outcome) else {
            error!("scheduler event loop already running");
            return;
        };
        let mut leadership_rx = self.leadership_rx.clone();
        let mut was_leader = self.is_leader();

        info!("scheduler starting");
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                Some(fired) = fired_rx.recv() => self.handle_fired(fired).await,
                Some(outcome) = outcome_rx.recv() => self.handle_outcome(outcome).await,
                leader = Self::leadership_changed(&mut leadership_rx) => {
                    if was_leader && !leader {
                        info!("lost scheduling lease, dropping live timer registrations");
                        self.timers.cancel_all();
                        self.registered.clear();
                    }
                    was_leader = leader;
                }
            }
        }

        let dropped = self.timers.active_count();
        self.timers.cancel_all();
        self.registered.clear();
        info!(dropped_timers = dropped, "scheduler shut down");
    }

    async fn leadership_changed(rx: &mut Option<watch::Receiver<bool>>) -> bool {
        match rx {
            Some(rx) => {
                if rx.changed().await.is_err() {
                    // Keeper gone; leadership can no longer change.
                    std::future::pending::<bool>().await
                } else {
                    *rx.borrow_and_update()
                }
            }
            None => std::future::pending().await,
        }
    }

    /// Evaluate chunk membership and either arm a timer now or persist the
    /// job for a later window pass.
    async fn do_schedule(&self, mut job: JobDetails) -> Result<JobDetails, SchedulerError> {
        let fire_time =
            job.trigger
                .has_next_fire_time()
                .ok_or_else(|| SchedulerError::InvalidSchedule {
                    job_id: job.id.clone(),
                    reason: "trigger has no upcoming fire time".to_string(),
                })?;
        job.status = JobStatus::Scheduled;

        if self.in_current_window(fire_time) {
            self.register(job, fire_time).await
        } else {
            job.scheduled_id = None;
            job.last_update = Utc::now();
            self.registered.remove(&job.id);
            let saved = self.save_with_retry(job).await?;
            self.publisher.publish(JobStatusEvent::from_job(&saved));
            debug!(job_id = %saved.id, fire_time = %fire_time, "persisted outside current window");
            Ok(saved)
        }
    }

    fn in_current_window(&self, fire_time: DateTime<Utc>) -> bool {
        fire_time < Utc::now() + self.config.chunk_duration()
    }

    /// Arm a timer for the job and persist it with the registration handle.
    ///
    /// The delay must be non-negative; a passed fire time is rejected unless
    /// `force_execute_expired_jobs` clamps it to a minimal delay.
    async fn register(
        &self,
        mut job: JobDetails,
        fire_time: DateTime<Utc>,
    ) -> Result<JobDetails, SchedulerError> {
        let now = Utc::now();
        let mut delay = fire_time - now;
        if delay < Duration::zero() {
            if self.config.force_execute_expired_jobs {
                debug!(job_id = %job.id, fire_time = %fire_time, "fire time passed, forcing execution");
                delay = Duration::milliseconds(EXPIRED_JOB_DELAY_MILLIS);
            } else {
                return Err(SchedulerError::InvalidSchedule {
                    job_id: job.id.clone(),
                    reason: format!("fire time {fire_time} is in the past"),
                });
            }
        }

        let scheduled_id =
            self.timers
                .register(&job.id, fire_time, delay.to_std().unwrap_or_default());
        job.scheduled_id = Some(scheduled_id.clone());
        job.last_update = now;

        let saved = match self.save_with_retry(job).await {
            Ok(saved) => saved,
            Err(e) => {
                // A timer must not fire for a row that was never stored.
                self.timers.cancel(&scheduled_id);
                return Err(e);
            }
        };
        self.registered.insert(saved.id.clone(), fire_time);
        self.publisher.publish(JobStatusEvent::from_job(&saved));
        info!(job_id = %saved.id, status = %saved.status, fire_time = %fire_time, "registered job");
        Ok(saved)
    }

    /// A stored `Retry` job keeps its own clock: make sure it is armed on
    /// this instance and return it untouched otherwise.
    async fn ensure_retry_registered(
        &self,
        job: JobDetails,
    ) -> Result<JobDetails, SchedulerError> {
        if self.registered.contains_key(&job.id) {
            return Ok(job);
        }
        let fire_time =
            job.trigger
                .has_next_fire_time()
                .ok_or_else(|| SchedulerError::InvalidSchedule {
                    job_id: job.id.clone(),
                    reason: "retrying job has no upcoming fire time".to_string(),
                })?;
        self.register(job, fire_time).await
    }

    /// Bounded local retry for first-insert races between instances.
    async fn save_with_retry(&self, job: JobDetails) -> Result<JobDetails, SchedulerError> {
        let mut attempt = 0;
        loop {
            match self.repository.save(job.clone()).await {
                Ok(saved) => return Ok(saved),
                Err(RepositoryError::ConcurrentModification(_))
                    if attempt < self.config.persistence_retry_attempts =>
                {
                    attempt += 1;
                    warn!(job_id = %job.id, attempt, "concurrent save detected, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.config.persistence_retry_delay_millis,
                    ))
                    .await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn unregister(&self, job: &JobDetails) {
        self.registered.remove(&job.id);
        if let Some(scheduled_id) = &job.scheduled_id {
            self.timers.cancel(scheduled_id);
        }
    }

    /// A timer reached its fire time: validate the registration is still
    /// current and hand the job to the dispatcher. Delivery runs on its own
    /// task; the outcome comes back through the outcome channel.
    async fn handle_fired(&self, fired: FiredTimer) {
        // The registration entry stays until the outcome is processed so a
        // window pass cannot re-register the in-flight occurrence.
        if !self.is_leader() {
            warn!(job_id = %fired.job_id, "timer fired without scheduling lease, skipping dispatch");
            return;
        }

        let job = match self.repository.get(&fired.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %fired.job_id, "timer fired for a deleted job, ignoring");
                return;
            }
            Err(e) => {
                error!(job_id = %fired.job_id, error = %e, "failed to load fired job");
                return;
            }
        };

        if job.scheduled_id.as_deref() != Some(fired.scheduled_id.as_str()) {
            debug!(job_id = %job.id, "stale timer registration, ignoring");
            return;
        }

        // The job is EXECUTING from here until the outcome arrives; that
        // state is held by the dispatcher only and never persisted.
        let dispatcher = self.dispatcher.clone();
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = dispatcher.dispatch(&job).await;
            let _ = outcome_tx.send(ExecutionOutcome {
                job_id: job.id,
                scheduled_id: fired.scheduled_id,
                fire_time: fired.fire_time,
                result,
            });
        });
    }

    /// An execution outcome arrived. Outcomes for a since-superseded or
    /// deleted registration are dropped.
    async fn handle_outcome(&self, outcome: ExecutionOutcome) {
        let job = match self.repository.get(&outcome.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %outcome.job_id, "outcome for a deleted job, ignoring");
                return;
            }
            Err(e) => {
                error!(job_id = %outcome.job_id, error = %e, "failed to load job for outcome");
                return;
            }
        };

        if job.scheduled_id.as_deref() != Some(outcome.scheduled_id.as_str()) {
            debug!(job_id = %job.id, "outcome for a superseded registration, ignoring");
            return;
        }

        match outcome.result {
            Ok(response) => self.handle_success(job, response).await,
            Err(error) => self.handle_failure(job, outcome.fire_time, error).await,
        }
    }

    /// Successful delivery: advance the trigger and either perpetuate the
    /// job for its next occurrence or resolve it as executed.
    async fn handle_success(&self, mut job: JobDetails, response: ExecutionResponse) {
        job.execution_counter += 1;
        job.retries = 0;
        job.scheduled_id = None;
        job.trigger.next_fire_time();

        if job.trigger.has_next_fire_time().is_some() {
            debug!(
                job_id = %job.id,
                execution_counter = job.execution_counter,
                "occurrence delivered, scheduling next"
            );
            if let Err(e) = self.do_schedule(job.clone()).await {
                error!(job_id = %job.id, error = %e, "failed to schedule next occurrence");
            }
            return;
        }

        job.status = JobStatus::Executed;
        job.last_update = Utc::now();
        let mut event = JobStatusEvent::from_job(&job);
        if let Some(message) = response.message {
            event = event.with_message(message);
        }
        self.publisher.publish(event);
        self.registered.remove(&job.id);
        if let Err(e) = self.repository.delete(&job.id).await {
            error!(job_id = %job.id, error = %e, "failed to delete executed job");
        }
        info!(job_id = %job.id, executions = job.execution_counter, "job executed");
    }

    /// Failed delivery: retry under the backoff policy until the time
    /// budget since the occurrence's original due time is spent, then
    /// resolve as errored.
    async fn handle_failure(
        &self,
        mut job: JobDetails,
        fire_time: DateTime<Utc>,
        error: ExecutionError,
    ) {
        let now = Utc::now();
        let job_id = job.id.clone();

        if self.retry_budget_exhausted(&job, fire_time, now) {
            job.status = JobStatus::Error;
            job.scheduled_id = None;
            job.last_update = now;
            self.publisher
                .publish(JobStatusEvent::from_job(&job).with_message(error.to_string()));
            self.registered.remove(&job_id);
            if let Err(e) = self.repository.delete(&job_id).await {
                error!(job_id = %job_id, error = %e, "failed to delete errored job");
            }
            warn!(
                job_id = %job_id,
                retries = job.retries,
                error = %error,
                "retry budget exhausted, job errored"
            );
            return;
        }

        let retry_at = now + self.config.backoff_duration();
        job.retries += 1;
        job.status = JobStatus::Retry;
        job.trigger = Trigger::point_in_time(retry_at);
        warn!(
            job_id = %job_id,
            retries = job.retries,
            retry_at = %retry_at,
            error = %error,
            "execution failed, scheduling retry"
        );
        if let Err(e) = self.register(job, retry_at).await {
            error!(job_id = %job_id, error = %e, "failed to register retry");
        }
    }

    /// Retries stop once the time elapsed since the occurrence's original
    /// due time exceeds the configured limit. The original due time is
    /// recovered from the attempt's fire time minus the backoff already
    /// inserted by previous attempts.
    fn retry_budget_exhausted(
        &self,
        job: &JobDetails,
        fire_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let accumulated_backoff = Duration::milliseconds(
            self.config.backoff_retry_millis as i64 * i64::from(job.retries),
        );
        let elapsed_since_due = (now - fire_time) + accumulated_backoff;
        elapsed_since_due
            > Duration::milliseconds(self.config.max_interval_limit_to_retry_millis as i64)
    }
}
