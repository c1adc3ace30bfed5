//! Job status change notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{JobDetails, JobStatus};

/// Default capacity of the broadcast channel backing the publisher.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A job status change, emitted to external consumers on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusEvent {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub status: JobStatus,
    pub retries: u32,
    pub execution_counter: u32,
    pub last_update: DateTime<Utc>,
    /// Error detail for failure transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobStatusEvent {
    /// Build an event snapshot from a job record.
    pub fn from_job(job: &JobDetails) -> Self {
        Self {
            job_id: job.id.clone(),
            correlation_id: job.correlation_id.clone(),
            status: job.status,
            retries: job.retries,
            execution_counter: job.execution_counter,
            last_update: job.last_update,
            message: None,
        }
    }

    /// Attach an error or informational message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Best-effort fan-out of job status changes.
///
/// Delivery never blocks or fails a state transition: publishing with no
/// subscribers is logged and dropped, and slow subscribers observe lag on
/// their end of the broadcast channel.
#[derive(Clone)]
pub struct NotificationPublisher {
    tx: broadcast::Sender<JobStatusEvent>,
}

impl NotificationPublisher {
    /// Create a publisher with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a publisher with an explicit channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the notification stream.
    pub fn subscribe(&self) -> broadcast::Receiver<JobStatusEvent> {
        self.tx.subscribe()
    }

    /// Publish a status change. Best-effort: a send with no live receivers
    /// is not an error.
    pub fn publish(&self, event: JobStatusEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!(job_id = %event.job_id, status = %event.status, "no notification subscribers");
        }
    }
}

impl Default for NotificationPublisher {
    fn default() -> Self {
        Self::new()
    }
}
