//! Job record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trigger::Trigger;

/// How a due job is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recipient {
    /// POST the payload to a callback endpoint.
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
}

/// Current status of a job in the scheduling state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its next fire time.
    #[default]
    Scheduled,
    /// Currently being delivered to its recipient. Held by the dispatcher
    /// only; never persisted.
    Executing,
    /// Failed delivery, waiting for the next retry attempt.
    Retry,
    /// All occurrences delivered. Terminal.
    Executed,
    /// Retry budget exhausted. Terminal.
    Error,
    /// Explicitly canceled. Terminal.
    Canceled,
}

impl JobStatus {
    /// Whether the status ends the job's lifecycle. Terminal jobs are deleted
    /// from the repository rather than kept around.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Executed | JobStatus::Error | JobStatus::Canceled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Executing => "executing",
            JobStatus::Retry => "retry",
            JobStatus::Executed => "executed",
            JobStatus::Error => "error",
            JobStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// A scheduled job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetails {
    /// Unique id, immutable after creation.
    pub id: String,
    /// Caller-supplied id correlating retries and duplicates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Current state-machine status.
    pub status: JobStatus,
    /// When/how often this job fires.
    pub trigger: Trigger,
    /// How the job is delivered when due.
    pub recipient: Recipient,
    /// Higher priority jobs are loaded and listed first.
    pub priority: i32,
    /// Retry attempts performed for the current occurrence.
    pub retries: u32,
    /// Successful firings of the trigger so far.
    pub execution_counter: u32,
    /// Handle of the live in-memory timer registration, present only while
    /// this job is registered in-process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_id: Option<String>,
    /// Last mutation time.
    pub last_update: DateTime<Utc>,
    /// Upper bound for a single delivery attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout_millis: Option<u64>,
}

impl JobDetails {
    /// Create a new job with the given trigger and recipient.
    pub fn new(id: impl Into<String>, trigger: Trigger, recipient: Recipient) -> Self {
        Self {
            id: id.into(),
            correlation_id: None,
            status: JobStatus::Scheduled,
            trigger,
            recipient,
            priority: 0,
            retries: 0,
            execution_counter: 0,
            scheduled_id: None,
            last_update: Utc::now(),
            execution_timeout_millis: None,
        }
    }

    /// Create a new job with a generated id.
    pub fn with_generated_id(trigger: Trigger, recipient: Recipient) -> Self {
        Self::new(Uuid::new_v4().to_string(), trigger, recipient)
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Bound each delivery attempt to the given timeout.
    pub fn with_execution_timeout_millis(mut self, millis: u64) -> Self {
        self.execution_timeout_millis = Some(millis);
        self
    }

    /// The execution timeout as a std duration, if configured.
    pub fn execution_timeout(&self) -> Option<std::time::Duration> {
        self.execution_timeout_millis
            .map(std::time::Duration::from_millis)
    }
}
