//! Execution dispatch: invoking a due job's recipient.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::timeout;

use crate::error::ExecutionError;
use crate::types::JobDetails;

/// Successful delivery of a due job to its recipient.
#[derive(Debug, Clone)]
pub struct ExecutionResponse {
    pub job_id: String,
    /// Optional detail from the recipient (e.g. response body excerpt).
    pub message: Option<String>,
}

/// Invokes a job's recipient capability.
///
/// Implementations perform the actual delivery (the canonical one POSTs to
/// an HTTP callback endpoint). Retries make delivery at-least-once; the
/// scheduler does not deduplicate at the recipient.
#[async_trait]
pub trait RecipientExecutor: Send + Sync {
    async fn execute(&self, job: &JobDetails) -> Result<ExecutionResponse, ExecutionError>;
}

/// Result of one delivery attempt, reported back to the scheduler loop.
///
/// Carries the registration handle and armed fire time of the attempt so the
/// scheduler can discard outcomes for since-superseded registrations.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub job_id: String,
    pub scheduled_id: String,
    /// The fire time the attempt was armed for, used for retry-budget
    /// arithmetic.
    pub fire_time: DateTime<Utc>,
    pub result: Result<ExecutionResponse, ExecutionError>,
}

/// Fire-and-observe wrapper around a [`RecipientExecutor`].
///
/// Bounds each attempt with the job's execution timeout; exceeding it is an
/// ordinary failure outcome feeding the retry logic, not a distinct class.
#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn RecipientExecutor>,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn RecipientExecutor>) -> Self {
        Self { executor }
    }

    /// Deliver a due job, applying its execution timeout if configured.
    pub async fn dispatch(&self, job: &JobDetails) -> Result<ExecutionResponse, ExecutionError> {
        match job.execution_timeout() {
            Some(bound) => match timeout(bound, self.executor.execute(job)).await {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::TimedOut {
                    job_id: job.id.clone(),
                    timeout_millis: bound.as_millis() as u64,
                }),
            },
            None => self.executor.execute(job).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::Trigger;
    use crate::types::Recipient;
    use std::time::Duration;

    struct SlowExecutor {
        delay: Duration,
    }

    #[async_trait]
    impl RecipientExecutor for SlowExecutor {
        async fn execute(&self, job: &JobDetails) -> Result<ExecutionResponse, ExecutionError> {
            tokio::time::sleep(self.delay).await;
            Ok(ExecutionResponse {
                job_id: job.id.clone(),
                message: None,
            })
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl RecipientExecutor for FailingExecutor {
        async fn execute(&self, job: &JobDetails) -> Result<ExecutionResponse, ExecutionError> {
            Err(ExecutionError::Failed {
                job_id: job.id.clone(),
                message: "recipient unavailable".to_string(),
            })
        }
    }

    fn job_with_timeout(timeout_millis: Option<u64>) -> JobDetails {
        let mut job = JobDetails::new(
            "job-1",
            Trigger::point_in_time(Utc::now()),
            Recipient::Http {
                url: "http://localhost/cb".to_string(),
                payload: None,
            },
        );
        job.execution_timeout_millis = timeout_millis;
        job
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_within_timeout_succeeds() {
        let dispatcher = Dispatcher::new(Arc::new(SlowExecutor {
            delay: Duration::from_millis(100),
        }));
        let job = job_with_timeout(Some(1_000));

        let response = dispatcher.dispatch(&job).await.unwrap();
        assert_eq!(response.job_id, "job-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_exceeding_timeout_fails() {
        let dispatcher = Dispatcher::new(Arc::new(SlowExecutor {
            delay: Duration::from_secs(10),
        }));
        let job = job_with_timeout(Some(500));

        let err = dispatcher.dispatch(&job).await.unwrap_err();
        match err {
            ExecutionError::TimedOut {
                job_id,
                timeout_millis,
            } => {
                assert_eq!(job_id, "job-1");
                assert_eq!(timeout_millis, 500);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_without_timeout_waits() {
        let dispatcher = Dispatcher::new(Arc::new(SlowExecutor {
            delay: Duration::from_secs(30),
        }));
        let job = job_with_timeout(None);

        let response = dispatcher.dispatch(&job).await.unwrap();
        assert_eq!(response.job_id, "job-1");
    }

    #[tokio::test]
    async fn test_executor_failure_propagates() {
        let dispatcher = Dispatcher::new(Arc::new(FailingExecutor));
        let job = job_with_timeout(None);

        let err = dispatcher.dispatch(&job).await.unwrap_err();
        assert_eq!(err.job_id(), "job-1");
    }
}
