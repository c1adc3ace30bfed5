//! HTTP callback delivery for due jobs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use chime_scheduler::{
    ExecutionError, ExecutionResponse, JobDetails, Recipient, RecipientExecutor,
};

/// Executor that POSTs a due job's payload to its callback endpoint.
///
/// Any non-success response status is a failure outcome; the scheduler's
/// retry policy decides what happens next. A per-attempt bound tighter than
/// the client-wide timeout comes from the job's own execution timeout,
/// applied by the dispatcher.
pub struct HttpCallbackExecutor {
    http: Client,
}

impl HttpCallbackExecutor {
    /// Create an executor with its own HTTP client.
    pub fn new() -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");
        Self { http }
    }
}

impl Default for HttpCallbackExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecipientExecutor for HttpCallbackExecutor {
    async fn execute(&self, job: &JobDetails) -> Result<ExecutionResponse, ExecutionError> {
        let Recipient::Http { url, payload } = &job.recipient;

        let mut request = self.http.post(url);
        if let Some(payload) = payload {
            request = request.json(payload);
        }

        let response = request.send().await.map_err(|e| ExecutionError::Failed {
            job_id: job.id.clone(),
            message: e.to_string(),
        })?;

        let status = response.status();
        debug!(job_id = %job.id, url, status = %status, "callback delivered");
        if status.is_success() {
            Ok(ExecutionResponse {
                job_id: job.id.clone(),
                message: None,
            })
        } else {
            Err(ExecutionError::Failed {
                job_id: job.id.clone(),
                message: format!("callback endpoint returned {status}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chime_scheduler::Trigger;
    use chrono::Utc;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn job(url: String, payload: Option<serde_json::Value>) -> JobDetails {
        JobDetails::new(
            "job-1",
            Trigger::point_in_time(Utc::now()),
            Recipient::Http { url, payload },
        )
    }

    #[tokio::test]
    async fn test_posts_payload_to_endpoint() {
        let server = MockServer::start().await;
        let payload = serde_json::json!({"process": "p1", "node": "n4"});
        Mock::given(method("POST"))
            .and(path("/callback"))
            .and(body_json(&payload))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let executor = HttpCallbackExecutor::new();
        let response = executor
            .execute(&job(format!("{}/callback", server.uri()), Some(payload)))
            .await
            .unwrap();
        assert_eq!(response.job_id, "job-1");
    }

    #[tokio::test]
    async fn test_posts_without_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/callback"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let executor = HttpCallbackExecutor::new();
        let response = executor
            .execute(&job(format!("{}/callback", server.uri()), None))
            .await
            .unwrap();
        assert_eq!(response.job_id, "job-1");
    }

    #[tokio::test]
    async fn test_server_error_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/callback"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let executor = HttpCallbackExecutor::new();
        let err = executor
            .execute(&job(format!("{}/callback", server.uri()), None))
            .await
            .unwrap_err();
        match err {
            ExecutionError::Failed { job_id, message } => {
                assert_eq!(job_id, "job-1");
                assert!(message.contains("503"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_failure() {
        let executor = HttpCallbackExecutor::new();
        // Nothing listens on this port.
        let err = executor
            .execute(&job("http://127.0.0.1:59999/callback".to_string(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Failed { .. }));
    }
}
