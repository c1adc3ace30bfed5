//! Job repository contract and the in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::RepositoryError;
use crate::types::{JobDetails, JobStatus};

/// Durable CRUD and range queries over job records.
///
/// The repository is the single source of truth for job state; in-memory
/// timer registrations are a reconstructible cache on top of it. All
/// operations must be safe under concurrent invocation from multiple service
/// instances, since delete/save races are expected during retry and cancel
/// handling.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Upsert a job and return the canonical persisted row.
    async fn save(&self, job: JobDetails) -> Result<JobDetails, RepositoryError>;

    /// Fetch a job by id.
    async fn get(&self, id: &str) -> Result<Option<JobDetails>, RepositoryError>;

    /// Whether a job with this id is persisted.
    async fn exists(&self, id: &str) -> Result<bool, RepositoryError>;

    /// Delete a job by id. Idempotent; returns the deleted row if it existed.
    async fn delete(&self, id: &str) -> Result<Option<JobDetails>, RepositoryError>;

    /// All jobs in any of the given statuses, ordered by priority descending.
    /// Within equal priority, insertion order is preserved.
    async fn find_by_status(
        &self,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobDetails>, RepositoryError>;

    /// Jobs in any of the given statuses whose next fire time falls in
    /// `[from, to]`, ordered by priority descending. Used to load the
    /// upcoming scheduling window.
    async fn find_by_status_in_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobDetails>, RepositoryError>;
}

/// A stored row plus its insertion sequence, which keeps ordering stable
/// within a priority level.
#[derive(Debug, Clone)]
struct StoredJob {
    seq: u64,
    job: JobDetails,
}

/// Non-durable repository backed by a map. Used by tests and as an explicit
/// non-durable mode; production deployments use the SQLite store.
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<String, StoredJob>>,
    next_seq: AtomicU64,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    fn sorted(mut rows: Vec<StoredJob>) -> Vec<JobDetails> {
        rows.sort_by(|a, b| b.job.priority.cmp(&a.job.priority).then(a.seq.cmp(&b.seq)));
        rows.into_iter().map(|row| row.job).collect()
    }
}

impl Default for InMemoryJobRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn save(&self, job: JobDetails) -> Result<JobDetails, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        let seq = match jobs.get(&job.id) {
            // Updates keep the original insertion slot.
            Some(existing) => existing.seq,
            None => self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        jobs.insert(
            job.id.clone(),
            StoredJob {
                seq,
                job: job.clone(),
            },
        );
        Ok(job)
    }

    async fn get(&self, id: &str) -> Result<Option<JobDetails>, RepositoryError> {
        Ok(self.jobs.read().await.get(id).map(|row| row.job.clone()))
    }

    async fn exists(&self, id: &str) -> Result<bool, RepositoryError> {
        Ok(self.jobs.read().await.contains_key(id))
    }

    async fn delete(&self, id: &str) -> Result<Option<JobDetails>, RepositoryError> {
        Ok(self.jobs.write().await.remove(id).map(|row| row.job))
    }

    async fn find_by_status(
        &self,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobDetails>, RepositoryError> {
        let jobs = self.jobs.read().await;
        let rows: Vec<StoredJob> = jobs
            .values()
            .filter(|row| statuses.contains(&row.job.status))
            .cloned()
            .collect();
        Ok(Self::sorted(rows))
    }

    async fn find_by_status_in_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobDetails>, RepositoryError> {
        let jobs = self.jobs.read().await;
        let rows: Vec<StoredJob> = jobs
            .values()
            .filter(|row| statuses.contains(&row.job.status))
            .filter(|row| {
                row.job
                    .trigger
                    .has_next_fire_time()
                    .map(|fire| fire >= from && fire <= to)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        Ok(Self::sorted(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::Trigger;
    use crate::types::Recipient;
    use chrono::Duration;

    fn job(id: &str, fire_in_secs: i64, priority: i32) -> JobDetails {
        JobDetails::new(
            id,
            Trigger::point_in_time(Utc::now() + Duration::seconds(fire_in_secs)),
            Recipient::Http {
                url: "http://localhost/cb".to_string(),
                payload: None,
            },
        )
        .with_priority(priority)
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let repo = InMemoryJobRepository::new();
        repo.save(job("a", 60, 0)).await.unwrap();

        let found = repo.get("a").await.unwrap().unwrap();
        assert_eq!(found.id, "a");
        assert!(repo.exists("a").await.unwrap());
        assert!(!repo.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_save_is_upsert() {
        let repo = InMemoryJobRepository::new();
        repo.save(job("a", 60, 0)).await.unwrap();

        let mut updated = job("a", 60, 0);
        updated.retries = 4;
        repo.save(updated).await.unwrap();

        let found = repo.get("a").await.unwrap().unwrap();
        assert_eq!(found.retries, 4);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let repo = InMemoryJobRepository::new();
        repo.save(job("a", 60, 0)).await.unwrap();

        assert!(repo.delete("a").await.unwrap().is_some());
        assert!(repo.delete("a").await.unwrap().is_none());
        assert!(repo.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_status_orders_by_priority() {
        let repo = InMemoryJobRepository::new();
        repo.save(job("low", 60, 1)).await.unwrap();
        repo.save(job("high", 60, 10)).await.unwrap();
        repo.save(job("mid", 60, 5)).await.unwrap();

        let found = repo.find_by_status(&[JobStatus::Scheduled]).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_equal_priority_preserves_insertion_order() {
        let repo = InMemoryJobRepository::new();
        for id in ["first", "second", "third"] {
            repo.save(job(id, 60, 3)).await.unwrap();
        }
        // Updating a row must not move it.
        let mut updated = job("first", 60, 3);
        updated.retries = 1;
        repo.save(updated).await.unwrap();

        let found = repo.find_by_status(&[JobStatus::Scheduled]).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_window_query_bounds() {
        let repo = InMemoryJobRepository::new();
        repo.save(job("soon", 30, 0)).await.unwrap();
        repo.save(job("later", 600, 0)).await.unwrap();

        let now = Utc::now();
        let found = repo
            .find_by_status_in_window(now, now + Duration::seconds(60), &[JobStatus::Scheduled])
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["soon"]);
    }

    #[tokio::test]
    async fn test_window_query_filters_status() {
        let repo = InMemoryJobRepository::new();
        let mut retrying = job("r", 30, 0);
        retrying.status = JobStatus::Retry;
        repo.save(retrying).await.unwrap();
        repo.save(job("s", 30, 0)).await.unwrap();

        let now = Utc::now();
        let found = repo
            .find_by_status_in_window(now, now + Duration::seconds(60), &[JobStatus::Retry])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "r");
    }

    #[tokio::test]
    async fn test_exhausted_trigger_never_in_window() {
        let repo = InMemoryJobRepository::new();
        let mut spent = job("spent", 30, 0);
        spent.trigger.next_fire_time();
        repo.save(spent).await.unwrap();

        let now = Utc::now();
        let found = repo
            .find_by_status_in_window(
                now - Duration::hours(1),
                now + Duration::hours(1),
                &[JobStatus::Scheduled],
            )
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
