//! Scheduler configuration.

use serde::{Deserialize, Serialize};

/// Default delay between retry attempts in milliseconds.
const DEFAULT_BACKOFF_RETRY_MILLIS: u64 = 1_000;

/// Default total retry window in milliseconds. Once this much time has
/// elapsed since a job's original due time, no further retries are attempted.
const DEFAULT_MAX_INTERVAL_LIMIT_TO_RETRY_MILLIS: u64 = 60_000;

/// Default width of the in-memory scheduling window in minutes.
const DEFAULT_SCHEDULER_CHUNK_IN_MINUTES: u64 = 10;

/// Default heartbeat refresh period in milliseconds.
const DEFAULT_HEARTBEAT_INTERVAL_MILLIS: u64 = 1_000;

/// Default staleness threshold after which a lease is considered abandoned.
const DEFAULT_HEARTBEAT_EXPIRATION_MILLIS: u64 = 10_000;

/// Default number of local retries for first-insert persistence races.
const DEFAULT_PERSISTENCE_RETRY_ATTEMPTS: u32 = 3;

/// Default delay between persistence retries in milliseconds.
const DEFAULT_PERSISTENCE_RETRY_DELAY_MILLIS: u64 = 50;

/// Configuration for the scheduler core and its companion loops.
///
/// All durations are wall-clock milliseconds except the chunk width, which is
/// expressed in minutes because it bounds a coarse rolling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Fixed delay inserted between retry attempts after an execution failure.
    pub backoff_retry_millis: u64,
    /// Total time since a job's original due time during which retries may run.
    pub max_interval_limit_to_retry_millis: u64,
    /// Width of the upcoming time window held as live in-memory timers.
    pub scheduler_chunk_in_minutes: u64,
    /// When true, jobs whose fire time already passed are executed immediately
    /// instead of being rejected.
    pub force_execute_expired_jobs: bool,
    /// How often the lease holder refreshes its heartbeat.
    pub heartbeat_interval_millis: u64,
    /// How old a heartbeat may get before a competing instance may take over.
    pub heartbeat_expiration_millis: u64,
    /// Bounded local retries for first-insert persistence races.
    pub persistence_retry_attempts: u32,
    /// Delay between those local retries.
    pub persistence_retry_delay_millis: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backoff_retry_millis: DEFAULT_BACKOFF_RETRY_MILLIS,
            max_interval_limit_to_retry_millis: DEFAULT_MAX_INTERVAL_LIMIT_TO_RETRY_MILLIS,
            scheduler_chunk_in_minutes: DEFAULT_SCHEDULER_CHUNK_IN_MINUTES,
            force_execute_expired_jobs: false,
            heartbeat_interval_millis: DEFAULT_HEARTBEAT_INTERVAL_MILLIS,
            heartbeat_expiration_millis: DEFAULT_HEARTBEAT_EXPIRATION_MILLIS,
            persistence_retry_attempts: DEFAULT_PERSISTENCE_RETRY_ATTEMPTS,
            persistence_retry_delay_millis: DEFAULT_PERSISTENCE_RETRY_DELAY_MILLIS,
        }
    }
}

impl SchedulerConfig {
    /// The chunk width as a chrono duration.
    pub fn chunk_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.scheduler_chunk_in_minutes as i64)
    }

    /// The retry backoff as a chrono duration.
    pub fn backoff_duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.backoff_retry_millis as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let config = SchedulerConfig::default();
        assert!(config.backoff_retry_millis < config.max_interval_limit_to_retry_millis);
        assert!(config.heartbeat_interval_millis < config.heartbeat_expiration_millis);
        assert!(!config.force_execute_expired_jobs);
    }

    #[test]
    fn test_chunk_duration() {
        let config = SchedulerConfig {
            scheduler_chunk_in_minutes: 5,
            ..Default::default()
        };
        assert_eq!(config.chunk_duration().num_minutes(), 5);
    }
}
