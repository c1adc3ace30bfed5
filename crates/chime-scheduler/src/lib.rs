//! Durable timer/job scheduling core for Chime.
//!
//! This crate provides a persistent scheduler that:
//! - Stores job state through a pluggable repository
//! - Survives crashes and restarts by reloading upcoming work
//! - Supports one-shot and recurring interval triggers
//! - Retries failed callbacks with a bounded backoff budget
//! - Coordinates in-memory ownership across instances via a heartbeat lease

mod config;
mod dispatcher;
mod error;
mod events;
mod lease;
mod repository;
mod scheduler;
mod timer;
mod trigger;
mod types;
mod window;

pub use config::SchedulerConfig;
pub use dispatcher::{Dispatcher, ExecutionOutcome, ExecutionResponse, RecipientExecutor};
pub use error::{ExecutionError, RepositoryError, SchedulerError};
pub use events::{JobStatusEvent, NotificationPublisher};
pub use lease::{
    ComputeUpdate, InMemoryManagementStore, JobServiceManagementInfo, LeaseError, LeaseKeeper,
    ManagementStore,
};
pub use repository::{InMemoryJobRepository, JobRepository};
pub use scheduler::JobScheduler;
pub use timer::{FiredTimer, TimerService};
pub use trigger::Trigger;
pub use types::{JobDetails, JobStatus, Recipient};
pub use window::WindowController;
