//! SQLite-backed persistence for Chime.
//!
//! Provides durable implementations of the scheduler's repository and
//! management-store contracts. Job records are stored as JSON documents with
//! indexed columns for the status/fire-time/priority queries the scheduling
//! window depends on.

mod error;
mod jobs;
mod management;

pub use error::StoreError;
pub use jobs::SqliteJobRepository;
pub use management::SqliteManagementStore;
