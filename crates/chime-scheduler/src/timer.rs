//! In-process timer facility.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;
use uuid::Uuid;

/// A timer registration that reached its fire time.
#[derive(Debug, Clone)]
pub struct FiredTimer {
    /// Handle of the registration that fired.
    pub scheduled_id: String,
    /// Job the registration belongs to.
    pub job_id: String,
    /// The fire time the registration was armed for.
    pub fire_time: DateTime<Utc>,
}

/// Tracks live timer registrations and emits fired events.
///
/// Each registration is a spawned sleep task keyed by a generated handle.
/// The table is a cache of currently armed timers, reconstructible from the
/// repository; it is never authoritative for job state.
#[derive(Clone)]
pub struct TimerService {
    fired_tx: mpsc::UnboundedSender<FiredTimer>,
    handles: Arc<DashMap<String, JoinHandle<()>>>,
}

impl TimerService {
    /// Create a timer service and the receiving end of its fired-event
    /// channel. The receiver is consumed by the scheduler loop.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FiredTimer>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        (
            Self {
                fired_tx,
                handles: Arc::new(DashMap::new()),
            },
            fired_rx,
        )
    }

    /// Arm a timer for `job_id` firing after `delay`. Returns the handle
    /// identifying the registration.
    pub fn register(
        &self,
        job_id: &str,
        fire_time: DateTime<Utc>,
        delay: Duration,
    ) -> String {
        let scheduled_id = Uuid::new_v4().to_string();
        let fired = FiredTimer {
            scheduled_id: scheduled_id.clone(),
            job_id: job_id.to_string(),
            fire_time,
        };

        let handles = Arc::clone(&self.handles);
        let fired_tx = self.fired_tx.clone();
        let handle_id = scheduled_id.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            handles.remove(&handle_id);
            // The receiver only disappears during shutdown.
            let _ = fired_tx.send(fired);
        });
        self.handles.insert(scheduled_id.clone(), handle);

        debug!(job_id, scheduled_id = %scheduled_id, delay_ms = delay.as_millis() as u64, "armed timer");
        scheduled_id
    }

    /// Disarm a registration. Returns false if the handle is unknown, which
    /// includes timers that already fired.
    pub fn cancel(&self, scheduled_id: &str) -> bool {
        match self.handles.remove(scheduled_id) {
            Some((_, handle)) => {
                handle.abort();
                debug!(scheduled_id, "canceled timer");
                true
            }
            None => false,
        }
    }

    /// Number of currently armed timers.
    pub fn active_count(&self) -> usize {
        self.handles.len()
    }

    /// Disarm every live registration. Used on lease loss and shutdown.
    pub fn cancel_all(&self) {
        self.handles.retain(|_, handle| {
            handle.abort();
            false
        });
    }
}
