//! Trigger types and fire-time arithmetic.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// When and how often a job fires.
///
/// A trigger is consumed one occurrence at a time: [`Trigger::has_next_fire_time`]
/// peeks at the upcoming occurrence without advancing, [`Trigger::next_fire_time`]
/// consumes it. Once exhausted, both return `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire exactly once at a specific time.
    PointInTime {
        fire_time: DateTime<Utc>,
        /// Set once the single occurrence has been consumed.
        #[serde(default)]
        fired: bool,
    },
    /// Fire every `period_millis` from `start_time`.
    Interval {
        start_time: DateTime<Utc>,
        period_millis: u64,
        /// Number of repetitions after the initial occurrence. Negative means
        /// unlimited; zero means only the initial occurrence fires.
        repeat_limit: i64,
        /// Occurrences consumed so far.
        #[serde(default)]
        repeat_count: u32,
    },
}

impl Trigger {
    /// Create a one-shot trigger firing at `fire_time`.
    pub fn point_in_time(fire_time: DateTime<Utc>) -> Self {
        Trigger::PointInTime {
            fire_time,
            fired: false,
        }
    }

    /// Create a repeating trigger with a bounded number of repetitions.
    ///
    /// A `repeat_limit` of `n >= 0` yields exactly `n + 1` occurrences.
    pub fn interval(start_time: DateTime<Utc>, period_millis: u64, repeat_limit: i64) -> Self {
        Trigger::Interval {
            start_time,
            period_millis,
            repeat_limit,
            repeat_count: 0,
        }
    }

    /// Create a repeating trigger with no repetition bound.
    pub fn unlimited_interval(start_time: DateTime<Utc>, period_millis: u64) -> Self {
        Self::interval(start_time, period_millis, -1)
    }

    /// Peek at the next fire time without consuming the occurrence.
    ///
    /// Returns `None` once all occurrences are exhausted.
    pub fn has_next_fire_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Trigger::PointInTime { fire_time, fired } => {
                if *fired {
                    None
                } else {
                    Some(*fire_time)
                }
            }
            Trigger::Interval {
                start_time,
                period_millis,
                repeat_limit,
                repeat_count,
            } => {
                if *repeat_limit >= 0 && i64::from(*repeat_count) > *repeat_limit {
                    return None;
                }
                let offset =
                    Duration::milliseconds(*period_millis as i64 * i64::from(*repeat_count));
                Some(*start_time + offset)
            }
        }
    }

    /// Consume one occurrence and return its fire time.
    ///
    /// Successive results are non-decreasing; `None` once exhausted.
    pub fn next_fire_time(&mut self) -> Option<DateTime<Utc>> {
        let next = self.has_next_fire_time()?;
        match self {
            Trigger::PointInTime { fired, .. } => *fired = true,
            Trigger::Interval { repeat_count, .. } => *repeat_count += 1,
        }
        Some(next)
    }
}
