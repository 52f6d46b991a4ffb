//! Event-time extraction
//!
//! The pipeline asks an injected `TimestampExtractor` for the time used to
//! pick an event's window. The embedded `timestamp_ms` field is authoritative;
//! arrival time is never used.

use crate::domain::error::GeoError;
use crate::domain::types::Event;
use serde::Deserialize;

/// What to do with an event that carries no `timestamp_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingTimestampPolicy {
    /// Drop the event and count it as missing a timestamp
    #[default]
    Reject,
    /// Count the event in the window containing time zero. That window is
    /// held open for the life of the pipeline and flushed when input ends.
    Zero,
}

/// Supplies the event time used for window assignment
pub trait TimestampExtractor: Send + Sync {
    fn extract_timestamp(&self, event: &Event) -> Result<i64, GeoError>;

    /// Time assigned to events that carry none, if such events are counted.
    /// Its window is never closed as late.
    fn default_timestamp(&self) -> Option<i64> {
        None
    }
}

/// Reads `timestamp_ms` and applies a `MissingTimestampPolicy` when absent
#[derive(Debug, Clone, Copy, Default)]
pub struct EventTimestampExtractor {
    policy: MissingTimestampPolicy,
}

impl EventTimestampExtractor {
    pub fn new(policy: MissingTimestampPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> MissingTimestampPolicy {
        self.policy
    }
}

impl TimestampExtractor for EventTimestampExtractor {
    fn extract_timestamp(&self, event: &Event) -> Result<i64, GeoError> {
        match (event.timestamp_ms, self.policy) {
            (Some(ts), _) => Ok(ts),
            (None, MissingTimestampPolicy::Zero) => Ok(0),
            (None, MissingTimestampPolicy::Reject) => Err(GeoError::MissingTimestamp),
        }
    }

    fn default_timestamp(&self) -> Option<i64> {
        match self.policy {
            MissingTimestampPolicy::Zero => Some(0),
            MissingTimestampPolicy::Reject => None,
        }
    }
}
