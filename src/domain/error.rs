//! Error conditions raised by the binning and windowing core

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoError {
    /// Binner or window built with an unusable parameter. Fatal at startup.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// Payload bytes could not be decoded into an event
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Event carries no usable timestamp under the reject policy
    #[error("event has no timestamp_ms")]
    MissingTimestamp,
}

impl GeoError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        GeoError::InvalidParameter { name, reason: reason.into() }
    }
}
