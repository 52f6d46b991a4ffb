//! Payload codec shared by every source and sink

use crate::domain::error::GeoError;
use crate::domain::types::{CellKey, Event, RawEvent, WindowedCount};
use crate::infra::metrics::Metrics;
use serde::Serialize;
use tracing::warn;

/// Decode one input payload
///
/// Empty (or whitespace-only) payloads are null records and decode to `None`.
/// Anything else that is not a JSON object of the expected shape is
/// `GeoError::MalformedEvent`.
pub fn decode_event(payload: &[u8]) -> Result<Option<Event>, GeoError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let raw: RawEvent = serde_json::from_slice(payload)
        .map_err(|e| GeoError::MalformedEvent(e.to_string()))?;
    Ok(Some(raw.into()))
}

/// Decode a payload taken off a source, counting it in metrics
///
/// Malformed payloads are logged and dropped; null records are dropped silently.
pub fn accept_payload(payload: &[u8], metrics: &Metrics) -> Option<Event> {
    metrics.record_event_received();
    match decode_event(payload) {
        Ok(event) => event,
        Err(e) => {
            metrics.record_event_malformed();
            warn!(error = %e, bytes = %payload.len(), "event_dropped");
            None
        }
    }
}

/// JSON form of a windowed count on the output topic / file
#[derive(Debug, Serialize)]
pub struct OutputRecord<'a> {
    pub key: String,
    pub window_start_ms: i64,
    pub cell: &'a CellKey,
    pub count: u64,
}

impl<'a> From<&'a WindowedCount> for OutputRecord<'a> {
    fn from(count: &'a WindowedCount) -> Self {
        Self {
            key: count.record_key(),
            window_start_ms: count.window_start_ms,
            cell: &count.cell_key,
            count: count.count,
        }
    }
}

pub fn encode_count(count: &WindowedCount) -> serde_json::Result<String> {
    serde_json::to_string(&OutputRecord::from(count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Cell, Coordinate};

    #[test]
    fn test_decode_tweet() {
        let payload = br#"{"geo":{"type":"Point","coordinates":[-122.40793609,37.79038645]},"timestamp_ms":"1467770463000"}"#;
        let event = decode_event(payload).unwrap().unwrap();
        assert_eq!(event.coordinate, Some(Coordinate::new(-122.40793609, 37.79038645)));
        assert_eq!(event.timestamp_ms, Some(1467770463000));
    }

    #[test]
    fn test_empty_payload_is_null_record() {
        assert_eq!(decode_event(b"").unwrap(), None);
        assert_eq!(decode_event(b"  \n").unwrap(), None);
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(decode_event(b"{not json"), Err(GeoError::MalformedEvent(_))));
        assert!(matches!(decode_event(br#""text""#), Err(GeoError::MalformedEvent(_))));
        assert!(matches!(decode_event(&[0xff, 0xfe]), Err(GeoError::MalformedEvent(_))));
    }

    #[test]
    fn test_accept_payload_counts() {
        let metrics = Metrics::new();
        assert!(accept_payload(br#"{"timestamp_ms": 1}"#, &metrics).is_some());
        assert!(accept_payload(b"", &metrics).is_none());
        assert!(accept_payload(b"oops", &metrics).is_none());
        assert_eq!(metrics.events_received(), 3);
        assert_eq!(metrics.events_malformed(), 1);
    }

    #[test]
    fn test_encode_count() {
        let count = WindowedCount {
            window_start_ms: 1467766800000,
            cell_key: Cell::new(-122.40908238574796, 37.79375).key(6),
            count: 2,
        };
        let json: serde_json::Value = serde_json::from_str(&encode_count(&count).unwrap()).unwrap();
        assert_eq!(json["key"], "1467766800000 37.793750 -122.409082");
        assert_eq!(json["window_start_ms"], 1467766800000i64);
        assert_eq!(json["cell"], "37.793750 -122.409082");
        assert_eq!(json["count"], 2);
    }
}
