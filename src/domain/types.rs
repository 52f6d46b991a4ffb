//! Shared types for the geowindow pipeline

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Planar coordinate: longitude as `x`, latitude as `y`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
}

impl Coordinate {
    #[inline]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Integer position of a cell in the offset tiling (odd rows shifted right)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HexIndex {
    pub col: i64,
    pub row: i64,
}

/// Center of a hexagon in the tiling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub x: f64,
    pub y: f64,
}

impl Cell {
    #[inline]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Canonical key with `precision` decimals, latitude first
    pub fn key(&self, precision: usize) -> CellKey {
        CellKey::new(self, precision)
    }
}

/// Aggregation key for a cell: `"<y> <x>"` with fixed decimals
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CellKey(String);

impl CellKey {
    pub fn new(cell: &Cell, precision: usize) -> Self {
        // Adding 0.0 turns -0.0 into 0.0 so the origin row has one spelling
        let (y, x) = (cell.y + 0.0, cell.x + 0.0);
        Self(format!("{y:.precision$} {x:.precision$}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decoded input event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub coordinate: Option<Coordinate>,
    pub timestamp_ms: Option<i64>,
}

impl Event {
    pub fn new(coordinate: Option<Coordinate>, timestamp_ms: Option<i64>) -> Self {
        Self { coordinate, timestamp_ms }
    }

    pub fn at(x: f64, y: f64, timestamp_ms: i64) -> Self {
        Self::new(Some(Coordinate::new(x, y)), Some(timestamp_ms))
    }
}

/// Event that survived filtering, keyed by its cell
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedEvent {
    pub cell_key: CellKey,
    pub timestamp_ms: i64,
}

/// Count of events in one cell during one window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowedCount {
    pub window_start_ms: i64,
    pub cell_key: CellKey,
    pub count: u64,
}

impl WindowedCount {
    /// Output record key: `"<window_start_ms> <cell_key>"`
    pub fn record_key(&self) -> String {
        format!("{} {}", self.window_start_ms, self.cell_key)
    }
}

/// Wire shape of an input payload. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub geo: Option<RawGeo>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RawGeo {
    #[serde(default)]
    pub coordinates: Option<Vec<f64>>,
}

impl From<RawEvent> for Event {
    fn from(raw: RawEvent) -> Self {
        let coordinate = raw
            .geo
            .and_then(|geo| geo.coordinates)
            .filter(|c| c.len() >= 2)
            .map(|c| Coordinate::new(c[0], c[1]));
        Event { coordinate, timestamp_ms: raw.timestamp_ms }
    }
}

/// Accepts `timestamp_ms` as an integer or as a decimal string (the form
/// tweet payloads use). Anything else, including null, reads as absent.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = Option<i64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an integer or numeric string timestamp")
        }

        fn visit_str<E>(self, value: &str) -> Result<Option<i64>, E>
        where
            E: de::Error,
        {
            Ok(value.trim().parse::<i64>().ok())
        }

        fn visit_i64<E>(self, value: i64) -> Result<Option<i64>, E>
        where
            E: de::Error,
        {
            Ok(Some(value))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Option<i64>, E>
        where
            E: de::Error,
        {
            Ok(i64::try_from(value).ok())
        }

        fn visit_f64<E>(self, value: f64) -> Result<Option<i64>, E>
        where
            E: de::Error,
        {
            Ok(value.is_finite().then_some(value as i64))
        }

        fn visit_unit<E>(self) -> Result<Option<i64>, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_none<E>(self) -> Result<Option<i64>, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_bool<E>(self, _value: bool) -> Result<Option<i64>, E>
        where
            E: de::Error,
        {
            Ok(None)
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(json: &str) -> Event {
        serde_json::from_str::<RawEvent>(json).unwrap().into()
    }

    #[test]
    fn test_cell_key_format() {
        let cell = Cell::new(-122.40908238574796, 37.79375);
        assert_eq!(cell.key(6).as_str(), "37.793750 -122.409082");
        assert_eq!(cell.key(2).as_str(), "37.79 -122.41");
    }

    #[test]
    fn test_cell_key_normalizes_negative_zero() {
        assert_eq!(Cell::new(-0.0, -0.0).key(6), Cell::new(0.0, 0.0).key(6));
        assert_eq!(Cell::new(-0.0, 0.0).key(3).as_str(), "0.000 0.000");
    }

    #[test]
    fn test_record_key() {
        let count = WindowedCount {
            window_start_ms: 1467766800000,
            cell_key: Cell::new(-122.40908238574796, 37.79375).key(6),
            count: 3,
        };
        assert_eq!(count.record_key(), "1467766800000 37.793750 -122.409082");
    }

    #[test]
    fn test_decode_tweet_shape() {
        let event = decode(
            r#"{"id": 1, "geo": {"type": "Point", "coordinates": [-122.4, 37.7]},
                "timestamp_ms": "1467770463000", "text": "hi"}"#,
        );
        assert_eq!(event.coordinate, Some(Coordinate::new(-122.4, 37.7)));
        assert_eq!(event.timestamp_ms, Some(1467770463000));
    }

    #[test]
    fn test_decode_integer_timestamp() {
        let event = decode(r#"{"geo": {"coordinates": [1.0, 2.0]}, "timestamp_ms": 42}"#);
        assert_eq!(event.timestamp_ms, Some(42));
    }

    #[test]
    fn test_decode_absent_parts() {
        assert_eq!(decode(r#"{"geo": null, "timestamp_ms": 5}"#).coordinate, None);
        assert_eq!(decode(r#"{"timestamp_ms": 5}"#).coordinate, None);
        assert_eq!(decode(r#"{"geo": {"coordinates": [1.0]}}"#).coordinate, None);
        assert_eq!(decode(r#"{"geo": {"coordinates": [1.0, 2.0]}}"#).timestamp_ms, None);
        assert_eq!(decode(r#"{"timestamp_ms": null}"#).timestamp_ms, None);
        assert_eq!(decode(r#"{"timestamp_ms": "soon"}"#).timestamp_ms, None);
    }
}
