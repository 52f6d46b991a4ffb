//! Pure stage functions of the counting pipeline
//!
//! filter -> extract timestamp -> re-key by cell -> route to worker.
//! Nothing here holds state; the pipeline tasks wire these together.

use crate::domain::hexbin::HexGridBinner;
use crate::domain::types::{CellKey, Coordinate, Event, KeyedEvent};
use crate::services::timestamp::TimestampExtractor;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Result of running one event through the keying stages
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Keyed(KeyedEvent),
    /// No coordinate, or a non-finite one
    MissingGeo,
    /// Timestamp extractor rejected the event
    MissingTimestamp,
}

/// Coordinate of an event that has a usable location
#[inline]
pub fn filter_located(event: &Event) -> Option<Coordinate> {
    event.coordinate.filter(Coordinate::is_finite)
}

/// Bin a coordinate and key the record by its cell
#[inline]
pub fn rekey(
    binner: &HexGridBinner,
    coordinate: Coordinate,
    timestamp_ms: i64,
    key_precision: usize,
) -> KeyedEvent {
    let cell = binner.bin(coordinate.x, coordinate.y);
    KeyedEvent { cell_key: cell.key(key_precision), timestamp_ms }
}

/// Worker that owns `cell_key`. Stable for a given worker count.
#[inline]
pub fn route(cell_key: &CellKey, workers: usize) -> usize {
    let mut hasher = FxHasher::default();
    cell_key.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// Filter, timestamp and re-key stages bundled with their parameters
#[derive(Clone)]
pub struct KeyingStage {
    binner: HexGridBinner,
    extractor: Arc<dyn TimestampExtractor>,
    key_precision: usize,
}

impl KeyingStage {
    pub fn new(
        binner: HexGridBinner,
        extractor: Arc<dyn TimestampExtractor>,
        key_precision: usize,
    ) -> Self {
        Self { binner, extractor, key_precision }
    }

    pub fn apply(&self, event: &Event) -> StageOutcome {
        let Some(coordinate) = filter_located(event) else {
            return StageOutcome::MissingGeo;
        };
        match self.extractor.extract_timestamp(event) {
            Ok(ts) => StageOutcome::Keyed(rekey(&self.binner, coordinate, ts, self.key_precision)),
            Err(_) => StageOutcome::MissingTimestamp,
        }
    }
}
