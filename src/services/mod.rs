//! Services - the counting pipeline
//!
//! - `stages` - filter, re-key and route functions
//! - `timestamp` - injected event-time extraction
//! - `aggregator` - per-worker windowed counting
//! - `pipeline` - task wiring from events to windowed counts

pub mod aggregator;
pub mod pipeline;
pub mod stages;
pub mod timestamp;

// Re-export commonly used types
pub use aggregator::{EmitMode, WindowedCounter};
pub use pipeline::WindowedGeoCountPipeline;
pub use stages::KeyingStage;
pub use timestamp::{EventTimestampExtractor, MissingTimestampPolicy, TimestampExtractor};
