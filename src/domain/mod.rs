//! Domain models - grid geometry, windows and core event types
//!
//! - `hexbin` - `HexGridBinner`, coordinate to hexagon center
//! - `window` - `TumblingWindows`, event-time window assignment
//! - `types` - `Event`, `Cell`, `CellKey`, `WindowedCount` and wire shapes
//! - `error` - `GeoError`

pub mod error;
pub mod hexbin;
pub mod types;
pub mod window;

// Re-export commonly used types at module level
pub use error::GeoError;
pub use hexbin::HexGridBinner;
pub use types::{Cell, CellKey, Coordinate, Event, HexIndex, KeyedEvent, WindowedCount};
pub use window::TumblingWindows;
