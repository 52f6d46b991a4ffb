//! Tumbling event-time windows
//!
//! Windows are `[k * size, (k + 1) * size)` for integer `k`, aligned to the
//! epoch. Stream time only moves forward; a window is closed once stream
//! time reaches its end plus the grace period.

use crate::domain::error::GeoError;

/// Fixed-size, non-overlapping windows over event time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TumblingWindows {
    size_ms: i64,
    grace_ms: i64,
}

impl TumblingWindows {
    pub const DEFAULT_SIZE_MS: i64 = 60 * 60 * 1000;

    pub fn new(size_ms: i64, grace_ms: i64) -> Result<Self, GeoError> {
        if size_ms <= 0 {
            return Err(GeoError::invalid("window.size_ms", format!("{size_ms} must be positive")));
        }
        if grace_ms < 0 {
            return Err(GeoError::invalid(
                "window.grace_ms",
                format!("{grace_ms} must not be negative"),
            ));
        }
        Ok(Self { size_ms, grace_ms })
    }

    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    pub fn grace_ms(&self) -> i64 {
        self.grace_ms
    }

    /// Start of the window containing `timestamp_ms`
    #[inline]
    pub fn window_start(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms.div_euclid(self.size_ms) * self.size_ms
    }

    /// Exclusive end of the window starting at `window_start_ms`
    #[inline]
    pub fn window_end(&self, window_start_ms: i64) -> i64 {
        window_start_ms.saturating_add(self.size_ms)
    }

    /// Whether the window starting at `window_start_ms` accepts no more records
    #[inline]
    pub fn is_closed(&self, window_start_ms: i64, stream_time_ms: i64) -> bool {
        stream_time_ms >= self.window_end(window_start_ms).saturating_add(self.grace_ms)
    }

    /// Earliest window start still open at `stream_time_ms`
    #[inline]
    pub fn open_from(&self, stream_time_ms: i64) -> i64 {
        let horizon = stream_time_ms.saturating_sub(self.grace_ms).saturating_sub(self.size_ms);
        self.window_start(horizon).saturating_add(self.size_ms)
    }
}

impl Default for TumblingWindows {
    fn default() -> Self {
        Self { size_ms: Self::DEFAULT_SIZE_MS, grace_ms: 0 }
    }
}
