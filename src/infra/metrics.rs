//! Pipeline counters and periodic reporting
//!
//! Every stage records into shared atomics without locking. `report()`
//! swaps the per-interval counters (throughput, latency histogram) back to
//! zero for the periodic log. `snapshot()` reads the monotonic totals and
//! resets nothing, so scrapes and the log reporter do not disturb each other.
//!
//! NOTE: All atomics use Relaxed ordering: these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤1, ≤2, ≤4, ≤8, ≤16, ≤32, ≤64, ≤128, ≤256, ≤512, >512
const BUCKET_BOUNDS: [u64; 10] = [1, 2, 4, 8, 16, 32, 64, 128, 256, 512];
const NUM_BUCKETS: usize = 11;

pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Read all buckets without resetting them
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] = [1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Payloads taken off a source (monotonic)
    events_received: AtomicU64,
    /// Payloads that failed to decode (monotonic)
    events_malformed: AtomicU64,
    /// Events dropped for lacking a coordinate (monotonic)
    events_missing_geo: AtomicU64,
    /// Events dropped for lacking a timestamp (monotonic)
    events_missing_timestamp: AtomicU64,
    /// Events binned and routed to a worker (monotonic)
    events_binned: AtomicU64,
    /// Binned events since last report (reset on report)
    binned_since_report: AtomicU64,
    /// Records that arrived after their window closed (monotonic)
    events_late: AtomicU64,
    /// Windowed count records emitted (monotonic)
    counts_emitted: AtomicU64,
    /// Count records the sink failed to write (monotonic)
    sink_failures: AtomicU64,
    /// Windows flushed and evicted (monotonic)
    windows_closed: AtomicU64,
    /// Open (window, cell) groups across all workers
    open_groups: AtomicU64,
    /// Sum of stage latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max stage latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Stage latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of stage latencies in microseconds (monotonic)
    latency_sum_total_us: AtomicU64,
    /// Stage latency histogram buckets (monotonic)
    latency_buckets_total: [AtomicU64; NUM_BUCKETS],
    /// Highest event timestamp seen by the router
    stream_time_ms: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_malformed: AtomicU64::new(0),
            events_missing_geo: AtomicU64::new(0),
            events_missing_timestamp: AtomicU64::new(0),
            events_binned: AtomicU64::new(0),
            binned_since_report: AtomicU64::new(0),
            events_late: AtomicU64::new(0),
            counts_emitted: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            windows_closed: AtomicU64::new(0),
            open_groups: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            latency_sum_total_us: AtomicU64::new(0),
            latency_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            stream_time_ms: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_malformed(&self) {
        self.events_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_missing_geo(&self) {
        self.events_missing_geo.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_missing_timestamp(&self) {
        self.events_missing_timestamp.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event binned and routed, with its stage latency (lock-free)
    #[inline]
    pub fn record_event_binned(&self, latency_us: u64) {
        self.events_binned.fetch_add(1, Ordering::Relaxed);
        self.binned_since_report.fetch_add(1, Ordering::Relaxed);
        let bucket = bucket_index(latency_us);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.latency_sum_total_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_buckets_total[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_late_event(&self) {
        self.events_late.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_count_emitted(&self) {
        self.counts_emitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `n` (window, worker) partitions flushed and evicted
    #[inline]
    pub fn record_windows_closed(&self, n: u64) {
        self.windows_closed.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn group_opened(&self) {
        self.open_groups.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `n` groups evicted; saturates at zero
    #[inline]
    pub fn groups_closed(&self, n: u64) {
        let _ = self.open_groups.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            Some(current.saturating_sub(n))
        });
    }

    /// Stream time as seen by the router (negative times read as 0)
    #[inline]
    pub fn set_stream_time(&self, stream_time_ms: i64) {
        self.stream_time_ms.store(u64::try_from(stream_time_ms).unwrap_or(0), Ordering::Relaxed);
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    pub fn events_malformed(&self) -> u64 {
        self.events_malformed.load(Ordering::Relaxed)
    }

    pub fn events_missing_geo(&self) -> u64 {
        self.events_missing_geo.load(Ordering::Relaxed)
    }

    pub fn events_missing_timestamp(&self) -> u64 {
        self.events_missing_timestamp.load(Ordering::Relaxed)
    }

    pub fn events_binned(&self) -> u64 {
        self.events_binned.load(Ordering::Relaxed)
    }

    pub fn events_late(&self) -> u64 {
        self.events_late.load(Ordering::Relaxed)
    }

    pub fn counts_emitted(&self) -> u64 {
        self.counts_emitted.load(Ordering::Relaxed)
    }

    pub fn sink_failures(&self) -> u64 {
        self.sink_failures.load(Ordering::Relaxed)
    }

    pub fn windows_closed(&self) -> u64 {
        self.windows_closed.load(Ordering::Relaxed)
    }

    pub fn open_groups(&self) -> u64 {
        self.open_groups.load(Ordering::Relaxed)
    }

    /// Current totals since start; resets nothing
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_received: self.events_received(),
            events_malformed: self.events_malformed(),
            events_missing_geo: self.events_missing_geo(),
            events_missing_timestamp: self.events_missing_timestamp(),
            events_binned: self.events_binned(),
            events_late: self.events_late(),
            counts_emitted: self.counts_emitted(),
            sink_failures: self.sink_failures(),
            windows_closed: self.windows_closed(),
            open_groups: self.open_groups(),
            stream_time_ms: self.stream_time_ms.load(Ordering::Relaxed),
            latency_sum_us: self.latency_sum_total_us.load(Ordering::Relaxed),
            lat_buckets: load_buckets(&self.latency_buckets_total),
        }
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let binned_count = self.binned_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let events_per_sec = if elapsed.as_secs_f64() > 0.0 {
            binned_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if binned_count > 0 { latency_sum / binned_count } else { 0 };

        MetricsSummary {
            events_received: self.events_received(),
            events_malformed: self.events_malformed(),
            events_missing_geo: self.events_missing_geo(),
            events_missing_timestamp: self.events_missing_timestamp(),
            events_binned: self.events_binned(),
            events_late: self.events_late(),
            counts_emitted: self.counts_emitted(),
            sink_failures: self.sink_failures(),
            windows_closed: self.windows_closed(),
            open_groups: self.open_groups(),
            stream_time_ms: self.stream_time_ms.load(Ordering::Relaxed),
            events_per_sec,
            avg_latency_us: avg_latency,
            max_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic totals produced by `Metrics::snapshot`
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub events_received: u64,
    pub events_malformed: u64,
    pub events_missing_geo: u64,
    pub events_missing_timestamp: u64,
    pub events_binned: u64,
    pub events_late: u64,
    pub counts_emitted: u64,
    pub sink_failures: u64,
    pub windows_closed: u64,
    pub open_groups: u64,
    pub stream_time_ms: u64,
    /// Sum of every stage latency recorded
    pub latency_sum_us: u64,
    /// Stage latency histogram buckets since start (not cumulative)
    pub lat_buckets: [u64; NUM_BUCKETS],
}

/// Interval summary produced by `Metrics::report`
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub events_received: u64,
    pub events_malformed: u64,
    pub events_missing_geo: u64,
    pub events_missing_timestamp: u64,
    pub events_binned: u64,
    pub events_late: u64,
    pub counts_emitted: u64,
    pub sink_failures: u64,
    pub windows_closed: u64,
    pub open_groups: u64,
    pub stream_time_ms: u64,
    /// Binned events per second since the previous report
    pub events_per_sec: f64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
    /// Stage latency histogram buckets
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            received = %self.events_received,
            binned = %self.events_binned,
            malformed = %self.events_malformed,
            missing_geo = %self.events_missing_geo,
            missing_ts = %self.events_missing_timestamp,
            late = %self.events_late,
            emitted = %self.counts_emitted,
            open_groups = %self.open_groups,
            events_per_sec = format!("{:.1}", self.events_per_sec),
            p99_us = %self.lat_p99_us,
            "metrics"
        );
    }
}
