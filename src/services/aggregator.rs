//! Windowed counting per (window, cell) group
//!
//! Each aggregation worker owns a disjoint set of cell keys (assigned by the
//! router's hash) and keeps running counts for them. Windows close once the
//! router-broadcast stream time passes their end plus grace; closed windows
//! are evicted and later records for them are dropped as late.
//!
//! A counter may pin one window (the window of the default event time when
//! timestamp-less events are counted). A pinned window never closes before
//! the final flush.

use crate::domain::types::{CellKey, KeyedEvent, WindowedCount};
use crate::domain::window::TumblingWindows;
use crate::infra::metrics::Metrics;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// When count records leave the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmitMode {
    /// Every update emits the group's current count
    #[default]
    Changes,
    /// One record per group when its window closes
    Final,
}

/// Message from the router to an aggregation worker
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Record(KeyedEvent),
    /// Stream time moved forward; close whatever it closes
    Advance(i64),
}

/// Result of counting one record
#[derive(Debug, Clone, PartialEq)]
pub enum Counted {
    /// Count updated; emit this record now (changes mode)
    Emit(WindowedCount),
    /// Count updated; held until window close (final mode)
    Held,
    /// Record's window already closed
    Late,
}

/// Running counts for the groups one worker owns
#[derive(Debug)]
pub struct WindowedCounter {
    windows: TumblingWindows,
    mode: EmitMode,
    /// Window start -> cell -> count, iterated oldest window first
    groups: BTreeMap<i64, FxHashMap<CellKey, u64>>,
    group_count: usize,
    stream_time_ms: i64,
    pinned_window_ms: Option<i64>,
}

impl WindowedCounter {
    pub fn new(windows: TumblingWindows, mode: EmitMode) -> Self {
        Self {
            windows,
            mode,
            groups: BTreeMap::new(),
            group_count: 0,
            stream_time_ms: i64::MIN,
            pinned_window_ms: None,
        }
    }

    /// Keep the window containing `timestamp_ms` open until `flush`
    pub fn with_pinned_window(mut self, timestamp_ms: i64) -> Self {
        self.pinned_window_ms = Some(self.windows.window_start(timestamp_ms));
        self
    }

    /// Number of open (window, cell) groups
    pub fn open_groups(&self) -> usize {
        self.group_count
    }

    /// Number of windows with at least one open group
    pub fn open_windows(&self) -> usize {
        self.groups.len()
    }

    pub fn stream_time_ms(&self) -> i64 {
        self.stream_time_ms
    }

    /// Count one record in its window
    pub fn add(&mut self, record: KeyedEvent) -> Counted {
        let window_start = self.windows.window_start(record.timestamp_ms);
        let pinned = self.pinned_window_ms == Some(window_start);
        if !pinned && self.windows.is_closed(window_start, self.stream_time_ms) {
            return Counted::Late;
        }

        let cells = self.groups.entry(window_start).or_default();
        let count = match cells.get_mut(&record.cell_key) {
            Some(count) => {
                *count += 1;
                *count
            }
            None => {
                cells.insert(record.cell_key.clone(), 1);
                self.group_count += 1;
                1
            }
        };

        match self.mode {
            EmitMode::Changes => Counted::Emit(WindowedCount {
                window_start_ms: window_start,
                cell_key: record.cell_key,
                count,
            }),
            EmitMode::Final => Counted::Held,
        }
    }

    /// Move stream time forward and close every window it passes
    ///
    /// Stream time never moves back; an older value is ignored.
    pub fn advance(&mut self, stream_time_ms: i64) -> ClosedWindows {
        if stream_time_ms <= self.stream_time_ms {
            return ClosedWindows::default();
        }
        self.stream_time_ms = stream_time_ms;

        let still_open = self.groups.split_off(&self.windows.open_from(stream_time_ms));
        let mut closed = std::mem::replace(&mut self.groups, still_open);
        if let Some(pinned) = self.pinned_window_ms {
            if let Some(cells) = closed.remove(&pinned) {
                self.groups.insert(pinned, cells);
            }
        }
        self.drain(closed)
    }

    /// Close every open window, e.g. when the input ends
    pub fn flush(&mut self) -> ClosedWindows {
        let closed = std::mem::take(&mut self.groups);
        self.drain(closed)
    }

    fn drain(&mut self, closed: BTreeMap<i64, FxHashMap<CellKey, u64>>) -> ClosedWindows {
        let mut result = ClosedWindows { windows: closed.len(), ..Default::default() };

        for (window_start, cells) in closed {
            result.groups += cells.len();
            if self.mode == EmitMode::Final {
                let mut cells: Vec<_> = cells.into_iter().collect();
                cells.sort_unstable_by(|a, b| a.0.cmp(&b.0));
                result.records.extend(cells.into_iter().map(|(cell_key, count)| WindowedCount {
                    window_start_ms: window_start,
                    cell_key,
                    count,
                }));
            }
        }

        self.group_count -= result.groups;
        result
    }
}

/// Windows evicted by one `advance` or `flush`
#[derive(Debug, Default, PartialEq)]
pub struct ClosedWindows {
    /// Final counts, oldest window first, cells in key order (final mode only)
    pub records: Vec<WindowedCount>,
    pub windows: usize,
    pub groups: usize,
}

/// Task owning one `WindowedCounter`
pub struct AggregationWorker {
    id: usize,
    counter: WindowedCounter,
    rx: mpsc::Receiver<WorkerMessage>,
    out: mpsc::Sender<WindowedCount>,
    metrics: Arc<Metrics>,
}

impl AggregationWorker {
    pub fn new(
        id: usize,
        counter: WindowedCounter,
        rx: mpsc::Receiver<WorkerMessage>,
        out: mpsc::Sender<WindowedCount>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { id, counter, rx, out, metrics }
    }

    /// Run until the router hangs up, then flush every open window
    pub async fn run(mut self) {
        info!(worker = %self.id, "aggregation_worker_started");

        while let Some(msg) = self.rx.recv().await {
            let delivered = match msg {
                WorkerMessage::Record(record) => self.count(record).await,
                WorkerMessage::Advance(stream_time_ms) => {
                    let closed = self.counter.advance(stream_time_ms);
                    self.close(closed).await
                }
            };
            if !delivered {
                warn!(worker = %self.id, "aggregation_output_closed");
                return;
            }
        }

        let closed = self.counter.flush();
        debug!(worker = %self.id, windows = %closed.windows, groups = %closed.groups, "aggregation_flush");
        self.close(closed).await;

        info!(worker = %self.id, "aggregation_worker_stopped");
    }

    async fn count(&mut self, record: KeyedEvent) -> bool {
        let groups_before = self.counter.open_groups();
        let counted = self.counter.add(record);
        if self.counter.open_groups() > groups_before {
            self.metrics.group_opened();
        }

        match counted {
            Counted::Emit(count) => self.emit(count).await,
            Counted::Held => true,
            Counted::Late => {
                self.metrics.record_late_event();
                debug!(
                    worker = %self.id,
                    stream_time_ms = %self.counter.stream_time_ms(),
                    "late_record_dropped"
                );
                true
            }
        }
    }

    async fn close(&mut self, closed: ClosedWindows) -> bool {
        self.metrics.record_windows_closed(closed.windows as u64);
        self.metrics.groups_closed(closed.groups as u64);

        for record in closed.records {
            if !self.emit(record).await {
                return false;
            }
        }
        true
    }

    async fn emit(&self, record: WindowedCount) -> bool {
        if self.out.send(record).await.is_err() {
            return false;
        }
        self.metrics.record_count_emitted();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Cell;

    const HOUR: i64 = 3_600_000;
    const MINUTE: i64 = 60_000;
    const BASE: i64 = 1467766800000;

    fn key(n: u32) -> CellKey {
        Cell::new(n as f64, 0.5).key(6)
    }

    fn record(n: u32, timestamp_ms: i64) -> KeyedEvent {
        KeyedEvent { cell_key: key(n), timestamp_ms }
    }

    fn counter(mode: EmitMode, grace_ms: i64) -> WindowedCounter {
        WindowedCounter::new(TumblingWindows::new(HOUR, grace_ms).unwrap(), mode)
    }

    #[test]
    fn test_changes_mode_emits_running_count() {
        let mut counter = counter(EmitMode::Changes, 0);
        let first = counter.add(record(1, BASE));
        let second = counter.add(record(1, BASE + 10 * MINUTE));

        assert_eq!(
            first,
            Counted::Emit(WindowedCount { window_start_ms: BASE, cell_key: key(1), count: 1 })
        );
        assert_eq!(
            second,
            Counted::Emit(WindowedCount { window_start_ms: BASE, cell_key: key(1), count: 2 })
        );
        assert_eq!(counter.open_groups(), 1);
    }

    #[test]
    fn test_final_mode_two_events_one_record() {
        let mut counter = counter(EmitMode::Final, 0);
        assert_eq!(counter.add(record(1, BASE + 5 * MINUTE)), Counted::Held);
        assert_eq!(counter.add(record(1, BASE + 15 * MINUTE)), Counted::Held);

        let closed = counter.advance(BASE + HOUR);
        assert_eq!(closed.windows, 1);
        assert_eq!(closed.groups, 1);
        assert_eq!(
            closed.records,
            vec![WindowedCount { window_start_ms: BASE, cell_key: key(1), count: 2 }]
        );
        assert_eq!(counter.open_groups(), 0);
    }

    #[test]
    fn test_windows_are_separate() {
        let mut counter = counter(EmitMode::Final, 0);
        for i in 0..5 {
            counter.add(record(1, BASE + i * MINUTE));
        }
        counter.add(record(1, BASE + HOUR));
        counter.add(record(1, BASE + HOUR + 1));

        let closed = counter.flush();
        assert_eq!(
            closed.records,
            vec![
                WindowedCount { window_start_ms: BASE, cell_key: key(1), count: 5 },
                WindowedCount { window_start_ms: BASE + HOUR, cell_key: key(1), count: 2 },
            ]
        );
    }

    #[test]
    fn test_cells_are_separate_and_sorted() {
        let mut counter = counter(EmitMode::Final, 0);
        counter.add(record(2, BASE));
        counter.add(record(1, BASE));
        counter.add(record(2, BASE + 1));

        let closed = counter.flush();
        let counts: Vec<_> = closed.records.iter().map(|r| (r.cell_key.clone(), r.count)).collect();
        assert_eq!(counts, vec![(key(1), 1), (key(2), 2)]);
    }

    #[test]
    fn test_late_records_dropped_after_grace() {
        let mut counter = counter(EmitMode::Changes, 5 * MINUTE);
        counter.add(record(1, BASE));

        // Inside grace: still open
        assert!(counter.advance(BASE + HOUR + MINUTE).records.is_empty());
        assert!(matches!(counter.add(record(1, BASE + 30 * MINUTE)), Counted::Emit(_)));

        // Past grace: closed and evicted
        let closed = counter.advance(BASE + HOUR + 5 * MINUTE);
        assert_eq!(closed.windows, 1);
        assert_eq!(counter.open_groups(), 0);
        assert_eq!(counter.add(record(1, BASE + 59 * MINUTE)), Counted::Late);
    }

    #[test]
    fn test_advance_never_moves_back() {
        let mut counter = counter(EmitMode::Final, 0);
        counter.advance(BASE + 2 * HOUR);
        assert_eq!(counter.advance(BASE), ClosedWindows::default());
        assert_eq!(counter.stream_time_ms(), BASE + 2 * HOUR);
        assert_eq!(counter.add(record(1, BASE + HOUR - 1)), Counted::Late);
        assert_eq!(counter.add(record(1, BASE + 2 * HOUR)), Counted::Held);
        assert_eq!(counter.open_windows(), 1);
    }

    #[test]
    fn test_pinned_window_stays_open_until_flush() {
        let mut counter = counter(EmitMode::Final, 0).with_pinned_window(0);
        counter.add(record(1, BASE));
        counter.add(record(2, 0));

        // Real event time far past window 0
        let closed = counter.advance(BASE + 2 * HOUR);
        assert_eq!(
            closed.records,
            vec![WindowedCount { window_start_ms: BASE, cell_key: key(1), count: 1 }]
        );
        assert_eq!(counter.open_windows(), 1);

        assert_eq!(counter.add(record(2, 0)), Counted::Held);
        assert_eq!(counter.add(record(2, 5)), Counted::Held);
        assert_eq!(counter.add(record(1, BASE + 1)), Counted::Late);

        let flushed = counter.flush();
        assert_eq!(
            flushed.records,
            vec![WindowedCount { window_start_ms: 0, cell_key: key(2), count: 3 }]
        );
        assert_eq!(counter.open_groups(), 0);
    }

    #[tokio::test]
    async fn test_worker_flushes_on_close() {
        let (tx, rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let metrics = Arc::new(Metrics::new());
        let worker =
            AggregationWorker::new(0, counter(EmitMode::Final, 0), rx, out_tx, metrics.clone());
        let handle = tokio::spawn(worker.run());

        tx.send(WorkerMessage::Record(record(1, BASE))).await.unwrap();
        tx.send(WorkerMessage::Record(record(1, BASE + 10 * MINUTE))).await.unwrap();
        tx.send(WorkerMessage::Record(record(2, BASE + HOUR))).await.unwrap();
        tx.send(WorkerMessage::Advance(BASE + HOUR)).await.unwrap();

        let first = out_rx.recv().await.unwrap();
        assert_eq!(first, WindowedCount { window_start_ms: BASE, cell_key: key(1), count: 2 });

        drop(tx);
        let last = out_rx.recv().await.unwrap();
        assert_eq!(last.window_start_ms, BASE + HOUR);
        assert_eq!(last.count, 1);
        assert!(out_rx.recv().await.is_none());
        handle.await.unwrap();

        assert_eq!(metrics.counts_emitted(), 2);
        assert_eq!(metrics.windows_closed(), 2);
        assert_eq!(metrics.open_groups(), 0);
    }

    #[tokio::test]
    async fn test_worker_counts_late_records() {
        let (tx, rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let metrics = Arc::new(Metrics::new());
        let worker =
            AggregationWorker::new(3, counter(EmitMode::Changes, 0), rx, out_tx, metrics.clone());
        let handle = tokio::spawn(worker.run());

        tx.send(WorkerMessage::Advance(BASE + 2 * HOUR)).await.unwrap();
        tx.send(WorkerMessage::Record(record(1, BASE))).await.unwrap();
        tx.send(WorkerMessage::Record(record(1, BASE + 2 * HOUR))).await.unwrap();
        drop(tx);

        let only = out_rx.recv().await.unwrap();
        assert_eq!(only.window_start_ms, BASE + 2 * HOUR);
        assert!(out_rx.recv().await.is_none());
        handle.await.unwrap();
        assert_eq!(metrics.events_late(), 1);
    }
}
