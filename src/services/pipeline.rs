//! Windowed geo count pipeline
//!
//! Wires the stages into tasks connected by bounded channels:
//!
//! ```text
//! events -> keying (filter, timestamp, bin, re-key) -> router -> N workers -> counts
//! ```
//!
//! The router owns stream time. Whenever stream time moves the set of open
//! windows forward it broadcasts `Advance` to every worker before forwarding
//! the record that moved it. Closing the input channel drains every stage in
//! order; the count channel closes once the last worker has flushed.

use crate::domain::error::GeoError;
use crate::domain::types::{Event, KeyedEvent, WindowedCount};
use crate::domain::window::TumblingWindows;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::aggregator::{AggregationWorker, EmitMode, WindowedCounter, WorkerMessage};
use crate::services::stages::{route, KeyingStage, StageOutcome};
use crate::services::timestamp::TimestampExtractor;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct WindowedGeoCountPipeline {
    stage: KeyingStage,
    windows: TumblingWindows,
    /// Event time given to timestamp-less events; its window stays open
    default_timestamp_ms: Option<i64>,
    emit_mode: EmitMode,
    workers: usize,
    channel_capacity: usize,
    metrics: Arc<Metrics>,
}

impl WindowedGeoCountPipeline {
    pub fn new(
        config: &Config,
        extractor: Arc<dyn TimestampExtractor>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, GeoError> {
        let binner = config.binner()?;
        let windows = config.windows()?;
        if config.workers() == 0 {
            return Err(GeoError::invalid("pipeline.workers", "must be at least 1"));
        }

        Ok(Self {
            default_timestamp_ms: extractor.default_timestamp(),
            stage: KeyingStage::new(binner, extractor, config.key_precision()),
            windows,
            emit_mode: config.emit_mode(),
            workers: config.workers(),
            channel_capacity: config.channel_capacity().max(1),
            metrics,
        })
    }

    /// Spawn every stage task; returns the stream of windowed counts
    pub fn spawn(self, input: mpsc::Receiver<Event>) -> mpsc::Receiver<WindowedCount> {
        let (keyed_tx, keyed_rx) = mpsc::channel(self.channel_capacity);
        let (out_tx, out_rx) = mpsc::channel(self.channel_capacity);

        let mut senders = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            let (tx, rx) = mpsc::channel(self.channel_capacity);
            senders.push(tx);
            let mut counter = WindowedCounter::new(self.windows, self.emit_mode);
            if let Some(timestamp_ms) = self.default_timestamp_ms {
                counter = counter.with_pinned_window(timestamp_ms);
            }
            let worker = AggregationWorker::new(id, counter, rx, out_tx.clone(), self.metrics.clone());
            tokio::spawn(worker.run());
        }
        drop(out_tx);

        info!(
            workers = %self.workers,
            window_size_ms = %self.windows.size_ms(),
            grace_ms = %self.windows.grace_ms(),
            emit = ?self.emit_mode,
            "pipeline_started"
        );

        tokio::spawn(run_keying(self.stage, input, keyed_tx, self.metrics.clone()));
        let router = Router::new(self.windows, senders, self.metrics);
        tokio::spawn(router.run(keyed_rx));

        out_rx
    }
}

async fn run_keying(
    stage: KeyingStage,
    mut input: mpsc::Receiver<Event>,
    out: mpsc::Sender<KeyedEvent>,
    metrics: Arc<Metrics>,
) {
    while let Some(event) = input.recv().await {
        let started = Instant::now();
        match stage.apply(&event) {
            StageOutcome::Keyed(keyed) => {
                metrics.record_event_binned(started.elapsed().as_micros() as u64);
                if out.send(keyed).await.is_err() {
                    warn!("keying_output_closed");
                    return;
                }
            }
            StageOutcome::MissingGeo => metrics.record_missing_geo(),
            StageOutcome::MissingTimestamp => {
                metrics.record_missing_timestamp();
                debug!(error = %GeoError::MissingTimestamp, "event_dropped");
            }
        }
    }
    debug!("keying_stage_drained");
}

/// Shuffles keyed records to the worker owning their cell
struct Router {
    windows: TumblingWindows,
    senders: Vec<mpsc::Sender<WorkerMessage>>,
    metrics: Arc<Metrics>,
    stream_time_ms: i64,
    /// Oldest window start still open at `stream_time_ms`
    open_from_ms: i64,
}

impl Router {
    fn new(
        windows: TumblingWindows,
        senders: Vec<mpsc::Sender<WorkerMessage>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { windows, senders, metrics, stream_time_ms: i64::MIN, open_from_ms: i64::MIN }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<KeyedEvent>) {
        while let Some(record) = rx.recv().await {
            if record.timestamp_ms > self.stream_time_ms && !self.observe(record.timestamp_ms).await {
                return;
            }

            let worker = route(&record.cell_key, self.senders.len());
            if self.senders[worker].send(WorkerMessage::Record(record)).await.is_err() {
                warn!(worker = %worker, "router_worker_closed");
                return;
            }
        }
        debug!(stream_time_ms = %self.stream_time_ms, "router_drained");
    }

    /// Move stream time forward, telling workers when windows close
    async fn observe(&mut self, timestamp_ms: i64) -> bool {
        self.stream_time_ms = timestamp_ms;
        self.metrics.set_stream_time(timestamp_ms);

        let open_from_ms = self.windows.open_from(timestamp_ms);
        if open_from_ms <= self.open_from_ms {
            return true;
        }
        self.open_from_ms = open_from_ms;

        for (worker, sender) in self.senders.iter().enumerate() {
            if sender.send(WorkerMessage::Advance(timestamp_ms)).await.is_err() {
                warn!(worker = %worker, "router_worker_closed");
                return false;
            }
        }
        true
    }
}
