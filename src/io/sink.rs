//! Count sinks
//!
//! A sink receives every `WindowedCount` the pipeline emits. Write failures
//! are logged and counted; they never stop the pipeline.

use crate::domain::types::WindowedCount;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[async_trait]
pub trait CountSink: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    async fn write(&mut self, count: &WindowedCount) -> anyhow::Result<()>;

    /// Called once after the last count
    async fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Drain `counts` into `sink` until the pipeline closes the channel
///
/// Returns the number of counts written successfully.
pub async fn run_sink<S: CountSink + ?Sized>(
    sink: &mut S,
    mut counts: mpsc::Receiver<WindowedCount>,
    metrics: Arc<Metrics>,
) -> u64 {
    info!(sink = %sink.name(), "sink_started");
    let mut written = 0u64;

    while let Some(count) = counts.recv().await {
        match sink.write(&count).await {
            Ok(()) => written += 1,
            Err(e) => {
                metrics.record_sink_failure();
                warn!(sink = %sink.name(), key = %count.record_key(), error = %format!("{e:#}"), "sink_write_failed");
            }
        }
    }

    if let Err(e) = sink.flush().await {
        warn!(sink = %sink.name(), error = %format!("{e:#}"), "sink_flush_failed");
    }
    info!(sink = %sink.name(), written = %written, "sink_stopped");
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Cell;

    /// Fails every other write
    struct FlakySink {
        calls: usize,
        seen: Vec<u64>,
        flushed: bool,
    }

    #[async_trait]
    impl CountSink for FlakySink {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn write(&mut self, count: &WindowedCount) -> anyhow::Result<()> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                anyhow::bail!("broker unavailable");
            }
            self.seen.push(count.count);
            Ok(())
        }

        async fn flush(&mut self) -> anyhow::Result<()> {
            self.flushed = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failures_counted_not_fatal() {
        let (tx, rx) = mpsc::channel(8);
        let metrics = Arc::new(Metrics::new());
        for count in 1..=4 {
            tx.send(WindowedCount { window_start_ms: 0, cell_key: Cell::new(0.0, 0.0).key(6), count })
                .await
                .unwrap();
        }
        drop(tx);

        let mut sink = FlakySink { calls: 0, seen: Vec::new(), flushed: false };
        let written = run_sink(&mut sink, rx, metrics.clone()).await;

        assert_eq!(written, 2);
        assert_eq!(sink.seen, vec![1, 3]);
        assert!(sink.flushed);
        assert_eq!(metrics.sink_failures(), 2);
    }
}
