//! JSONL files: event replay source and count sink
//!
//! Replay reads one payload per line, so a capture of the input topic can be
//! run through the pipeline offline. The sink appends one JSON count record
//! per line.

use crate::domain::types::{Event, WindowedCount};
use crate::infra::metrics::Metrics;
use crate::io::codec::{accept_payload, encode_count};
use crate::io::sink::CountSink;
use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Replay a JSONL file into the pipeline
///
/// Stops at end of file, on shutdown, or when the pipeline hangs up. Returns
/// the number of lines read.
pub async fn replay_file(
    path: &Path,
    event_tx: mpsc::Sender<Event>,
    metrics: &Metrics,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<u64> {
    let file = File::open(path)
        .await
        .with_context(|| format!("Failed to open replay file {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut read = 0u64;

    info!(file = %path.display(), "replay_started");

    loop {
        tokio::select! {
            Ok(()) = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(lines = %read, "replay_shutdown");
                    return Ok(read);
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.with_context(|| format!("Failed to read {}", path.display()))? else {
                    break;
                };
                read += 1;
                let Some(event) = accept_payload(line.as_bytes(), metrics) else {
                    continue;
                };
                if event_tx.send(event).await.is_err() {
                    debug!("replay_pipeline_closed");
                    break;
                }
            }
        }
    }

    info!(file = %path.display(), lines = %read, "replay_finished");
    Ok(read)
}

/// Appends count records to a file, one JSON object per line
pub struct JsonlCountSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlCountSink {
    /// Open `path` for appending, creating parent directories as needed
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open sink file {}", path.display()))?;

        info!(file_path = %path.display(), "jsonl_sink_initialized");
        Ok(Self { path, writer: BufWriter::new(file) })
    }
}

#[async_trait]
impl CountSink for JsonlCountSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn write(&mut self, count: &WindowedCount) -> anyhow::Result<()> {
        let mut line = encode_count(count)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        debug!(file = %self.path.display(), bytes = %line.len(), "count_written");
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Cell;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_replay_skips_bad_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        fs::write(
            &path,
            concat!(
                r#"{"geo":{"coordinates":[1.0,2.0]},"timestamp_ms":"10"}"#,
                "\n",
                "\n",
                "not json\n",
                r#"{"geo":null,"timestamp_ms":11}"#,
                "\n",
            ),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Metrics::new();

        let read = replay_file(&path, tx, &metrics, shutdown_rx).await.unwrap();
        assert_eq!(read, 4);
        assert_eq!(metrics.events_received(), 4);
        assert_eq!(metrics.events_malformed(), 1);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.timestamp_ms, Some(10));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.coordinate, None);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_replay_missing_file() {
        let (tx, _rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let result = replay_file(Path::new("/nonexistent/events.jsonl"), tx, &Metrics::new(), shutdown_rx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_sink_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("counts.jsonl");
        let count = WindowedCount {
            window_start_ms: 1467766800000,
            cell_key: Cell::new(-122.40908238574796, 37.79375).key(6),
            count: 2,
        };

        let mut sink = JsonlCountSink::open(&path).await.unwrap();
        sink.write(&count).await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);

        // Reopening appends rather than truncating
        let mut sink = JsonlCountSink::open(&path).await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        tx.send(count).await.unwrap();
        drop(tx);
        crate::io::sink::run_sink(&mut sink, rx, Arc::new(Metrics::new())).await;

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed["key"], "1467766800000 37.793750 -122.409082");
        assert_eq!(parsed["count"], 2);
    }
}
