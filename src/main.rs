//! geowindow - hex-binned event counts over tumbling windows
//!
//! Reads geotagged events (MQTT topic or JSONL replay), snaps each one to a
//! hexagonal grid cell and publishes per-window, per-cell counts.
//!
//! Module structure:
//! - `domain/` - Grid geometry, windows, event types
//! - `io/` - External interfaces (MQTT, JSONL files, Prometheus)
//! - `services/` - Pipeline stages and windowed aggregation
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use anyhow::Context;
use clap::Parser;
use geowindow::infra::{Config, Metrics, SinkKind, SourceKind};
use geowindow::io::{replay_file, run_sink, CountSink, JsonlCountSink, MqttCountPublisher};
use geowindow::services::{EventTimestampExtractor, WindowedGeoCountPipeline};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Hex-binned windowed counts of geotagged events
#[derive(Parser, Debug)]
#[command(name = "geowindow", version, about)]
struct Args {
    /// Path to TOML configuration file [default: $CONFIG_FILE or config/dev.toml]
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("geowindow starting");

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(Config::resolve_config_path);
    let config = Config::load_from_path(&config_path);
    config.validate().context("invalid configuration")?;

    info!(
        config_file = %config.config_file(),
        source = ?config.source_kind(),
        sink = ?config.sink_kind(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        input_topic = %config.mqtt_input_topic(),
        output_topic = %config.mqtt_output_topic(),
        radius = %config.grid_radius(),
        window_size_ms = %config.window_size_ms(),
        grace_ms = %config.window_grace_ms(),
        emit = ?config.emit_mode(),
        workers = %config.workers(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    geowindow::infra::broker::start_embedded_broker(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Pipeline: events in, windowed counts out
    let extractor = Arc::new(EventTimestampExtractor::new(config.missing_timestamp()));
    let pipeline = WindowedGeoCountPipeline::new(&config, extractor, metrics.clone())?;
    let (event_tx, event_rx) = mpsc::channel(config.channel_capacity());
    let counts = pipeline.spawn(event_rx);

    // Sink runs until the pipeline has flushed its last window
    let mut sink: Box<dyn CountSink> = match config.sink_kind() {
        SinkKind::Mqtt => Box::new(MqttCountPublisher::new(&config)),
        SinkKind::Jsonl => Box::new(JsonlCountSink::open(config.sink_file()).await?),
    };
    let sink_metrics = metrics.clone();
    let sink_task = tokio::spawn(async move { run_sink(sink.as_mut(), counts, sink_metrics).await });

    // Source owns the only event sender; when it returns the pipeline drains
    let source_metrics = metrics.clone();
    let source_shutdown = shutdown_rx.clone();
    match config.source_kind() {
        SourceKind::Mqtt => {
            let source_config = config.clone();
            tokio::spawn(async move {
                if let Err(e) = geowindow::io::start_mqtt_source(
                    &source_config,
                    event_tx,
                    source_metrics,
                    source_shutdown,
                )
                .await
                {
                    error!(error = %e, "mqtt_source_failed");
                }
            });
        }
        SourceKind::Jsonl => {
            let path = PathBuf::from(config.source_file());
            tokio::spawn(async move {
                if let Err(e) = replay_file(&path, event_tx, &source_metrics, source_shutdown).await {
                    error!(error = %format!("{e:#}"), "replay_failed");
                }
            });
        }
    }

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_service = config.service_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = geowindow::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_service,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let written = sink_task.await.context("sink task panicked")?;
    metrics.report().log();

    info!(written = %written, "geowindow shutdown complete");
    Ok(())
}
