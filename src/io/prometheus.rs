//! Prometheus metrics HTTP endpoint
//!
//! Exposes pipeline metrics in Prometheus text format at /metrics and a
//! liveness check at /health. Uses hyper for the HTTP server. Values come
//! from `Metrics::snapshot`, so scraping never resets the interval counters
//! behind the periodic log.

use crate::infra::metrics::{Metrics, MetricsSnapshot, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with service label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    service: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{service=\"{service}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    service: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{service=\"{service}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{service=\"{service}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{service=\"{service}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{service=\"{service}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, service: &str) -> String {
    let snapshot = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_event_metrics(&mut output, service, &snapshot);
    write_window_metrics(&mut output, service, &snapshot);
    write_histogram(
        &mut output,
        "geowindow_stage_latency_us",
        "Keying stage latency in microseconds",
        service,
        &snapshot.lat_buckets,
        snapshot.latency_sum_us,
    );

    output
}

fn write_event_metrics(output: &mut String, service: &str, snapshot: &MetricsSnapshot) {
    let counters = [
        ("geowindow_events_received_total", "Payloads taken off the source", snapshot.events_received),
        ("geowindow_events_malformed_total", "Payloads that failed to decode", snapshot.events_malformed),
        ("geowindow_events_missing_geo_total", "Events dropped without a location", snapshot.events_missing_geo),
        (
            "geowindow_events_missing_timestamp_total",
            "Events dropped without a timestamp",
            snapshot.events_missing_timestamp,
        ),
        ("geowindow_events_binned_total", "Events binned and routed", snapshot.events_binned),
        ("geowindow_events_late_total", "Events dropped after their window closed", snapshot.events_late),
    ];
    for (name, help, val) in counters {
        write_metric(output, name, help, MetricType::Counter, service, val);
    }
}

fn write_window_metrics(output: &mut String, service: &str, snapshot: &MetricsSnapshot) {
    write_metric(
        output,
        "geowindow_counts_emitted_total",
        "Windowed count records emitted",
        MetricType::Counter,
        service,
        snapshot.counts_emitted,
    );
    write_metric(
        output,
        "geowindow_sink_failures_total",
        "Count records the sink failed to write",
        MetricType::Counter,
        service,
        snapshot.sink_failures,
    );
    write_metric(
        output,
        "geowindow_windows_closed_total",
        "Window partitions flushed and evicted",
        MetricType::Counter,
        service,
        snapshot.windows_closed,
    );
    write_metric(
        output,
        "geowindow_open_groups",
        "Open (window, cell) groups",
        MetricType::Gauge,
        service,
        snapshot.open_groups,
    );
    write_metric(
        output,
        "geowindow_stream_time_ms",
        "Highest event timestamp seen",
        MetricType::Gauge,
        service,
        snapshot.stream_time_ms,
    );
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    service: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let mut response =
                text_response(StatusCode::OK, format_prometheus_metrics(&metrics, &service));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }
        (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    service: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let service = Arc::new(service);

    info!(port = %port, service = %service, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let service = service.clone();

                        tokio::spawn(async move {
                            let handler = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let service = service.clone();
                                async move { handle_request(req, metrics, service).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, handler)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            Ok(()) = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_event_received();
        metrics.record_event_binned(3);
        metrics.record_event_binned(700);
        metrics.record_late_event();
        metrics.group_opened();

        let output = format_prometheus_metrics(&metrics, "geowindow");

        assert!(output.contains("geowindow_events_received_total{service=\"geowindow\"} 1"));
        assert!(output.contains("geowindow_events_binned_total{service=\"geowindow\"} 2"));
        assert!(output.contains("geowindow_events_late_total{service=\"geowindow\"} 1"));
        assert!(output.contains("geowindow_open_groups{service=\"geowindow\"} 1"));
        assert!(output.contains("geowindow_stage_latency_us_bucket{service=\"geowindow\",le=\"4\"} 1"));
        assert!(output.contains("geowindow_stage_latency_us_bucket{service=\"geowindow\",le=\"+Inf\"} 2"));
        assert!(output.contains("# TYPE geowindow_stage_latency_us histogram"));
        assert!(output.contains("geowindow_stage_latency_us_sum{service=\"geowindow\"} 703"));
    }

    #[test]
    fn test_scrape_leaves_histogram_intact() {
        let metrics = Metrics::new();
        metrics.record_event_binned(3);
        metrics.record_event_binned(700);

        let first = format_prometheus_metrics(&metrics, "geowindow");
        let second = format_prometheus_metrics(&metrics, "geowindow");
        assert_eq!(first, second);
        assert!(second.contains("geowindow_stage_latency_us_count{service=\"geowindow\"} 2"));

        // Periodic log still gets the interval after scrapes
        assert_eq!(metrics.report().lat_buckets.iter().sum::<u64>(), 2);
        let third = format_prometheus_metrics(&metrics, "geowindow");
        assert!(third.contains("geowindow_stage_latency_us_count{service=\"geowindow\"} 2"));
    }

    #[tokio::test]
    async fn test_server_stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(start_metrics_server(
            0,
            Arc::new(Metrics::new()),
            "geowindow".to_string(),
            shutdown_rx,
        ));
        tokio::task::yield_now().await;
        shutdown_tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
