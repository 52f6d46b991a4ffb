//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument (parsed by clap in main)
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section and key is optional; missing values take the defaults below.

use crate::domain::error::GeoError;
use crate::domain::hexbin::HexGridBinner;
use crate::domain::window::TumblingWindows;
use crate::services::aggregator::EmitMode;
use crate::services::timestamp::MissingTimestampPolicy;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// Where input events come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Mqtt,
    Jsonl,
}

/// Where windowed counts go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Mqtt,
    Jsonl,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service identifier, used for MQTT client ids and metric labels
    #[serde(default = "default_service_id")]
    pub id: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { id: default_service_id() }
    }
}

fn default_service_id() -> String {
    "geowindow".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Topic carrying raw event payloads
    #[serde(default = "default_input_topic")]
    pub input_topic: String,
    /// Topic receiving windowed counts
    #[serde(default = "default_output_topic")]
    pub output_topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            input_topic: default_input_topic(),
            output_topic: default_output_topic(),
            username: None,
            password: None,
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_input_topic() -> String {
    "raw-tweets".to_string()
}

fn default_output_topic() -> String {
    "win_tweet_counts".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GridConfig {
    /// Hexagon center-to-vertex distance, in coordinate units
    #[serde(default = "default_radius")]
    pub radius: f64,
    /// Decimals used when printing cell keys
    #[serde(default = "default_key_precision")]
    pub key_precision: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self { radius: default_radius(), key_precision: default_key_precision() }
    }
}

fn default_radius() -> f64 {
    1.0 / 240.0
}

fn default_key_precision() -> usize {
    6
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_window_size_ms")]
    pub size_ms: i64,
    /// How long past its end a window still accepts late records
    #[serde(default = "default_grace_ms")]
    pub grace_ms: i64,
    #[serde(default)]
    pub emit: EmitMode,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { size_ms: default_window_size_ms(), grace_ms: default_grace_ms(), emit: EmitMode::default() }
    }
}

fn default_window_size_ms() -> i64 {
    TumblingWindows::DEFAULT_SIZE_MS
}

fn default_grace_ms() -> i64 {
    5 * 60 * 1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Number of aggregation workers records are shuffled across
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capacity of each inter-stage channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub missing_timestamp: MissingTimestampPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            channel_capacity: default_channel_capacity(),
            missing_timestamp: MissingTimestampPolicy::default(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_channel_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,
    /// Replay file, one JSON payload per line (jsonl only)
    #[serde(default = "default_source_file")]
    pub file: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self { kind: default_source_kind(), file: default_source_file() }
    }
}

fn default_source_kind() -> SourceKind {
    SourceKind::Mqtt
}

fn default_source_file() -> String {
    "events.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_kind")]
    pub kind: SinkKind,
    /// Output file for counts (jsonl only)
    #[serde(default = "default_sink_file")]
    pub file: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self { kind: default_sink_kind(), file: default_sink_file() }
    }
}

fn default_sink_kind() -> SinkKind {
    SinkKind::Mqtt
}

fn default_sink_file() -> String {
    "counts.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Run an embedded MQTT broker in-process
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { enabled: false, bind_address: default_broker_bind_address(), port: default_broker_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: default_prometheus_port() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    service_id: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_input_topic: String,
    mqtt_output_topic: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    grid_radius: f64,
    key_precision: usize,
    window_size_ms: i64,
    window_grace_ms: i64,
    emit_mode: EmitMode,
    workers: usize,
    channel_capacity: usize,
    missing_timestamp: MissingTimestampPolicy,
    source_kind: SourceKind,
    source_file: String,
    sink_kind: SinkKind,
    sink_file: String,
    broker_enabled: bool,
    broker_bind_address: String,
    broker_port: u16,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            service_id: toml_config.service.id,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_input_topic: toml_config.mqtt.input_topic,
            mqtt_output_topic: toml_config.mqtt.output_topic,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            grid_radius: toml_config.grid.radius,
            key_precision: toml_config.grid.key_precision,
            window_size_ms: toml_config.window.size_ms,
            window_grace_ms: toml_config.window.grace_ms,
            emit_mode: toml_config.window.emit,
            workers: toml_config.pipeline.workers,
            channel_capacity: toml_config.pipeline.channel_capacity,
            missing_timestamp: toml_config.pipeline.missing_timestamp,
            source_kind: toml_config.source.kind,
            source_file: toml_config.source.file,
            sink_kind: toml_config.sink.kind,
            sink_file: toml_config.sink.file,
            broker_enabled: toml_config.broker.enabled,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file,
        }
    }

    /// Config file path when none is given on the command line
    pub fn resolve_config_path() -> String {
        env::var("CONFIG_FILE").unwrap_or_else(|_| "config/dev.toml".to_string())
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str, origin: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)
            .with_context(|| format!("Failed to parse config file {}", origin))?;
        Ok(Self::from_toml(toml_config, origin.to_string()))
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Load configuration from a path, falling back to defaults when unreadable
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Check values that parse fine but cannot run
    pub fn validate(&self) -> anyhow::Result<()> {
        self.binner().context("grid config")?;
        self.windows().context("window config")?;
        if self.workers == 0 {
            anyhow::bail!("pipeline.workers must be at least 1");
        }
        if self.channel_capacity == 0 {
            anyhow::bail!("pipeline.channel_capacity must be at least 1");
        }
        Ok(())
    }

    /// Build the grid binner described by `[grid]`
    pub fn binner(&self) -> Result<HexGridBinner, GeoError> {
        HexGridBinner::new(self.grid_radius)
    }

    /// Build the window assigner described by `[window]`
    pub fn windows(&self) -> Result<TumblingWindows, GeoError> {
        TumblingWindows::new(self.window_size_ms, self.window_grace_ms)
    }

    // Getters for all config fields
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_input_topic(&self) -> &str {
        &self.mqtt_input_topic
    }

    pub fn mqtt_output_topic(&self) -> &str {
        &self.mqtt_output_topic
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn grid_radius(&self) -> f64 {
        self.grid_radius
    }

    pub fn key_precision(&self) -> usize {
        self.key_precision
    }

    pub fn window_size_ms(&self) -> i64 {
        self.window_size_ms
    }

    pub fn window_grace_ms(&self) -> i64 {
        self.window_grace_ms
    }

    pub fn emit_mode(&self) -> EmitMode {
        self.emit_mode
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    pub fn missing_timestamp(&self) -> MissingTimestampPolicy {
        self.missing_timestamp
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source_kind
    }

    pub fn source_file(&self) -> &str {
        &self.source_file
    }

    pub fn sink_kind(&self) -> SinkKind {
        self.sink_kind
    }

    pub fn sink_file(&self) -> &str {
        &self.sink_file
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker_enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to pick the emission mode
    #[cfg(test)]
    pub fn with_emit_mode(mut self, emit_mode: EmitMode) -> Self {
        self.emit_mode = emit_mode;
        self
    }

    /// Builder method for tests to set the worker count
    #[cfg(test)]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}
