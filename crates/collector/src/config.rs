// Copyright (C) 2025-present The StreamAvg Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Collector configuration.
//!
//! Loaded from a YAML file merged with `STREAMAVG_` prefixed environment
//! variables. All durations are typed and the whole configuration is checked
//! once at startup by [`CollectorConfig::validate`].

use serde_with::serde_as;
use std::{net::SocketAddr, path::PathBuf, time::Duration};

const MAX_PRECISION: u32 = 10;

pub(crate) const fn default_window_size() -> Duration {
    Duration::from_secs(60)
}

pub(crate) const fn default_lateness() -> Duration {
    Duration::from_secs(30)
}

pub(crate) const fn default_precision() -> u32 {
    2
}

pub(crate) const fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

pub(crate) const fn default_read_concurrency() -> usize {
    8
}

pub(crate) const fn default_cmd_size_buffer() -> usize {
    10
}

pub(crate) const fn default_snapshot_retention() -> usize {
    100
}

pub(crate) const fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

pub(crate) const fn default_telemetry_timeout() -> Duration {
    Duration::from_secs(5)
}

pub(crate) const fn default_telemetry_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_true() -> bool {
    true
}

fn default_input_directory() -> PathBuf {
    PathBuf::from("input_stream")
}

fn default_snapshot_directory() -> PathBuf {
    PathBuf::from("output")
}

fn default_checkpoint_directory() -> PathBuf {
    PathBuf::from("checkpoint")
}

fn default_http_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    InvalidWindowSize(String),
    InvalidTickInterval,
    InvalidReadConcurrency,
    InvalidSnapshotRetention,
    PrecisionTooLarge(u32),
    SameSnapshotAndCheckpointDirectory,
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidWindowSize(reason) => write!(f, "invalid window_size: {reason}"),
            Self::InvalidTickInterval => write!(f, "tick_interval must be greater than 0"),
            Self::InvalidReadConcurrency => {
                write!(f, "read_concurrency must be greater than 0")
            }
            Self::InvalidSnapshotRetention => {
                write!(f, "snapshot_retention must be greater than 0")
            }
            Self::PrecisionTooLarge(precision) => {
                write!(f, "precision {precision} exceeds the maximum of {MAX_PRECISION}")
            }
            Self::SameSnapshotAndCheckpointDirectory => {
                write!(
                    f,
                    "snapshot_directory and checkpoint_directory must be different"
                )
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CollectorConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub telemetry: Option<TelemetryConfig>,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.aggregation.validate()?;
        self.scheduler.validate()?;
        if self.output.snapshot_retention == 0 {
            return Err(ConfigurationError::InvalidSnapshotRetention);
        }
        if self.output.snapshot_directory == self.output.checkpoint_directory {
            return Err(ConfigurationError::SameSnapshotAndCheckpointDirectory);
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct RuntimeConfig {
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub threads: Option<usize>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TelemetryConfig {
    pub url: String,

    /// Metrics exporter GRPC timeout
    #[serde(default = "default_telemetry_timeout")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub exporter_timeout: Duration,

    /// Configures the intervening time between exports for a
    /// [opentelemetry_sdk::metrics::PeriodicReader]
    #[serde(default = "default_telemetry_interval")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub reader_interval: Duration,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AggregationConfig {
    /// Size of the tumbling windows
    #[serde(default = "default_window_size")]
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub window_size: Duration,

    /// How far behind the max event time an event may be and still be
    /// admitted, zero admits everything
    #[serde(default = "default_lateness")]
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub lateness: Duration,

    /// Decimal places of the emitted averages
    #[serde(default = "default_precision")]
    pub precision: u32,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            lateness: default_lateness(),
            precision: default_precision(),
        }
    }
}

impl AggregationConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        // Builds the window assigner and watermark tracker so the exact same
        // checks apply here and at runtime
        self.engine()
            .map_err(|e| ConfigurationError::InvalidWindowSize(e.to_string()))?;
        if self.precision > MAX_PRECISION {
            return Err(ConfigurationError::PrecisionTooLarge(self.precision));
        }
        Ok(())
    }

    pub fn engine(
        &self,
    ) -> Result<streamavg_analytics::aggregation::AggregationEngine, streamavg_analytics::DurationError>
    {
        streamavg_analytics::aggregation::AggregationEngine::new(
            self.window_size,
            self.lateness,
            self.precision,
        )
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    /// Interval between two emission ticks
    #[serde(default = "default_tick_interval")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,

    /// Max number of input records read concurrently in a tick
    #[serde(default = "default_read_concurrency")]
    pub read_concurrency: usize,

    #[serde(default = "default_cmd_size_buffer")]
    pub cmd_buffer_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            read_concurrency: default_read_concurrency(),
            cmd_buffer_size: default_cmd_size_buffer(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigurationError::InvalidTickInterval);
        }
        if self.read_concurrency == 0 {
            return Err(ConfigurationError::InvalidReadConcurrency);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InputConfig {
    /// Directory monitored for event records
    #[serde(default = "default_input_directory")]
    pub directory: PathBuf,

    /// Delete input records once they are covered by a durable checkpoint
    #[serde(default)]
    pub purge_committed: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            directory: default_input_directory(),
            purge_committed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_snapshot_directory")]
    pub snapshot_directory: PathBuf,

    #[serde(default = "default_checkpoint_directory")]
    pub checkpoint_directory: PathBuf,

    /// Number of committed snapshot artifacts kept on disk
    #[serde(default = "default_snapshot_retention")]
    pub snapshot_retention: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            snapshot_directory: default_snapshot_directory(),
            checkpoint_directory: default_checkpoint_directory(),
            snapshot_retention: default_snapshot_retention(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_address")]
    pub address: SocketAddr,

    /// Applies to the request/response cycle only
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,

    /// Serve the ingestion endpoint next to the query endpoint
    #[serde(default = "default_true")]
    pub ingest: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: default_http_address(),
            request_timeout: default_request_timeout(),
            ingest: true,
        }
    }
}
