// Copyright (C) 2026-present The rcaflow Authors.
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

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use rcaflow_net_service::codec::DEFAULT_MAX_FRAME_SIZE;
use serde_with::serde_as;
use std::{net::SocketAddr, path::Path, time::Duration};

/// Prefix of the environment variables overriding the configuration file,
/// nested keys are separated by `__`, e.g. `RCAFLOW_INGESTION__WORKERS=8`
pub const ENV_PREFIX: &str = "RCAFLOW_";

pub(crate) const fn default_telemetry_timeout() -> Duration {
    Duration::from_secs(5)
}

pub(crate) const fn default_telemetry_interval() -> Duration {
    Duration::from_secs(60)
}

pub(crate) const fn default_workers() -> usize {
    4
}

pub(crate) const fn default_queue_capacity() -> usize {
    1_000
}

pub(crate) const fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

pub(crate) const fn default_cmd_size_buffer() -> usize {
    100
}

pub(crate) const fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

pub(crate) const fn default_window_duration() -> Duration {
    Duration::from_secs(5)
}

pub(crate) const fn default_retention() -> Duration {
    Duration::from_secs(300)
}

pub(crate) const fn default_purge_interval() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum ConfigError {
    #[strum(to_string = "unable to load configuration: {0}")]
    Load(String),
    #[strum(to_string = "ingestion.workers must be at least one")]
    NoWorkers,
    #[strum(to_string = "ingestion.queue_capacity must be at least one")]
    NoQueueCapacity,
    #[strum(to_string = "ingestion.max_frame_size must be at least one byte")]
    NoMaxFrameSize,
    #[strum(to_string = "ingestion.cmd_buffer_size must be at least one")]
    NoCommandBuffer,
    #[strum(to_string = "store.{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default, skip_serializing_if = "::std::option::Option::is_none")]
    pub telemetry: Option<TelemetryConfig>,
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl AgentConfig {
    /// Configuration sources: the YAML file, overridden by the environment
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_figment(&Self::figment(path))
    }

    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ingestion.validate()?;
        self.store.validate()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RuntimeConfig {
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub threads: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
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
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
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

impl TelemetryConfig {
    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Binding {
    pub address: SocketAddr,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IngestionConfig {
    pub listener: Binding,

    /// Number of worker threads executing ingestion tasks
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Flow units waiting for a worker before new ones are rejected
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    #[serde(default = "default_cmd_size_buffer")]
    pub cmd_buffer_size: usize,

    /// How long peers are given to close their streams on shutdown
    #[serde(default = "default_shutdown_timeout")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub shutdown_timeout: Duration,
}

impl IngestionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::NoQueueCapacity);
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::NoMaxFrameSize);
        }
        if self.cmd_buffer_size == 0 {
            return Err(ConfigError::NoCommandBuffer);
        }
        Ok(())
    }

    /// True when switching to `other` requires a new worker pool
    pub fn pool_changed(&self, other: &IngestionConfig) -> bool {
        self.workers != other.workers || self.queue_capacity != other.queue_capacity
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_window_duration")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub window_duration: Duration,

    /// Windows ending before now minus the retention are dropped
    #[serde(default = "default_retention")]
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub retention: Duration,

    #[serde(default = "default_purge_interval")]
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub purge_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            window_duration: default_window_duration(),
            retention: default_retention(),
            purge_interval: default_purge_interval(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_duration.is_zero() {
            return Err(ConfigError::ZeroDuration("window_duration"));
        }
        if self.retention.is_zero() {
            return Err(ConfigError::ZeroDuration("retention"));
        }
        if self.purge_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("purge_interval"));
        }
        Ok(())
    }
}
