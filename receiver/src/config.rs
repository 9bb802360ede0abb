//! Receiver configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use relay_exchange::{HandleSignal, DEFAULT_SOCKET_PATH};
use serde::{Deserialize, Serialize};

use crate::metrics::DEFAULT_INTERVAL;
use crate::reader::DEFAULT_PERF_BUFFER_PAGES;

/// Prefix of the environment variables read by [`ReceiverConfig::load`]
pub const ENV_PREFIX: &str = "RELAY";

/// Signal selector as written in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Traces,
    Logs,
    Metrics,
}

impl From<Signal> for HandleSignal {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Traces => HandleSignal::Traces,
            Signal::Logs => HandleSignal::Logs,
            Signal::Metrics => HandleSignal::Metrics,
        }
    }
}

impl std::str::FromStr for Signal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "traces" => Ok(Signal::Traces),
            "logs" => Ok(Signal::Logs),
            "metrics" => Ok(Signal::Metrics),
            other => bail!("Invalid signal: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Collection period; zero falls back to the default
    #[serde(with = "duration_str")]
    pub interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Exchange socket published by the agent
    pub socket_path: PathBuf,

    /// Signals to receive
    pub signals: Vec<Signal>,

    pub metrics: MetricsConfig,

    /// Pages in each per-CPU perf buffer
    pub perf_buffer_pages: usize,

    /// Resident memory above which buffer reads pause
    pub memory_limit_bytes: Option<u64>,

    /// Delay between exchange connection attempts
    #[serde(with = "duration_str")]
    pub reconnect_interval: Duration,

    /// How often the exchange socket is checked for replacement
    #[serde(with = "duration_str")]
    pub socket_poll_interval: Duration,

    /// Upper bound on a graceful shutdown
    #[serde(with = "duration_str")]
    pub shutdown_timeout: Duration,

    /// Admin HTTP listen address (health checks + metrics)
    pub admin_addr: Option<String>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            signals: vec![Signal::Traces, Signal::Logs, Signal::Metrics],
            metrics: MetricsConfig::default(),
            perf_buffer_pages: DEFAULT_PERF_BUFFER_PAGES,
            memory_limit_bytes: None,
            reconnect_interval: Duration::from_secs(2),
            socket_poll_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            admin_addr: None,
        }
    }
}

impl ReceiverConfig {
    /// Layer defaults, the optional file at `path` and `RELAY_*`
    /// environment variables, in that order.
    ///
    /// Nested keys use a double underscore: `RELAY_METRICS__INTERVAL=10s`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("signals"),
        );

        let config: ReceiverConfig = builder
            .build()
            .context("Failed to read receiver configuration")?
            .try_deserialize()
            .context("Invalid receiver configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.socket_path.as_os_str().is_empty() {
            bail!("socket_path must not be empty");
        }
        if self.signals.is_empty() {
            bail!("At least one signal must be enabled");
        }
        if self.perf_buffer_pages == 0 || !self.perf_buffer_pages.is_power_of_two() {
            bail!(
                "perf_buffer_pages must be a non-zero power of two, got {}",
                self.perf_buffer_pages
            );
        }
        Ok(())
    }

    /// Enabled signals, deduplicated, in configuration order
    pub fn enabled_signals(&self) -> Vec<Signal> {
        let mut seen = Vec::new();
        for signal in &self.signals {
            if !seen.contains(signal) {
                seen.push(*signal);
            }
        }
        seen
    }
}

/// Durations as human-readable strings (`"30s"`, `"250ms"`)
mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    use crate::util::parse_duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = duration.as_millis();
        if millis % 1000 == 0 {
            serializer.serialize_str(&format!("{}s", millis / 1000))
        } else {
            serializer.serialize_str(&format!("{}ms", millis))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(|e| de::Error::custom(format!("{:#}", e)))
    }
}
