//! eBPF Telemetry Receiver
//!
//! Connects to the agent's descriptor exchange, drains the shared trace and
//! log buffers, scrapes JVM metric maps and hands everything to the
//! downstream sink.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_exchange::{ClientOptions, HandleSignal};
use relay_receiver::map::{MapHandle, MetricsHandles};
use relay_receiver::metrics::{JvmExtractor, MetricsCollector};
use relay_receiver::pressure::{MemoryPressure, NoMemoryLimit, RssLimit, RSS_SAMPLE_INTERVAL};
use relay_receiver::proto::{logs::LogsData, trace::TracesData};
use relay_receiver::reader::KernelReaderFactory;
use relay_receiver::sink::LoggingSink;
use relay_receiver::{
    admin, util, EbpfReceiver, ReadLoop, ReadLoopConsumer, ReceiverConfig, ReceiverOptions,
    ReceiverTelemetry, Signal,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "relay-receiver")]
#[command(about = "Receives eBPF telemetry buffers handed over by the agent", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Exchange socket published by the agent
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// Signals to receive (e.g., "traces,logs,metrics")
    #[arg(long, value_delimiter = ',')]
    signals: Option<Vec<Signal>>,

    /// Metrics collection interval (e.g., "30s", "1m")
    #[arg(long)]
    metrics_interval: Option<String>,

    /// Resident memory in bytes above which buffer reads pause
    #[arg(long)]
    memory_limit_bytes: Option<u64>,

    /// Admin HTTP listen address for /healthz and /metrics
    #[arg(long)]
    admin_addr: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Args {
    /// Command-line flags win over file and environment settings.
    fn apply(&self, config: &mut ReceiverConfig) -> Result<()> {
        if let Some(path) = &self.socket_path {
            config.socket_path = path.clone();
        }
        if let Some(signals) = &self.signals {
            config.signals = signals.clone();
        }
        if let Some(interval) = &self.metrics_interval {
            config.metrics.interval =
                util::parse_duration(interval).context("Failed to parse metrics interval")?;
        }
        if let Some(limit) = self.memory_limit_bytes {
            config.memory_limit_bytes = Some(limit);
        }
        if let Some(addr) = &self.admin_addr {
            config.admin_addr = Some(addr.clone());
        }
        config.validate()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(args.verbose, args.log_json);

    let mut config =
        ReceiverConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config).context("Invalid configuration")?;

    info!("Starting eBPF telemetry receiver");
    info!("Configuration: {:?}", config);

    if !running_as_root() {
        warn!("Not running as root. Reading eBPF maps usually requires CAP_BPF.");
    }

    run(config).await
}

fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

async fn run(config: ReceiverConfig) -> Result<()> {
    let registry = prometheus::default_registry().clone();
    let telemetry =
        ReceiverTelemetry::new(&registry).context("Failed to register receiver metrics")?;

    let root = CancellationToken::new();

    let pressure: Arc<dyn MemoryPressure> = match config.memory_limit_bytes {
        Some(limit) => {
            let limit = Arc::new(RssLimit::new(limit));
            let sampler = limit.clone();
            let cancel = root.clone();
            tokio::spawn(async move { sampler.run(RSS_SAMPLE_INTERVAL, cancel).await });
            limit
        }
        None => Arc::new(NoMemoryLimit),
    };
    let sink = Arc::new(LoggingSink);
    let factory = KernelReaderFactory::new(config.perf_buffer_pages);
    let options = ReceiverOptions::new(&config.socket_path).with_client_options(ClientOptions {
        reconnect_interval: config.reconnect_interval,
        poll_interval: config.socket_poll_interval,
    });

    let mut receivers = Vec::new();

    for signal in config.enabled_signals() {
        let handle_signal = HandleSignal::from(signal);
        let signal_telemetry = telemetry.signal(handle_signal);
        let swaps = signal_telemetry.handle_swaps.clone();

        let receiver = match signal {
            Signal::Traces => {
                let read_loop = ReadLoop::<TracesData, _>::new(sink.clone(), signal_telemetry)
                    .with_memory_pressure(pressure.clone());
                EbpfReceiver::start::<MapHandle, _>(
                    handle_signal,
                    options.clone(),
                    Arc::new(ReadLoopConsumer::new(factory, read_loop)),
                    swaps,
                    &root,
                )
            }
            Signal::Logs => {
                let read_loop = ReadLoop::<LogsData, _>::new(sink.clone(), signal_telemetry)
                    .with_memory_pressure(pressure.clone());
                EbpfReceiver::start::<MapHandle, _>(
                    handle_signal,
                    options.clone(),
                    Arc::new(ReadLoopConsumer::new(factory, read_loop)),
                    swaps,
                    &root,
                )
            }
            Signal::Metrics => {
                let collector = MetricsCollector::new(Arc::new(JvmExtractor), sink.clone(), &telemetry)
                    .with_interval(config.metrics.interval);
                EbpfReceiver::start::<MetricsHandles, _>(
                    handle_signal,
                    options.clone(),
                    Arc::new(collector),
                    swaps,
                    &root,
                )
            }
        };
        receivers.push(receiver);
    }

    let admin = match &config.admin_addr {
        Some(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("Invalid admin address {}", addr))?;
            let registry = registry.clone();
            let cancel = root.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = admin::serve_admin(addr, registry, cancel).await {
                    error!("Admin HTTP server failed: {}", e);
                }
            }))
        }
        None => None,
    };

    wait_for_shutdown().await?;
    info!("Shutting down");

    let deadline = Instant::now() + config.shutdown_timeout;
    for receiver in receivers {
        let signal = receiver.signal();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Err(e) = receiver.shutdown(remaining).await {
            error!("{} receiver did not stop cleanly: {}", signal, e);
        }
    }

    root.cancel();
    if let Some(admin) = admin {
        let _ = admin.await;
    }

    info!("Receiver stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_root_check_uses_effective_uid() {
        let status = std::fs::read_to_string("/proc/self/status").unwrap();
        let euid: u32 = status
            .lines()
            .find_map(|line| line.strip_prefix("Uid:"))
            .and_then(|ids| ids.split_whitespace().nth(1))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(running_as_root(), euid == 0);
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "relay-receiver",
            "--socket-path",
            "/run/agent.sock",
            "--signals",
            "traces,logs",
            "--metrics-interval",
            "10s",
            "--memory-limit-bytes",
            "1048576",
        ]);
        let mut config = ReceiverConfig::default();
        args.apply(&mut config).unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/run/agent.sock"));
        assert_eq!(config.enabled_signals(), vec![Signal::Traces, Signal::Logs]);
        assert_eq!(config.metrics.interval, Duration::from_secs(10));
        assert_eq!(config.memory_limit_bytes, Some(1048576));
    }

    #[test]
    fn test_bad_interval_flag_is_rejected() {
        let args = Args::parse_from(["relay-receiver", "--metrics-interval", "soon"]);
        assert!(args.apply(&mut ReceiverConfig::default()).is_err());
    }
}
