//! Prometheus self-telemetry for the receiver

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use relay_exchange::HandleSignal;

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Every counter the receiver exports, registered on one registry
#[derive(Clone)]
pub struct ReceiverTelemetry {
    lost_samples: IntCounterVec,
    memory_pressure_wait_ms: IntCounterVec,
    bytes_read: IntCounterVec,
    read_errors: IntCounterVec,
    records_dropped: IntCounterVec,
    decoded: IntCounterVec,
    decode_failures: IntCounterVec,
    consume_failures: IntCounterVec,
    handle_swaps: IntCounterVec,
    pub metrics_ticks: IntCounter,
    pub metrics_attribute_misses: IntCounter,
}

impl ReceiverTelemetry {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            // ── Buffer reads ─────────────────────────────────────────────
            lost_samples: counter_vec(
                registry,
                "relay_ebpf_lost_samples_total",
                "Samples the kernel dropped before the receiver read them",
                &["signal"],
            )?,
            memory_pressure_wait_ms: counter_vec(
                registry,
                "relay_ebpf_memory_pressure_wait_ms_total",
                "Milliseconds spent paused on the memory limit",
                &["signal"],
            )?,
            bytes_read: counter_vec(
                registry,
                "relay_ebpf_bytes_read_total",
                "Bytes of well-framed records read from kernel buffers",
                &["signal"],
            )?,
            read_errors: counter_vec(
                registry,
                "relay_ebpf_read_errors_total",
                "Buffer reads that failed without the reader being closed",
                &["signal"],
            )?,

            // ── Decoding ─────────────────────────────────────────────────
            records_dropped: counter_vec(
                registry,
                "relay_ebpf_records_dropped_total",
                "Records dropped because their framing was invalid",
                &["signal", "reason"],
            )?,
            decoded: counter_vec(
                registry,
                "relay_ebpf_decoded_total",
                "Batches decoded, by wire format",
                &["signal", "format"],
            )?,
            decode_failures: counter_vec(
                registry,
                "relay_ebpf_decode_failures_total",
                "Payloads that matched neither wire format",
                &["signal"],
            )?,

            // ── Pipeline ─────────────────────────────────────────────────
            consume_failures: counter_vec(
                registry,
                "relay_ebpf_consume_failures_total",
                "Batches the downstream consumer rejected",
                &["signal"],
            )?,
            handle_swaps: counter_vec(
                registry,
                "relay_ebpf_handle_swaps_total",
                "Handles installed by the map manager",
                &["signal"],
            )?,

            // ── Metrics collector ────────────────────────────────────────
            metrics_ticks: counter(
                registry,
                "relay_ebpf_metrics_ticks_total",
                "Metrics collection passes",
            )?,
            metrics_attribute_misses: counter(
                registry,
                "relay_ebpf_metrics_attribute_misses_total",
                "Inner metric maps with no cached resource attributes",
            )?,
        })
    }

    /// Counters bound to one signal's label
    pub fn signal(&self, signal: HandleSignal) -> SignalTelemetry {
        let name = signal.as_str();
        SignalTelemetry {
            signal,
            lost_samples: self.lost_samples.with_label_values(&[name]),
            memory_pressure_wait_ms: self.memory_pressure_wait_ms.with_label_values(&[name]),
            bytes_read: self.bytes_read.with_label_values(&[name]),
            read_errors: self.read_errors.with_label_values(&[name]),
            decode_failures: self.decode_failures.with_label_values(&[name]),
            consume_failures: self.consume_failures.with_label_values(&[name]),
            handle_swaps: self.handle_swaps.with_label_values(&[name]),
            records_dropped: self.records_dropped.clone(),
            decoded: self.decoded.clone(),
        }
    }
}

/// Label-bound counters for a single signal
#[derive(Clone)]
pub struct SignalTelemetry {
    signal: HandleSignal,
    pub lost_samples: IntCounter,
    pub memory_pressure_wait_ms: IntCounter,
    pub bytes_read: IntCounter,
    pub read_errors: IntCounter,
    pub decode_failures: IntCounter,
    pub consume_failures: IntCounter,
    pub handle_swaps: IntCounter,
    records_dropped: IntCounterVec,
    decoded: IntCounterVec,
}

impl SignalTelemetry {
    /// Counters on a private registry, for callers that do not export them
    pub fn unregistered(signal: HandleSignal) -> prometheus::Result<Self> {
        Ok(ReceiverTelemetry::new(&Registry::new())?.signal(signal))
    }

    pub fn signal(&self) -> HandleSignal {
        self.signal
    }

    pub fn records_dropped(&self, reason: &str) -> IntCounter {
        self.records_dropped
            .with_label_values(&[self.signal.as_str(), reason])
    }

    pub fn decoded(&self, format: &str) -> IntCounter {
        self.decoded.with_label_values(&[self.signal.as_str(), format])
    }
}

/// Render every metric on `registry` in the Prometheus text format.
pub fn encode_metrics(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
