//! JVM runtime metrics written by the agent's JVM probes.
//!
//! Each per-process inner map holds `u32` keys and 40-byte values:
//!
//! ```text
//! key    bits 0-7 metric type | 8-15 attr1 | 16-23 attr2 | 24-31 reserved
//! value  counter/gauge  u64 @0
//!        histogram      u32 buckets @0,4,8,12,16 | sum_ns u64 @24 | total u32 @32
//! ```
//!
//! Counters and histograms are reset to zero once read; gauges hold the
//! current state and are left alone.

use std::io;

use tracing::debug;

use super::MetricExtractor;
use crate::map::MapView;
use crate::proto::common::{InstrumentationScope, KeyValue};
use crate::proto::metrics::{
    metric::Data, number_data_point, AggregationTemporality, Gauge, Histogram,
    HistogramDataPoint, Metric, MetricsData, NumberDataPoint, ResourceMetrics, ScopeMetrics, Sum,
};
use crate::proto::string_attribute;
use crate::util::system_time_nanos;

pub const SCOPE_NAME: &str = "jvm-ebpf-metrics";
pub const SCOPE_VERSION: &str = "1.0.0";

pub const KEY_SIZE: usize = 4;
pub const VALUE_SIZE: usize = 40;

/// Upper bounds of the first four histogram buckets, in seconds
pub const GC_DURATION_BOUNDS: [f64; 4] = [0.001, 0.01, 0.1, 1.0];

// ── Key ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricKey(pub u32);

impl MetricKey {
    pub fn new(metric_type: u8, attr1: u8, attr2: u8) -> Self {
        Self(metric_type as u32 | (attr1 as u32) << 8 | (attr2 as u32) << 16)
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let bytes: [u8; KEY_SIZE] = raw.get(..KEY_SIZE)?.try_into().ok()?;
        Some(Self(u32::from_le_bytes(bytes)))
    }

    pub fn metric_type(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    pub fn attr1(self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    pub fn attr2(self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }
}

/// Metric type codes shared with the probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    ClassLoaded,
    ClassUnloaded,
    MemoryUsedAfterGc,
    GcDuration,
    ThreadCount,
}

impl MetricType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MetricType::ClassLoaded),
            2 => Some(MetricType::ClassUnloaded),
            13 => Some(MetricType::MemoryUsedAfterGc),
            20 => Some(MetricType::GcDuration),
            30 => Some(MetricType::ThreadCount),
            _ => None,
        }
    }
}

/// Memory (10-14), thread count (30) and CPU count/utilisation (41, 42)
/// codes hold current state rather than accumulated deltas.
pub fn is_gauge_code(code: u8) -> bool {
    matches!(code, 10..=14 | 30 | 41 | 42)
}

// ── Attribute codes ──────────────────────────────────────────────────────────

fn gc_action(code: u8) -> &'static str {
    match code {
        1 => "end of minor GC",
        2 => "end of major GC",
        _ => "unknown",
    }
}

fn gc_name(code: u8) -> &'static str {
    match code {
        1 => "G1 Young Generation",
        2 => "G1 Old Generation",
        3 => "G1 Concurrent GC",
        10 => "PS Scavenge",
        11 => "PS MarkSweep",
        20 => "Copy",
        21 => "MarkSweepCompact",
        40 => "ZGC Cycles",
        41 => "ZGC Pauses",
        42 => "ZGC Major Cycles",
        43 => "ZGC Major Pauses",
        44 => "ZGC Minor Cycles",
        45 => "ZGC Minor Pauses",
        50 => "Shenandoah Cycles",
        51 => "Shenandoah Pauses",
        _ => "unknown",
    }
}

fn memory_type(code: u8) -> &'static str {
    match code {
        1 => "heap",
        2 => "non_heap",
        _ => "unknown",
    }
}

fn memory_pool(code: u8) -> &'static str {
    match code {
        1 => "G1 Eden Space",
        2 => "G1 Survivor Space",
        3 => "G1 Old Gen",
        10 => "PS Eden Space",
        11 => "PS Survivor Space",
        12 => "PS Old Gen",
        20 => "Eden Space",
        21 => "Survivor Space",
        22 => "Tenured Gen",
        100 => "Metaspace",
        101 => "CodeCache",
        102 => "Compressed Class Space",
        110 => "ZGC Old Generation",
        111 => "ZGC Young Generation",
        120 => "Shenandoah",
        _ => "unknown",
    }
}

fn thread_daemon(code: u8) -> &'static str {
    match code {
        1 => "false",
        2 => "true",
        _ => "unknown",
    }
}

fn thread_state(code: u8) -> &'static str {
    match code {
        1 => "new",
        2 => "runnable",
        3 => "blocked",
        4 => "waiting",
        5 => "timed_waiting",
        6 => "terminated",
        _ => "unknown",
    }
}

/// Attributes for a point; code 0 means "not recorded" and is omitted.
fn point_attributes(pairs: [(&str, u8, fn(u8) -> &'static str); 2]) -> Vec<KeyValue> {
    pairs
        .into_iter()
        .filter(|(_, code, _)| *code != 0)
        .map(|(key, code, name)| string_attribute(key, name(code)))
        .collect()
}

// ── Value ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistogramValue {
    pub buckets: [u32; 5],
    pub sum_ns: u64,
    pub total: u32,
}

impl HistogramValue {
    /// Cumulative counts per bound, with the total as the +Inf bucket
    pub fn cumulative_counts(&self) -> Vec<u64> {
        let mut running = 0u64;
        let mut counts: Vec<u64> = self.buckets[..4]
            .iter()
            .map(|&b| {
                running += b as u64;
                running
            })
            .collect();
        counts.push(self.total as u64);
        counts
    }
}

fn read_u32(raw: &[u8], offset: usize) -> Option<u32> {
    let bytes = raw.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn read_u64(raw: &[u8], offset: usize) -> Option<u64> {
    let bytes = raw.get(offset..offset + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Counter or gauge reading. `None` if `raw` is too short.
pub fn scalar_value(raw: &[u8]) -> Option<u64> {
    read_u64(raw, 0)
}

/// `None` if `raw` is too short to hold a histogram.
pub fn histogram_value(raw: &[u8]) -> Option<HistogramValue> {
    let mut buckets = [0u32; 5];
    for (i, bucket) in buckets.iter_mut().enumerate() {
        *bucket = read_u32(raw, i * 4)?;
    }
    Some(HistogramValue {
        buckets,
        sum_ns: read_u64(raw, 24)?,
        total: read_u32(raw, 32)?,
    })
}

// ── Extractor ────────────────────────────────────────────────────────────────

/// Turns one JVM process map into an OTLP metrics batch
#[derive(Debug, Default, Clone, Copy)]
pub struct JvmExtractor;

impl JvmExtractor {
    fn metric(&self, key: MetricKey, raw: &[u8], start: u64, now: u64) -> Option<Metric> {
        let metric_type = MetricType::from_code(key.metric_type())?;

        match metric_type {
            MetricType::ClassLoaded | MetricType::ClassUnloaded => {
                let count = scalar_value(raw)?;
                if count == 0 {
                    return None;
                }
                let (name, description) = if metric_type == MetricType::ClassLoaded {
                    ("jvm.class.loaded", "Number of classes loaded since JVM start")
                } else {
                    ("jvm.class.unloaded", "Number of classes unloaded since JVM start")
                };
                Some(Metric {
                    name: name.into(),
                    description: description.into(),
                    unit: "{class}".into(),
                    data: Some(Data::Sum(Sum {
                        data_points: vec![int_point(count, Vec::new(), start, now)],
                        aggregation_temporality: AggregationTemporality::Cumulative as i32,
                        is_monotonic: true,
                    })),
                    metadata: Vec::new(),
                })
            }

            MetricType::MemoryUsedAfterGc => {
                let used = scalar_value(raw)?;
                if used == 0 {
                    return None;
                }
                let attributes = point_attributes([
                    ("jvm.memory.type", key.attr1(), memory_type),
                    ("jvm.memory.pool.name", key.attr2(), memory_pool),
                ]);
                Some(gauge_metric(
                    "jvm.memory.used_after_last_gc",
                    "Measure of memory used after the most recent garbage collection event",
                    "By",
                    int_point(used, attributes, 0, now),
                ))
            }

            MetricType::ThreadCount => {
                let threads = scalar_value(raw)?;
                if threads == 0 {
                    return None;
                }
                let attributes = point_attributes([
                    ("jvm.thread.daemon", key.attr1(), thread_daemon),
                    ("jvm.thread.state", key.attr2(), thread_state),
                ]);
                Some(gauge_metric(
                    "jvm.thread.count",
                    "Number of executing platform threads",
                    "{thread}",
                    int_point(threads, attributes, 0, now),
                ))
            }

            MetricType::GcDuration => {
                let hist = histogram_value(raw)?;
                if hist.total == 0 {
                    return None;
                }
                debug!(
                    "GC histogram: {} collections, {:.3} ms total",
                    hist.total,
                    hist.sum_ns as f64 / 1e6
                );
                let point = HistogramDataPoint {
                    attributes: point_attributes([
                        ("jvm.gc.action", key.attr1(), gc_action),
                        ("jvm.gc.name", key.attr2(), gc_name),
                    ]),
                    start_time_unix_nano: start,
                    time_unix_nano: now,
                    count: hist.total as u64,
                    sum: Some(hist.sum_ns as f64 / 1e9),
                    bucket_counts: hist.cumulative_counts(),
                    explicit_bounds: GC_DURATION_BOUNDS.to_vec(),
                    ..Default::default()
                };
                Some(Metric {
                    name: "jvm.gc.duration".into(),
                    description: "Duration of JVM garbage collection actions".into(),
                    unit: "s".into(),
                    data: Some(Data::Histogram(Histogram {
                        data_points: vec![point],
                        aggregation_temporality: AggregationTemporality::Cumulative as i32,
                    })),
                    metadata: Vec::new(),
                })
            }
        }
    }
}

fn int_point(value: u64, attributes: Vec<KeyValue>, start: u64, now: u64) -> NumberDataPoint {
    NumberDataPoint {
        attributes,
        start_time_unix_nano: start,
        time_unix_nano: now,
        value: Some(number_data_point::Value::AsInt(value as i64)),
        flags: 0,
    }
}

fn gauge_metric(name: &str, description: &str, unit: &str, point: NumberDataPoint) -> Metric {
    Metric {
        name: name.into(),
        description: description.into(),
        unit: unit.into(),
        data: Some(Data::Gauge(Gauge {
            data_points: vec![point],
        })),
        metadata: Vec::new(),
    }
}

impl MetricExtractor for JvmExtractor {
    fn name(&self) -> &'static str {
        "jvm"
    }

    fn extract(&self, inner: &dyn MapView, start_time_unix_nano: u64) -> io::Result<MetricsData> {
        let now = system_time_nanos();
        let zero = vec![0u8; inner.value_size()];
        let mut metrics = Vec::new();

        for (raw_key, raw_value) in inner.entries()? {
            let Some(key) = MetricKey::from_bytes(&raw_key) else {
                debug!("Skipping JVM metric with {}-byte key", raw_key.len());
                continue;
            };
            if raw_value.len() < VALUE_SIZE {
                debug!("Skipping JVM metric {:#x} with {}-byte value", key.0, raw_value.len());
                continue;
            }

            if let Some(metric) = self.metric(key, &raw_value, start_time_unix_nano, now) {
                metrics.push(metric);
            }

            if !is_gauge_code(key.metric_type()) {
                if let Err(e) = inner.update_existing(&raw_key, &zero) {
                    debug!("Failed to reset JVM metric {:#x}: {}", key.0, e);
                }
            }
        }

        if metrics.is_empty() {
            return Ok(MetricsData::default());
        }

        Ok(MetricsData {
            resource_metrics: vec![ResourceMetrics {
                resource: None,
                scope_metrics: vec![ScopeMetrics {
                    scope: Some(InstrumentationScope {
                        name: SCOPE_NAME.into(),
                        version: SCOPE_VERSION.into(),
                        ..Default::default()
                    }),
                    metrics,
                    schema_url: String::new(),
                }],
                schema_url: String::new(),
            }],
        })
    }
}
