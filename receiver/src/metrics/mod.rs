//! Timer-driven metrics collection.
//!
//! The agent publishes two maps for metrics: an attributes hash from
//! process UUID to a packed resource attribute string, and a hash-of-maps
//! index from the same UUID to a per-process metrics map. Every tick:
//!
//! 1. the attributes map is read in full into a cache for this tick only
//! 2. every index entry's inner map is opened, handed to the extractor and
//!    the resulting batch, tagged with the cached attributes, forwarded

pub mod attributes;
pub mod jvm;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prometheus::IntCounter;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::manager::HandleConsumer;
use crate::map::{MapHandle, MapView, MetricsHandles};
use crate::proto::metrics::MetricsData;
use crate::sink::MetricsConsumer;
use crate::telemetry::ReceiverTelemetry;
use crate::util::system_time_nanos;

pub use attributes::{parse_packed_attributes, trim_padding, ParsedAttributes};
pub use jvm::JvmExtractor;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Converts one per-process inner map into a metrics batch
pub trait MetricExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Read every metric in `inner`. Returns an empty batch when nothing
    /// was recorded since the last call.
    fn extract(&self, inner: &dyn MapView, start_time_unix_nano: u64) -> io::Result<MetricsData>;
}

/// The maps one collection pass reads
pub trait MetricsSource: Send + Sync {
    fn attributes(&self) -> &dyn MapView;

    fn index(&self) -> &dyn MapView;

    /// Open the inner map the index refers to by kernel id.
    fn open_inner(&self, id: u32) -> io::Result<Box<dyn MapView>>;
}

impl MetricsSource for MetricsHandles {
    fn attributes(&self) -> &dyn MapView {
        &self.attributes
    }

    fn index(&self) -> &dyn MapView {
        &self.index
    }

    fn open_inner(&self, id: u32) -> io::Result<Box<dyn MapView>> {
        Ok(Box::new(MapHandle::from_id(id)?))
    }
}

/// Outcome of one collection pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectStats {
    pub inner_maps: usize,
    pub forwarded: usize,
}

pub struct MetricsCollector {
    extractor: Arc<dyn MetricExtractor>,
    consumer: Arc<dyn MetricsConsumer>,
    interval: Duration,
    start_time_unix_nano: u64,
    ticks: IntCounter,
    attribute_misses: IntCounter,
}

impl MetricsCollector {
    pub fn new(
        extractor: Arc<dyn MetricExtractor>,
        consumer: Arc<dyn MetricsConsumer>,
        telemetry: &ReceiverTelemetry,
    ) -> Self {
        Self {
            extractor,
            consumer,
            interval: DEFAULT_INTERVAL,
            start_time_unix_nano: system_time_nanos(),
            ticks: telemetry.metrics_ticks.clone(),
            attribute_misses: telemetry.metrics_attribute_misses.clone(),
        }
    }

    /// Collection period. A zero interval falls back to the default.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval
        };
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run both phases once against `source`.
    pub async fn collect_once(&self, source: &dyn MetricsSource) -> io::Result<CollectStats> {
        self.ticks.inc();
        let mut stats = CollectStats::default();

        // ── Phase 1: resource attributes ─────────────────────────────────
        let mut cache: HashMap<Vec<u8>, String> = HashMap::new();
        for (uuid, packed) in source.attributes().entries()? {
            let (uuid, packed) = (trim_padding(&uuid), trim_padding(&packed));
            if uuid.is_empty() || packed.is_empty() {
                continue;
            }
            cache.insert(uuid.to_vec(), String::from_utf8_lossy(packed).into_owned());
        }

        // ── Phase 2: per-process maps ────────────────────────────────────
        for (uuid, inner_id) in source.index().entries()? {
            let Some(inner_id) = inner_map_id(&inner_id) else {
                warn!("Index entry has a {}-byte inner map id", inner_id.len());
                continue;
            };
            stats.inner_maps += 1;

            let uuid = trim_padding(&uuid);
            let label = String::from_utf8_lossy(uuid);
            let inner = match source.open_inner(inner_id) {
                Ok(inner) => inner,
                Err(e) => {
                    warn!("Failed to open metrics map {} for {}: {}", inner_id, label, e);
                    continue;
                }
            };

            let packed = cache.get(uuid);
            if packed.is_none() {
                self.attribute_misses.inc();
                warn!("No resource attributes cached for process {}", label);
            }

            let mut batch = match self.extractor.extract(inner.as_ref(), self.start_time_unix_nano) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(
                        "{} extractor failed on map {} for {}: {}",
                        self.extractor.name(),
                        inner_id,
                        label,
                        e
                    );
                    continue;
                }
            };
            if batch.is_empty() {
                continue;
            }

            if let Some(packed) = packed {
                attach_resource_attributes(&mut batch, &parse_packed_attributes(packed));
            }

            match self.consumer.consume_metrics(batch).await {
                Ok(()) => stats.forwarded += 1,
                Err(e) => warn!("Downstream metrics consumer failed for {}: {}", label, e),
            }
        }

        debug!(
            "Metrics pass done: {} inner maps, {} batches forwarded",
            stats.inner_maps, stats.forwarded
        );
        Ok(stats)
    }
}

fn inner_map_id(raw: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = raw.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn attach_resource_attributes(batch: &mut MetricsData, parsed: &ParsedAttributes) {
    if parsed.is_empty() {
        return;
    }
    for rm in &mut batch.resource_metrics {
        rm.resource
            .get_or_insert_with(Default::default)
            .attributes
            .extend(parsed.to_key_values());
    }
}

#[async_trait]
impl<S> HandleConsumer<S> for MetricsCollector
where
    S: MetricsSource + 'static,
{
    async fn consume(&self, source: &S, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Starting {} metrics collection every {:?}",
            self.extractor.name(),
            self.interval
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.collect_once(source).await {
                        error!("Metrics collection failed: {}", e);
                    }
                }
            }
        }
        info!("Metrics collection stopped");
    }
}
