//! Downstream consumers of decoded batches

use async_trait::async_trait;
use tracing::info;

use crate::error::ConsumeError;
use crate::proto::{logs::LogsData, metrics::MetricsData, trace::TracesData};

#[async_trait]
pub trait TracesConsumer: Send + Sync {
    async fn consume_traces(&self, batch: TracesData) -> Result<(), ConsumeError>;
}

#[async_trait]
pub trait LogsConsumer: Send + Sync {
    async fn consume_logs(&self, batch: LogsData) -> Result<(), ConsumeError>;
}

#[async_trait]
pub trait MetricsConsumer: Send + Sync {
    async fn consume_metrics(&self, batch: MetricsData) -> Result<(), ConsumeError>;
}

/// Logs a one-line summary of every batch and accepts it
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

#[async_trait]
impl TracesConsumer for LoggingSink {
    async fn consume_traces(&self, batch: TracesData) -> Result<(), ConsumeError> {
        info!(
            "Received {} spans across {} resources",
            batch.span_count(),
            batch.resource_spans.len()
        );
        Ok(())
    }
}

#[async_trait]
impl LogsConsumer for LoggingSink {
    async fn consume_logs(&self, batch: LogsData) -> Result<(), ConsumeError> {
        info!(
            "Received {} log records across {} resources",
            batch.log_record_count(),
            batch.resource_logs.len()
        );
        Ok(())
    }
}

#[async_trait]
impl MetricsConsumer for LoggingSink {
    async fn consume_metrics(&self, batch: MetricsData) -> Result<(), ConsumeError> {
        info!(
            "Received {} metric data points across {} resources",
            batch.data_point_count(),
            batch.resource_metrics.len()
        );
        Ok(())
    }
}
