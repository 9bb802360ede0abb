//! Trace and log read loops
//!
//! A read loop drains the active buffer reader of one signal:
//!
//! ```text
//! memory gate -> read_into -> lost? -> unframe -> decode -> forward
//! ```
//!
//! Nothing past the read itself is fatal. Bad records are counted and
//! skipped, failed reads are retried after a short pause, and only a closed
//! reader ends the loop.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::decode::{decode_batch, unframe, WireBatch};
use crate::error::ConsumeError;
use crate::manager::HandleConsumer;
use crate::pressure::{MemoryPressure, NoMemoryLimit};
use crate::proto::{logs::LogsData, trace::TracesData};
use crate::reader::{BufferReader, BufferRecord, ReaderFactory};
use crate::sink::{LogsConsumer, TracesConsumer};
use crate::telemetry::SignalTelemetry;

/// How long the loop sleeps between memory probe checks
pub const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Pause after a failed read before trying the reader again
pub const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Where a read loop sends decoded batches
#[async_trait]
pub trait BatchSink<B>: Send + Sync + 'static {
    async fn forward(&self, batch: B) -> Result<(), ConsumeError>;
}

#[async_trait]
impl<C> BatchSink<TracesData> for Arc<C>
where
    C: TracesConsumer + ?Sized + 'static,
{
    async fn forward(&self, batch: TracesData) -> Result<(), ConsumeError> {
        self.consume_traces(batch).await
    }
}

#[async_trait]
impl<C> BatchSink<LogsData> for Arc<C>
where
    C: LogsConsumer + ?Sized + 'static,
{
    async fn forward(&self, batch: LogsData) -> Result<(), ConsumeError> {
        self.consume_logs(batch).await
    }
}

pub struct ReadLoop<B, S> {
    sink: S,
    pressure: Arc<dyn MemoryPressure>,
    telemetry: SignalTelemetry,
    _batch: PhantomData<fn() -> B>,
}

impl<B, S> ReadLoop<B, S>
where
    B: WireBatch + 'static,
    S: BatchSink<B>,
{
    pub fn new(sink: S, telemetry: SignalTelemetry) -> Self {
        Self {
            sink,
            pressure: Arc::new(NoMemoryLimit),
            telemetry,
            _batch: PhantomData,
        }
    }

    pub fn with_memory_pressure(mut self, pressure: Arc<dyn MemoryPressure>) -> Self {
        self.pressure = pressure;
        self
    }

    /// Drain `reader` until it is closed or `cancel` fires, then close it.
    pub async fn run(&self, mut reader: Box<dyn BufferReader>, cancel: CancellationToken) {
        let signal = self.telemetry.signal();

        // unblocks a pending read_into on cancellation
        let closer = reader.closer();
        let watch = cancel.clone();
        let watcher = tokio::spawn(async move {
            watch.cancelled().await;
            closer.close();
        });

        info!("{} read loop started", signal);
        let mut record = BufferRecord::default();
        loop {
            if !self.wait_for_memory(&cancel).await {
                break;
            }

            match reader.read_into(&mut record).await {
                Ok(()) => self.handle_record(&record).await,
                Err(e) if e.is_closed() => break,
                Err(e) => {
                    self.telemetry.read_errors.inc();
                    warn!("{} buffer read failed: {}", signal, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        watcher.abort();
        if let Err(e) = reader.close() {
            error!("Failed to close {} reader: {}", signal, e);
        }
        info!("{} read loop stopped", signal);
    }

    /// Block while the memory probe reports pressure. Returns `false` when
    /// cancelled.
    async fn wait_for_memory(&self, cancel: &CancellationToken) -> bool {
        while self.pressure.is_limit_reached() {
            let started = Instant::now();
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(MEMORY_POLL_INTERVAL) => {}
            }
            self.telemetry
                .memory_pressure_wait_ms
                .inc_by(started.elapsed().as_millis() as u64);
        }
        true
    }

    async fn handle_record(&self, record: &BufferRecord) {
        let signal = self.telemetry.signal();

        if record.lost_samples != 0 {
            self.telemetry.lost_samples.inc_by(record.lost_samples);
            debug!("{} buffer lost {} samples", signal, record.lost_samples);
            return;
        }
        let payload = match unframe(&record.raw_sample) {
            Ok(payload) => payload,
            Err(e) => {
                self.telemetry.records_dropped(e.reason()).inc();
                debug!("Dropping {} record: {}", signal, e);
                return;
            }
        };
        self.telemetry
            .bytes_read
            .inc_by(record.raw_sample.len() as u64);

        let batch = match decode_batch::<B>(payload) {
            Ok((batch, format)) => {
                self.telemetry.decoded(format.as_str()).inc();
                batch
            }
            Err(e) => {
                self.telemetry.decode_failures.inc();
                warn!("Failed to decode {} payload of {} bytes: {}", signal, payload.len(), e);
                return;
            }
        };

        if let Err(e) = self.sink.forward(batch).await {
            self.telemetry.consume_failures.inc();
            warn!("Downstream {} consumer failed: {}", signal, e);
        }
    }
}

/// Runs a [`ReadLoop`] over a reader built for every installed handle
pub struct ReadLoopConsumer<F, B, S> {
    factory: F,
    read_loop: ReadLoop<B, S>,
}

impl<F, B, S> ReadLoopConsumer<F, B, S> {
    pub fn new(factory: F, read_loop: ReadLoop<B, S>) -> Self {
        Self { factory, read_loop }
    }
}

#[async_trait]
impl<H, F, B, S> HandleConsumer<H> for ReadLoopConsumer<F, B, S>
where
    H: Send + Sync + 'static,
    F: ReaderFactory<H>,
    B: WireBatch + 'static,
    S: BatchSink<B>,
{
    async fn consume(&self, handle: &H, cancel: CancellationToken) {
        let reader = match self.factory.create(handle) {
            Ok(reader) => reader,
            Err(e) => {
                error!(
                    "Cannot read {} buffer: {}",
                    self.read_loop.telemetry.signal(),
                    e
                );
                return;
            }
        };
        self.read_loop.run(reader, cancel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::frame;
    use crate::error::ReaderError;
    use crate::proto::{logs, trace};
    use crate::reader::ReaderCloser;
    use prost::Message;
    use relay_exchange::HandleSignal;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Step {
        Sample(Vec<u8>),
        Lost(u64),
        Fail,
    }

    /// Plays back `steps`, then cancels `drained` and blocks until closed
    struct ScriptedReader {
        steps: VecDeque<Step>,
        closer: ReaderCloser,
        drained: CancellationToken,
        reads: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedReader {
        fn new(steps: Vec<Step>, drained: CancellationToken) -> Self {
            Self {
                steps: steps.into(),
                closer: ReaderCloser::new(),
                drained,
                reads: Arc::default(),
                closed: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl BufferReader for ScriptedReader {
        async fn read_into(&mut self, record: &mut BufferRecord) -> Result<(), ReaderError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.closer.is_closed() {
                return Err(ReaderError::Closed);
            }
            match self.steps.pop_front() {
                Some(Step::Sample(data)) => record.set_sample(&data),
                Some(Step::Lost(n)) => record.set_lost(n),
                Some(Step::Fail) => {
                    return Err(ReaderError::Io(io::Error::new(io::ErrorKind::Other, "boom")))
                }
                None => {
                    self.drained.cancel();
                    self.closer.closed().await;
                    return Err(ReaderError::Closed);
                }
            }
            Ok(())
        }

        fn closer(&self) -> ReaderCloser {
            self.closer.clone()
        }

        fn close(&mut self) -> Result<(), ReaderError> {
            self.closer.close();
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Collect {
        traces: Mutex<Vec<TracesData>>,
        logs: Mutex<Vec<LogsData>>,
        reject: bool,
    }

    #[async_trait]
    impl TracesConsumer for Collect {
        async fn consume_traces(&self, batch: TracesData) -> Result<(), ConsumeError> {
            self.traces.lock().unwrap().push(batch);
            if self.reject {
                return Err(ConsumeError::new("pipeline full"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LogsConsumer for Collect {
        async fn consume_logs(&self, batch: LogsData) -> Result<(), ConsumeError> {
            self.logs.lock().unwrap().push(batch);
            Ok(())
        }
    }

    fn traces_batch(spans: usize) -> TracesData {
        TracesData {
            resource_spans: vec![trace::ResourceSpans {
                scope_spans: vec![trace::ScopeSpans {
                    spans: (0..spans)
                        .map(|i| trace::Span {
                            name: format!("span-{}", i),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    fn steps_len(steps: &[Step]) -> u64 {
        steps
            .iter()
            .map(|step| match step {
                Step::Sample(data) => data.len() as u64,
                _ => 0,
            })
            .sum()
    }

    async fn run_traces(
        sink: Arc<Collect>,
        steps: Vec<Step>,
    ) -> (SignalTelemetry, Arc<AtomicBool>) {
        let telemetry = SignalTelemetry::unregistered(HandleSignal::Traces).unwrap();
        let read_loop: ReadLoop<TracesData, _> = ReadLoop::new(sink, telemetry.clone());
        let cancel = CancellationToken::new();
        let reader = ScriptedReader::new(steps, cancel.clone());
        let closed = reader.closed.clone();
        read_loop.run(Box::new(reader), cancel).await;
        (telemetry, closed)
    }

    #[tokio::test]
    async fn test_framed_batch_is_forwarded() {
        let sink = Arc::new(Collect::default());
        let batch = traces_batch(3);
        let steps = vec![Step::Sample(frame(&batch.encode_to_vec()))];

        let framed_len = steps_len(&steps);
        let (telemetry, closed) = run_traces(sink.clone(), steps).await;

        assert_eq!(*sink.traces.lock().unwrap(), vec![batch]);
        assert_eq!(telemetry.bytes_read.get(), framed_len);
        assert_eq!(telemetry.decoded("current").get(), 1);
        assert_eq!(telemetry.lost_samples.get(), 0);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_lost_samples_skip_decode() {
        let sink = Arc::new(Collect::default());
        let steps = vec![Step::Lost(7), Step::Lost(3)];

        let (telemetry, _) = run_traces(sink.clone(), steps).await;

        assert_eq!(telemetry.lost_samples.get(), 10);
        assert_eq!(telemetry.bytes_read.get(), 0);
        assert_eq!(telemetry.decoded("current").get(), 0);
        assert!(sink.traces.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_frames_are_dropped() {
        let sink = Arc::new(Collect::default());
        let mut truncated = frame(&traces_batch(1).encode_to_vec());
        truncated.pop();
        let steps = vec![
            Step::Sample(vec![1, 2, 3]),
            Step::Sample(truncated),
            Step::Sample(frame(&[0x0a, 0xff, 0xff, 0xff])),
        ];

        let (telemetry, _) = run_traces(sink.clone(), steps).await;

        assert!(sink.traces.lock().unwrap().is_empty());
        assert_eq!(telemetry.records_dropped("too_short").get(), 1);
        assert_eq!(telemetry.records_dropped("truncated").get(), 1);
        assert_eq!(telemetry.decode_failures.get(), 1);
        // only the frame that unwrapped cleanly is counted
        assert_eq!(telemetry.bytes_read.get(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_and_consume_errors_do_not_stop_loop() {
        let sink = Arc::new(Collect {
            reject: true,
            ..Default::default()
        });
        let payload = frame(&traces_batch(1).encode_to_vec());
        let steps = vec![
            Step::Fail,
            Step::Sample(payload.clone()),
            Step::Fail,
            Step::Sample(payload),
        ];

        let (telemetry, _) = run_traces(sink.clone(), steps).await;

        assert_eq!(sink.traces.lock().unwrap().len(), 2);
        assert_eq!(telemetry.consume_failures.get(), 2);
        assert_eq!(telemetry.read_errors.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reads_back_off() {
        let sink = Arc::new(Collect::default());
        let steps = (0..5).map(|_| Step::Fail).collect();

        let started = Instant::now();
        let (telemetry, _) = run_traces(sink, steps).await;

        assert_eq!(telemetry.read_errors.get(), 5);
        assert!(started.elapsed() >= READ_ERROR_BACKOFF * 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let telemetry = SignalTelemetry::unregistered(HandleSignal::Traces).unwrap();
        let read_loop: ReadLoop<TracesData, _> =
            ReadLoop::new(Arc::new(Collect::default()), telemetry.clone());
        let cancel = CancellationToken::new();
        let reader = ScriptedReader::new(vec![Step::Fail], CancellationToken::new());
        let closed = reader.closed.clone();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { read_loop.run(Box::new(reader), cancel).await }
        });
        tokio::time::sleep(READ_ERROR_BACKOFF / 4).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(telemetry.read_errors.get(), 1);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_legacy_logs_are_counted_separately() {
        let sink = Arc::new(Collect::default());
        let legacy = logs::ResourceLogs {
            scope_logs: vec![logs::ScopeLogs {
                log_records: vec![logs::LogRecord {
                    severity_text: "WARN".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        let telemetry = SignalTelemetry::unregistered(HandleSignal::Logs).unwrap();
        let read_loop: ReadLoop<LogsData, _> = ReadLoop::new(sink.clone(), telemetry.clone());
        let cancel = CancellationToken::new();
        let reader = ScriptedReader::new(
            vec![Step::Sample(frame(&legacy.encode_to_vec()))],
            cancel.clone(),
        );

        read_loop.run(Box::new(reader), cancel).await;

        assert_eq!(sink.logs.lock().unwrap()[0].log_record_count(), 1);
        assert_eq!(telemetry.decoded("legacy").get(), 1);
        assert_eq!(telemetry.decoded("current").get(), 0);
    }

    struct Toggle(AtomicBool);

    impl MemoryPressure for Toggle {
        fn is_limit_reached(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_pressure_pauses_reads() {
        let pressure = Arc::new(Toggle(AtomicBool::new(true)));
        let sink = Arc::new(Collect::default());
        let telemetry = SignalTelemetry::unregistered(HandleSignal::Traces).unwrap();
        let read_loop: ReadLoop<TracesData, _> = ReadLoop::new(sink.clone(), telemetry.clone())
            .with_memory_pressure(pressure.clone());

        let drained = CancellationToken::new();
        let reader = ScriptedReader::new(
            vec![Step::Sample(frame(&traces_batch(2).encode_to_vec()))],
            drained.clone(),
        );
        let reads = reader.reads.clone();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { read_loop.run(Box::new(reader), cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert!(telemetry.memory_pressure_wait_ms.get() >= 160);

        pressure.0.store(false, Ordering::SeqCst);
        tokio::time::sleep(MEMORY_POLL_INTERVAL * 2).await;
        drained.cancelled().await;
        assert!(reads.load(Ordering::SeqCst) >= 1);
        assert_eq!(sink.traces.lock().unwrap()[0].span_count(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_during_pressure_stops_loop() {
        let pressure = Arc::new(Toggle(AtomicBool::new(true)));
        let telemetry = SignalTelemetry::unregistered(HandleSignal::Traces).unwrap();
        let read_loop: ReadLoop<TracesData, _> =
            ReadLoop::new(Arc::new(Collect::default()), telemetry).with_memory_pressure(pressure);
        let cancel = CancellationToken::new();
        let reader = ScriptedReader::new(vec![], CancellationToken::new());
        let closed = reader.closed.clone();

        cancel.cancel();
        read_loop.run(Box::new(reader), cancel).await;
        assert!(closed.load(Ordering::SeqCst));
    }
}
