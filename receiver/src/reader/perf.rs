use std::os::fd::OwnedFd;

use async_trait::async_trait;
use aya::maps::perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer};
use aya::maps::{Map, MapData};
use aya::util::online_cpus;
use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{BufferReader, BufferRecord, ReaderCloser};
use crate::error::ReaderError;

/// Events drained per `read_events` call on one CPU
const EVENTS_PER_READ: usize = 16;
/// Samples buffered between the per-CPU tasks and the reader
const SAMPLE_QUEUE_DEPTH: usize = 256;

enum PerfSample {
    Data(Vec<u8>),
    Lost(u64),
    /// The CPU's drain task hit an error and stopped
    Failed { cpu: u32, error: ReaderError },
}

/// Result of one drain of a per-CPU buffer
#[derive(Debug, Default, Clone, Copy)]
struct CpuEvents {
    read: usize,
    lost: usize,
}

/// One CPU's slice of a perf event array
#[async_trait]
trait CpuBuffer: Send + 'static {
    async fn drain(&mut self, buffers: &mut [BytesMut]) -> Result<CpuEvents, ReaderError>;
}

#[async_trait]
impl CpuBuffer for AsyncPerfEventArrayBuffer<MapData> {
    async fn drain(&mut self, buffers: &mut [BytesMut]) -> Result<CpuEvents, ReaderError> {
        let events = self.read_events(buffers).await?;
        Ok(CpuEvents {
            read: events.read,
            lost: events.lost,
        })
    }
}

/// Reader over a `BPF_MAP_TYPE_PERF_EVENT_ARRAY`.
///
/// One task per online CPU drains that CPU's buffer into a shared queue;
/// `read_into` pops from the queue. A task that fails reports its error
/// through the queue before it exits.
pub struct PerfArrayReader {
    samples: mpsc::Receiver<PerfSample>,
    tasks: JoinSet<()>,
    closer: ReaderCloser,
    _array: Option<AsyncPerfEventArray<MapData>>,
}

impl PerfArrayReader {
    pub fn new(fd: OwnedFd, pages: usize) -> Result<Self, ReaderError> {
        let map = Map::PerfEventArray(MapData::from_fd(fd)?);
        let mut array = AsyncPerfEventArray::try_from(map)?;
        let cpus = online_cpus().map_err(|(_, e)| ReaderError::Io(e))?;

        let buffers = cpus
            .into_iter()
            .map(|cpu| Ok((cpu, array.open(cpu, Some(pages))?)))
            .collect::<Result<Vec<_>, ReaderError>>()?;

        let mut reader = Self::from_cpu_buffers(buffers);
        reader._array = Some(array);
        Ok(reader)
    }

    fn from_cpu_buffers<C: CpuBuffer>(buffers: Vec<(u32, C)>) -> Self {
        let closer = ReaderCloser::new();
        let (tx, samples) = mpsc::channel(SAMPLE_QUEUE_DEPTH);
        let mut tasks = JoinSet::new();

        for (cpu, buf) in buffers {
            tasks.spawn(drain_cpu(cpu, buf, tx.clone(), closer.clone()));
        }

        Self {
            samples,
            tasks,
            closer,
            _array: None,
        }
    }
}

async fn drain_cpu<C: CpuBuffer>(
    cpu: u32,
    mut buf: C,
    tx: mpsc::Sender<PerfSample>,
    closer: ReaderCloser,
) {
    let mut buffers = (0..EVENTS_PER_READ)
        .map(|_| BytesMut::with_capacity(4096))
        .collect::<Vec<_>>();

    loop {
        let events = tokio::select! {
            _ = closer.closed() => return,
            events = buf.drain(&mut buffers) => events,
        };
        let events = match events {
            Ok(events) => events,
            Err(error) => {
                warn!("Perf buffer read on cpu {} failed: {}", cpu, error);
                let _ = tx.send(PerfSample::Failed { cpu, error }).await;
                return;
            }
        };

        if events.lost > 0 && tx.send(PerfSample::Lost(events.lost as u64)).await.is_err() {
            return;
        }
        for sample in buffers.iter().take(events.read) {
            if tx.send(PerfSample::Data(sample.to_vec())).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl BufferReader for PerfArrayReader {
    async fn read_into(&mut self, record: &mut BufferRecord) -> Result<(), ReaderError> {
        if self.closer.is_closed() {
            return Err(ReaderError::Closed);
        }

        let closer = self.closer.clone();
        let sample = tokio::select! {
            biased;
            _ = closer.closed() => return Err(ReaderError::Closed),
            sample = self.samples.recv() => sample,
        };

        match sample {
            Some(PerfSample::Data(data)) => record.set_sample(&data),
            Some(PerfSample::Lost(lost)) => record.set_lost(lost),
            Some(PerfSample::Failed { cpu, error }) => {
                debug!("Perf buffer on cpu {} stopped", cpu);
                return Err(error);
            }
            None => {
                // every drain task has exited and reported why; nothing
                // more will arrive until the reader is closed
                closer.closed().await;
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
        self.tasks.abort_all();
        self.samples.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::time::Duration;

    enum Drain {
        Samples(Vec<&'static [u8]>, usize),
        Fail,
    }

    /// Plays back its drains, then never becomes readable again
    struct ScriptedCpu(VecDeque<Drain>);

    #[async_trait]
    impl CpuBuffer for ScriptedCpu {
        async fn drain(&mut self, buffers: &mut [BytesMut]) -> Result<CpuEvents, ReaderError> {
            match self.0.pop_front() {
                Some(Drain::Samples(samples, lost)) => {
                    for (buf, sample) in buffers.iter_mut().zip(&samples) {
                        buf.clear();
                        buf.extend_from_slice(sample);
                    }
                    Ok(CpuEvents {
                        read: samples.len(),
                        lost,
                    })
                }
                Some(Drain::Fail) => Err(ReaderError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "perf buffer unmapped",
                ))),
                None => std::future::pending().await,
            }
        }
    }

    #[test]
    fn test_rejects_non_map_descriptor() {
        let file = tempfile::tempfile().unwrap();
        assert!(PerfArrayReader::new(file.into(), 8).is_err());
    }

    #[tokio::test]
    async fn test_samples_and_losses_are_delivered() {
        let cpu = ScriptedCpu(VecDeque::from([Drain::Samples(vec![&b"abc"[..], &b"de"[..]], 4)]));
        let mut reader = PerfArrayReader::from_cpu_buffers(vec![(0, cpu)]);
        let mut record = BufferRecord::default();

        reader.read_into(&mut record).await.unwrap();
        assert_eq!(record.lost_samples, 4);
        reader.read_into(&mut record).await.unwrap();
        assert_eq!(record.raw_sample, b"abc");
        reader.read_into(&mut record).await.unwrap();
        assert_eq!(record.raw_sample, b"de");
        reader.close().unwrap();
    }

    #[tokio::test]
    async fn test_failed_cpu_surfaces_error_instead_of_closing() {
        let failing = ScriptedCpu(VecDeque::from([Drain::Fail]));
        let mut reader = PerfArrayReader::from_cpu_buffers(vec![(3, failing)]);
        let mut record = BufferRecord::default();

        let err = reader.read_into(&mut record).await.unwrap_err();
        assert!(!err.is_closed());
        assert!(matches!(err, ReaderError::Io(_)));

        // with every CPU stopped the reader idles until it is closed
        let idle = tokio::time::timeout(Duration::from_millis(50), reader.read_into(&mut record));
        assert!(idle.await.is_err());

        reader.closer().close();
        let err = reader.read_into(&mut record).await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_other_cpus_keep_reading_after_one_fails() {
        let failing = ScriptedCpu(VecDeque::from([Drain::Fail]));
        let healthy = ScriptedCpu(VecDeque::from([Drain::Samples(vec![&b"span"[..]], 0)]));
        let mut reader = PerfArrayReader::from_cpu_buffers(vec![(0, failing), (1, healthy)]);
        let mut record = BufferRecord::default();

        let mut errors = 0;
        let mut samples = Vec::new();
        for _ in 0..2 {
            match reader.read_into(&mut record).await {
                Ok(()) => samples.push(record.raw_sample.clone()),
                Err(e) => {
                    assert!(!e.is_closed());
                    errors += 1;
                }
            }
        }
        assert_eq!(errors, 1);
        assert_eq!(samples, vec![b"span".to_vec()]);
        reader.close().unwrap();
    }
}
