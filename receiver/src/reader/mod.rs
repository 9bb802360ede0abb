//! Buffer readers
//!
//! One read contract over the two kernel buffer flavours the agent may hand
//! over. The concrete reader is picked from the map's kernel type when the
//! handle is installed.

mod perf;
mod ring;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ReaderError;
use crate::map::{MapHandle, MapKind};

pub use perf::PerfArrayReader;
pub use ring::RingBufferReader;

/// Default size of each per-CPU perf buffer, in pages
pub const DEFAULT_PERF_BUFFER_PAGES: usize = 2048;

/// One record read from a buffer.
///
/// Readers reuse the caller's record, so its contents are only valid until
/// the next `read_into` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BufferRecord {
    pub raw_sample: Vec<u8>,
    /// Samples the kernel dropped before this read. When non-zero the
    /// sample itself is empty.
    pub lost_samples: u64,
}

impl BufferRecord {
    pub(crate) fn set_sample(&mut self, sample: &[u8]) {
        self.raw_sample.clear();
        self.raw_sample.extend_from_slice(sample);
        self.lost_samples = 0;
    }

    pub(crate) fn set_lost(&mut self, lost: u64) {
        self.raw_sample.clear();
        self.lost_samples = lost;
    }
}

/// Closes a reader from outside the task that is reading from it.
///
/// A blocked `read_into` returns [`ReaderError::Closed`] once this fires.
/// Closing more than once is harmless.
#[derive(Debug, Clone, Default)]
pub struct ReaderCloser {
    token: CancellationToken,
}

impl ReaderCloser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

#[async_trait]
pub trait BufferReader: Send {
    /// Wait for the next record and copy it into `record`.
    async fn read_into(&mut self, record: &mut BufferRecord) -> Result<(), ReaderError>;

    /// A handle that can close this reader from another task.
    fn closer(&self) -> ReaderCloser;

    /// Release the reader. Safe to call after the closer already fired.
    fn close(&mut self) -> Result<(), ReaderError>;
}

/// Builds a reader for a handle the manager just installed
pub trait ReaderFactory<H>: Send + Sync + 'static {
    fn create(&self, handle: &H) -> Result<Box<dyn BufferReader>, ReaderError>;
}

/// Creates ring or perf readers over kernel maps
#[derive(Debug, Clone, Copy)]
pub struct KernelReaderFactory {
    perf_pages: usize,
}

impl KernelReaderFactory {
    pub fn new(perf_pages: usize) -> Self {
        Self { perf_pages }
    }
}

impl Default for KernelReaderFactory {
    fn default() -> Self {
        Self::new(DEFAULT_PERF_BUFFER_PAGES)
    }
}

impl ReaderFactory<MapHandle> for KernelReaderFactory {
    fn create(&self, handle: &MapHandle) -> Result<Box<dyn BufferReader>, ReaderError> {
        match handle.kind() {
            MapKind::RingBuf => Ok(Box::new(RingBufferReader::new(handle.try_clone_fd()?)?)),
            MapKind::PerfEventArray => Ok(Box::new(PerfArrayReader::new(
                handle.try_clone_fd()?,
                self.perf_pages,
            )?)),
            _ => Err(ReaderError::UnsupportedMapType(handle.info().map_type)),
        }
    }
}
