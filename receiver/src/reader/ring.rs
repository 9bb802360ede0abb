use std::os::fd::OwnedFd;

use async_trait::async_trait;
use aya::maps::{Map, MapData, RingBuf};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::warn;

use super::{BufferReader, BufferRecord, ReaderCloser};
use crate::error::ReaderError;

/// Reader over a `BPF_MAP_TYPE_RINGBUF` map, woken through epoll
pub struct RingBufferReader {
    ring: Option<AsyncFd<RingBuf<MapData>>>,
    closer: ReaderCloser,
}

impl RingBufferReader {
    pub fn new(fd: OwnedFd) -> Result<Self, ReaderError> {
        let map = Map::RingBuf(MapData::from_fd(fd)?);
        let ring = RingBuf::try_from(map)?;
        let ring = AsyncFd::with_interest(ring, Interest::READABLE)?;
        Ok(Self {
            ring: Some(ring),
            closer: ReaderCloser::new(),
        })
    }
}

#[async_trait]
impl BufferReader for RingBufferReader {
    async fn read_into(&mut self, record: &mut BufferRecord) -> Result<(), ReaderError> {
        let closer = self.closer.clone();
        let ring = self.ring.as_mut().ok_or(ReaderError::Closed)?;

        loop {
            if closer.is_closed() {
                return Err(ReaderError::Closed);
            }
            if let Some(item) = ring.get_mut().next() {
                record.set_sample(&item);
                return Ok(());
            }

            tokio::select! {
                _ = closer.closed() => return Err(ReaderError::Closed),
                guard = ring.readable_mut() => match guard {
                    Ok(mut guard) => guard.clear_ready(),
                    Err(e) => {
                        warn!("Ring buffer poll failed: {}", e);
                        return Err(ReaderError::Io(e));
                    }
                },
            }
        }
    }

    fn closer(&self) -> ReaderCloser {
        self.closer.clone()
    }

    fn close(&mut self) -> Result<(), ReaderError> {
        self.closer.close();
        self.ring = None;
        Ok(())
    }
}
