//! Error types for the receiver

use std::time::Duration;

use relay_exchange::ExchangeError;
use thiserror::Error;

/// Errors surfaced by a [`BufferReader`](crate::reader::BufferReader)
#[derive(Debug, Error)]
pub enum ReaderError {
    /// The reader was closed. Read loops treat this as a clean exit.
    #[error("reader closed")]
    Closed,

    #[error("unsupported buffer map type {0}")]
    UnsupportedMapType(u32),

    #[error("map error: {0}")]
    Map(#[from] aya::maps::MapError),

    #[error("perf buffer error: {0}")]
    PerfBuffer(#[from] aya::maps::perf::PerfBufferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReaderError {
    pub fn is_closed(&self) -> bool {
        matches!(self, ReaderError::Closed)
    }
}

/// Wire record framing and payload decoding failures
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("record of {0} bytes is shorter than the length prefix")]
    TooShort(usize),

    #[error("record declares {declared} payload bytes but only {available} are present")]
    Truncated { declared: u64, available: usize },

    #[error("payload is neither a current nor a legacy batch: {0}")]
    Proto(#[from] prost::DecodeError),
}

impl DecodeError {
    /// Label used for the dropped-records counter
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::TooShort(_) => "too_short",
            DecodeError::Truncated { .. } => "truncated",
            DecodeError::Proto(_) => "undecodable",
        }
    }
}

/// Returned by a downstream consumer that refused a batch
#[derive(Debug, Error)]
#[error("consumer rejected batch: {0}")]
pub struct ConsumeError(pub String);

impl ConsumeError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("background tasks did not stop within {waited:?}")]
    ShutdownTimeout { waited: Duration },

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = ReceiverError> = std::result::Result<T, E>;
