//! Error types for the descriptor exchange

use std::os::fd::RawFd;

use thiserror::Error;

use crate::protocol::RequestType;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),

    /// The peer closed the connection without answering. Clients retry.
    #[error("connection closed without a response")]
    NoResponse,

    #[error("unexpected server response {got:?}, expected {expected:?}")]
    UnexpectedResponse { expected: &'static str, got: String },

    #[error("expected {expected} descriptor(s), got {got}")]
    UnexpectedHandleCount { expected: usize, got: usize },

    #[error("response carried no descriptors")]
    NoHandles,

    #[error("control message truncated, more than {0} descriptors sent")]
    ControlTruncated(usize),

    #[error("request {0:?} is not part of the protocol")]
    UnknownRequest(String),

    #[error("no provider registered for {0}")]
    ProviderNotConfigured(RequestType),

    #[error("provider returned invalid descriptor {0}")]
    InvalidHandle(RawFd),
}

impl ExchangeError {
    /// Errors a client should treat as "agent not ready yet"
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExchangeError::UnknownRequest(_))
    }
}
