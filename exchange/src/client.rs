//! Descriptor exchange client, run inside a receiver.
//!
//! [`Client::listen`] keeps a receiver attached to the agent across agent
//! restarts: it requests descriptors until the agent answers, hands them to
//! the caller, then watches the socket file and asks again once the agent
//! has re-created it.

use std::future::Future;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ExchangeError;
use crate::protocol::{RequestType, MAX_REQUEST_LEN};
use crate::scm::recv_with_fds;

/// Timing knobs for [`Client::listen`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Delay between failed connection attempts
    pub reconnect_interval: Duration,
    /// How often the socket file is checked for replacement
    pub poll_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(2),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Identity of the socket file. A new value means the agent re-created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketIdentity {
    dev: u64,
    ino: u64,
    mtime_sec: i64,
    mtime_nsec: i64,
}

impl SocketIdentity {
    pub fn of(path: &Path) -> Result<Self, ExchangeError> {
        let st = nix::sys::stat::stat(path)?;
        Ok(Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mtime_sec: st.st_mtime as i64,
            mtime_nsec: st.st_mtime_nsec as i64,
        })
    }
}

pub struct Client {
    path: PathBuf,
    request: RequestType,
    options: ClientOptions,
}

impl Client {
    pub fn new(path: impl Into<PathBuf>, request: RequestType) -> Self {
        Self {
            path: path.into(),
            request,
            options: ClientOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn request(&self) -> RequestType {
        self.request
    }

    /// Perform one request/response exchange.
    ///
    /// The caller owns every returned descriptor. A connection closed by the
    /// server without a reply yields [`ExchangeError::NoResponse`].
    pub async fn request_handles(&self) -> Result<Vec<OwnedFd>, ExchangeError> {
        let mut stream = UnixStream::connect(&self.path).await?;
        stream.write_all(self.request.as_str().as_bytes()).await?;

        let mut buf = [0u8; MAX_REQUEST_LEN];
        let (n, fds) = recv_with_fds(&stream, &mut buf).await?;
        if n == 0 && fds.is_empty() {
            return Err(ExchangeError::NoResponse);
        }

        let expected = self.request.response_token();
        if &buf[..n] != expected.as_bytes() {
            return Err(ExchangeError::UnexpectedResponse {
                expected,
                got: String::from_utf8_lossy(&buf[..n]).into_owned(),
            });
        }
        if fds.is_empty() {
            return Err(ExchangeError::NoHandles);
        }
        if !self.request.is_multi() && fds.len() != 1 {
            return Err(ExchangeError::UnexpectedHandleCount {
                expected: 1,
                got: fds.len(),
            });
        }
        Ok(fds)
    }

    /// Deliver descriptors to `on_handles` every time the agent (re)publishes
    /// them, until `cancel` fires.
    pub async fn listen<F, Fut>(&self, cancel: &CancellationToken, mut on_handles: F)
    where
        F: FnMut(Vec<OwnedFd>) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.request_handles() => result,
            };

            match result {
                Ok(fds) => {
                    let identity = SocketIdentity::of(&self.path).ok();
                    debug!("Received {} descriptor(s) for {}", fds.len(), self.request);
                    on_handles(fds).await;
                    if !self.wait_for_socket_change(identity, cancel).await {
                        return;
                    }
                }
                Err(e) => {
                    info!(
                        "{} request to {} failed, retrying in {:?}: {}",
                        self.request,
                        self.path.display(),
                        self.options.reconnect_interval,
                        e
                    );
                    if !sleep_or_cancel(self.options.reconnect_interval, cancel).await {
                        return;
                    }
                }
            }
        }
    }

    /// Poll the socket file until it changes or disappears. Returns `false`
    /// when cancelled.
    async fn wait_for_socket_change(
        &self,
        initial: Option<SocketIdentity>,
        cancel: &CancellationToken,
    ) -> bool {
        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = ticker.tick() => {}
            }

            match SocketIdentity::of(&self.path) {
                Ok(current) if Some(current) == initial => continue,
                Ok(_) => {
                    info!("Exchange socket {} was replaced, reconnecting", self.path.display());
                    return true;
                }
                Err(e) => {
                    info!("Exchange socket {} unavailable ({}), reconnecting", self.path.display(), e);
                    return true;
                }
            }
        }
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
