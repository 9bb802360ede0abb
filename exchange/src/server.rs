//! Descriptor exchange server, run inside the agent process.
//!
//! The agent registers one provider per signal. Providers are called on
//! every request so a buffer map replaced by the agent is picked up by the
//! next connecting receiver without restarting the server.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ExchangeError;
use crate::protocol::{HandleSignal, RequestType, MAX_HANDLES, MAX_REQUEST_LEN};
use crate::scm::send_with_fds;

type SingleProvider = Arc<dyn Fn() -> RawFd + Send + Sync>;
type MultiProvider = Arc<dyn Fn() -> Vec<RawFd> + Send + Sync>;

#[derive(Default, Clone)]
struct Providers {
    traces: Option<SingleProvider>,
    logs: Option<SingleProvider>,
    metrics: Option<MultiProvider>,
}

impl Providers {
    fn resolve(&self, request: RequestType) -> Result<Vec<RawFd>, ExchangeError> {
        let fds = match request.signal() {
            HandleSignal::Traces => self.traces.as_ref().map(|p| vec![p()]),
            HandleSignal::Logs => self.logs.as_ref().map(|p| vec![p()]),
            HandleSignal::Metrics => self.metrics.as_ref().map(|p| p()),
        }
        .ok_or(ExchangeError::ProviderNotConfigured(request))?;

        if fds.is_empty() {
            return Err(ExchangeError::NoHandles);
        }
        if fds.len() > MAX_HANDLES {
            return Err(ExchangeError::UnexpectedHandleCount {
                expected: MAX_HANDLES,
                got: fds.len(),
            });
        }
        if let Some(bad) = fds.iter().find(|fd| **fd <= 0) {
            return Err(ExchangeError::InvalidHandle(*bad));
        }
        Ok(fds)
    }
}

/// Exchange server configuration, before the socket is bound
pub struct Server {
    path: PathBuf,
    providers: Providers,
}

impl Server {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            providers: Providers::default(),
        }
    }

    /// Provider answering `GET_TRACES_FD` and the legacy `GET_FD`
    pub fn with_traces_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> RawFd + Send + Sync + 'static,
    {
        self.providers.traces = Some(Arc::new(provider));
        self
    }

    pub fn with_logs_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> RawFd + Send + Sync + 'static,
    {
        self.providers.logs = Some(Arc::new(provider));
        self
    }

    pub fn with_metrics_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Vec<RawFd> + Send + Sync + 'static,
    {
        self.providers.metrics = Some(Arc::new(provider));
        self
    }

    /// Remove any stale socket file and bind a fresh listener.
    pub fn bind(self) -> Result<BoundServer, ExchangeError> {
        remove_socket_file(&self.path)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.path)?;
        info!("Exchange server listening on {}", self.path.display());
        Ok(BoundServer {
            path: self.path,
            listener,
            providers: Arc::new(self.providers),
        })
    }

    /// Bind and serve until `cancel` fires.
    pub async fn serve(self, cancel: CancellationToken) -> Result<(), ExchangeError> {
        self.bind()?.serve(cancel).await
    }
}

/// A server whose socket is bound and accepting connections
pub struct BoundServer {
    path: PathBuf,
    listener: UnixListener,
    providers: Arc<Providers>,
}

impl BoundServer {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `cancel` fires, then remove the socket file.
    ///
    /// Each connection is handled on its own task.
    pub async fn serve(self, cancel: CancellationToken) -> Result<(), ExchangeError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let providers = self.providers.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &providers).await {
                                warn!("Exchange request dropped: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Exchange accept failed: {}", e),
                },
            }
        }

        drop(self.listener);
        remove_socket_file(&self.path)?;
        info!("Exchange server stopped");
        Ok(())
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    providers: &Providers,
) -> Result<(), ExchangeError> {
    let mut buf = [0u8; MAX_REQUEST_LEN];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        debug!("Exchange client disconnected before sending a request");
        return Ok(());
    }

    let request = RequestType::parse(&buf[..n])?;
    let fds = providers.resolve(request)?;
    send_with_fds(&stream, request.response_token().as_bytes(), &fds).await?;
    debug!("Sent {} descriptor(s) for {}", fds.len(), request);
    Ok(())
}

fn remove_socket_file(path: &Path) -> Result<(), ExchangeError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_unconfigured_provider() {
        let providers = Providers::default();
        let err = providers.resolve(RequestType::GetTracesFd).unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::ProviderNotConfigured(RequestType::GetTracesFd)
        ));
    }

    #[test]
    fn test_resolve_legacy_uses_traces_provider() {
        let providers = Providers {
            traces: Some(Arc::new(|| 7)),
            ..Default::default()
        };
        assert_eq!(providers.resolve(RequestType::GetFd).unwrap(), vec![7]);
        assert!(providers.resolve(RequestType::GetLogsFd).is_err());
    }

    #[test]
    fn test_resolve_rejects_invalid_descriptors() {
        let providers = Providers {
            traces: Some(Arc::new(|| 0)),
            metrics: Some(Arc::new(|| vec![5, -1])),
            ..Default::default()
        };
        assert!(matches!(
            providers.resolve(RequestType::GetTracesFd),
            Err(ExchangeError::InvalidHandle(0))
        ));
        assert!(matches!(
            providers.resolve(RequestType::GetMetricsFd),
            Err(ExchangeError::InvalidHandle(-1))
        ));
    }

    #[test]
    fn test_resolve_rejects_empty_and_oversized_lists() {
        let empty = Providers {
            metrics: Some(Arc::new(|| Vec::<RawFd>::new())),
            ..Default::default()
        };
        assert!(matches!(
            empty.resolve(RequestType::GetMetricsFd),
            Err(ExchangeError::NoHandles)
        ));

        let oversized = Providers {
            metrics: Some(Arc::new(|| (3..3 + MAX_HANDLES as RawFd + 1).collect::<Vec<RawFd>>())),
            ..Default::default()
        };
        assert!(matches!(
            oversized.resolve(RequestType::GetMetricsFd),
            Err(ExchangeError::UnexpectedHandleCount { .. })
        ));
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("exchange.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let bound = Server::new(&path).bind().unwrap();
        assert_eq!(bound.path(), path.as_path());

        let cancel = CancellationToken::new();
        cancel.cancel();
        bound.serve(cancel).await.unwrap();
        assert!(!path.exists());
    }
}
