//! Receiver orchestrator
//!
//! One [`EbpfReceiver`] per signal owns two background tasks:
//!
//! - the exchange client, which turns descriptors received from the agent
//!   into handles and queues them on a depth-1 channel
//! - the [`MapManager`], which installs each queued handle in turn
//!
//! Both run under one cancellation scope and are joined through a
//! `TaskTracker` on shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use prometheus::IntCounter;
use relay_exchange::{Client, ClientOptions, HandleSignal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{ReceiverError, Result};
use crate::manager::{HandleConsumer, ManagedHandle, MapManager};

/// Where and how a receiver reaches the agent
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    pub socket_path: PathBuf,
    pub client: ClientOptions,
}

impl ReceiverOptions {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: ClientOptions::default(),
        }
    }

    pub fn with_client_options(mut self, client: ClientOptions) -> Self {
        self.client = client;
        self
    }
}

pub struct EbpfReceiver {
    signal: HandleSignal,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl EbpfReceiver {
    /// Start receiving `signal`, feeding every installed handle to
    /// `consumer`. The tasks also stop when `parent` is cancelled.
    pub fn start<H, C>(
        signal: HandleSignal,
        options: ReceiverOptions,
        consumer: Arc<C>,
        swaps: IntCounter,
        parent: &CancellationToken,
    ) -> Self
    where
        H: ManagedHandle,
        C: HandleConsumer<H>,
    {
        let cancel = parent.child_token();
        let tracker = TaskTracker::new();
        let (updates_tx, updates_rx) = mpsc::channel::<H>(1);

        let client = Client::new(options.socket_path, signal.request()).with_options(options.client);
        tracker.spawn(run_client(client, updates_tx, cancel.clone()));

        let manager = MapManager::new(signal, consumer).with_swap_counter(swaps);
        tracker.spawn(manager.run(updates_rx, cancel.clone()));
        tracker.close();

        info!("{} receiver started", signal);
        Self {
            signal,
            cancel,
            tracker,
        }
    }

    pub fn signal(&self) -> HandleSignal {
        self.signal
    }

    /// Cancel both tasks and wait for them, for at most `deadline`.
    pub async fn shutdown(self, deadline: Duration) -> Result<()> {
        self.cancel.cancel();
        match tokio::time::timeout(deadline, self.tracker.wait()).await {
            Ok(()) => {
                info!("{} receiver stopped", self.signal);
                Ok(())
            }
            Err(_) => Err(ReceiverError::ShutdownTimeout { waited: deadline }),
        }
    }
}

/// Forward handles from the exchange client to the manager until cancelled.
async fn run_client<H: ManagedHandle>(
    client: Client,
    updates: mpsc::Sender<H>,
    cancel: CancellationToken,
) {
    let signal = client.request().signal();
    let mut last_identity: Option<Vec<u32>> = None;

    client
        .listen(&cancel, |fds| {
            let handle = match H::from_transferred(fds) {
                Ok(handle) if last_identity.as_ref() == Some(&handle.identity()) => {
                    debug!("{} agent re-sent the active maps, ignoring", signal);
                    handle.close();
                    None
                }
                Ok(handle) => {
                    last_identity = Some(handle.identity());
                    Some(handle)
                }
                Err(e) => {
                    warn!("Rejected {} descriptors from agent: {}", signal, e);
                    None
                }
            };

            let updates = updates.clone();
            let cancel = cancel.clone();
            async move {
                let Some(handle) = handle else {
                    return;
                };
                tokio::select! {
                    _ = cancel.cancelled() => handle.close(),
                    permit = updates.reserve() => match permit {
                        Ok(permit) => permit.send(handle),
                        Err(_) => handle.close(),
                    },
                }
            }
        })
        .await;

    debug!("{} exchange client stopped", signal);
}
