//! Map lifecycle manager
//!
//! Owns the active handle for one signal and hot-swaps it when the agent
//! publishes a new one. A swap always fully retires the running consumer
//! before the next one starts:
//!
//! 1. cancel the running consumer's token
//! 2. join its task, which hands the handle back
//! 3. close the old handle
//! 4. start a consumer for the new handle under a fresh child token
//!
//! The join in step 2 is the only synchronisation. Nothing else touches the
//! active handle, so no lock is needed.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use async_trait::async_trait;
use prometheus::IntCounter;
use relay_exchange::HandleSignal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::ReceiverError;

/// A handle whose lifetime is controlled by [`MapManager`]
pub trait ManagedHandle: Send + Sync + Sized + 'static {
    /// Build the handle from descriptors received over the exchange socket.
    fn from_transferred(fds: Vec<OwnedFd>) -> Result<Self, ReceiverError>;

    /// Kernel object ids; equal identities mean the same underlying maps.
    fn identity(&self) -> Vec<u32>;

    /// Release the underlying descriptors.
    fn close(self);
}

/// Long-running work bound to the active handle
#[async_trait]
pub trait HandleConsumer<H>: Send + Sync + 'static {
    /// Consume `handle` until `cancel` fires or the source is exhausted.
    async fn consume(&self, handle: &H, cancel: CancellationToken);
}

/// Lifecycle phase of a [`MapManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Active,
    Swapping,
    Closed,
}

struct ActiveConsumer<H> {
    cancel: CancellationToken,
    task: JoinHandle<H>,
}

pub struct MapManager<H, C> {
    signal: HandleSignal,
    consumer: Arc<C>,
    active: Option<ActiveConsumer<H>>,
    state: ManagerState,
    swaps: Option<IntCounter>,
}

impl<H, C> MapManager<H, C>
where
    H: ManagedHandle,
    C: HandleConsumer<H>,
{
    pub fn new(signal: HandleSignal, consumer: Arc<C>) -> Self {
        Self {
            signal,
            consumer,
            active: None,
            state: ManagerState::Idle,
            swaps: None,
        }
    }

    /// Count every handle installation on `counter`
    pub fn with_swap_counter(mut self, counter: IntCounter) -> Self {
        self.swaps = Some(counter);
        self
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    /// Apply handle updates in arrival order until `cancel` fires or the
    /// sending side goes away, then retire the active consumer and close
    /// every handle still owned.
    pub async fn run(mut self, mut updates: mpsc::Receiver<H>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Some(handle) => self.install(handle, &cancel).await,
                    None => break,
                },
            }
        }

        self.retire().await;
        updates.close();
        while let Ok(pending) = updates.try_recv() {
            pending.close();
        }
        self.state = ManagerState::Closed;
        info!("{} map manager stopped", self.signal);
    }

    async fn install(&mut self, handle: H, cancel: &CancellationToken) {
        if self.active.is_some() {
            self.state = ManagerState::Swapping;
            debug!("Swapping {} handle", self.signal);
        }
        self.retire().await;

        let token = cancel.child_token();
        let consumer = self.consumer.clone();
        let loop_token = token.clone();
        let task = tokio::spawn(async move {
            consumer.consume(&handle, loop_token).await;
            handle
        });

        self.active = Some(ActiveConsumer {
            cancel: token,
            task,
        });
        self.state = ManagerState::Active;
        if let Some(swaps) = &self.swaps {
            swaps.inc();
        }
        info!("{} handle installed", self.signal);
    }

    /// Stop the running consumer, wait for it, then close its handle.
    async fn retire(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        active.cancel.cancel();
        match active.task.await {
            Ok(handle) => handle.close(),
            // the handle was dropped, and its descriptors closed, with the task
            Err(e) => error!("{} consumer task failed: {}", self.signal, e),
        }
    }
}
