//! Keyed live subscriptions.
//!
//! Each subscription moves through `Closed -> Opening -> Open -> Closing ->
//! Closed`, or `Open -> Error -> Closed` when the transport fails. Open and
//! close are idempotent per id. One pump task per subscription delivers
//! messages to its handler in arrival order; there is no ordering across
//! subscriptions and no automatic reconnect.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use livesync_core::obs::{
    emit_subscription_closed, emit_subscription_error, emit_subscription_opened,
    subscription_span,
};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use crate::config::DEFAULT_CLOSE_TIMEOUT;
use crate::error::{SubscriptionError, TransportError};
use crate::transport::{LiveChannel, Transport};

/// Lifecycle state of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Closed,
    Opening,
    Open,
    Closing,
    Error,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionState::Closed => "closed",
            SubscriptionState::Opening => "opening",
            SubscriptionState::Open => "open",
            SubscriptionState::Closing => "closing",
            SubscriptionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Callbacks for one subscription's lifecycle.
#[async_trait]
pub trait SubscriptionHandler: Send + Sync {
    async fn on_open(&self, _id: &str) {}

    async fn on_message(&self, id: &str, raw: &str);

    async fn on_error(&self, _id: &str, _error: &TransportError) {}

    async fn on_close(&self, _id: &str) {}
}

struct Entry {
    generation: u64,
    state: SubscriptionState,
    handler: Arc<dyn SubscriptionHandler>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    close_notified: Arc<AtomicBool>,
}

type Entries = Arc<RwLock<HashMap<String, Entry>>>;

/// Owns every live subscription of one consumer.
pub struct SubscriptionManager<T: Transport> {
    transport: Arc<T>,
    entries: Entries,
    close_timeout: Duration,
    next_generation: AtomicU64,
}

impl<T: Transport> SubscriptionManager<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            entries: Arc::new(RwLock::new(HashMap::new())),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Current state of `id`; unknown ids are `Closed`.
    pub async fn state(&self, id: &str) -> SubscriptionState {
        self.entries
            .read()
            .await
            .get(id)
            .map_or(SubscriptionState::Closed, |e| e.state)
    }

    /// Ids of every subscription that is not closed.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Open a subscription and start delivering its messages to `handler`.
    ///
    /// Returns once the channel is connected and `on_open` has run. Fails
    /// with `AlreadyOpen` if `id` is opening or open.
    pub async fn open(
        &self,
        id: &str,
        address: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<(), SubscriptionError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get(id) {
                if matches!(
                    entry.state,
                    SubscriptionState::Opening | SubscriptionState::Open
                ) {
                    return Err(SubscriptionError::AlreadyOpen { id: id.to_string() });
                }
            }
            entries.insert(
                id.to_string(),
                Entry {
                    generation,
                    state: SubscriptionState::Opening,
                    handler: handler.clone(),
                    shutdown: None,
                    task: None,
                    close_notified: Arc::new(AtomicBool::new(false)),
                },
            );
        }
        debug!(id, address, "opening subscription");

        let channel = match self.transport.connect(address).await {
            Ok(channel) => channel,
            Err(e) => {
                emit_subscription_error(id, &e);
                remove_if_current(&self.entries, id, generation).await;
                return Err(e.into());
            }
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let cancelled = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(id).filter(|e| e.generation == generation) {
                Some(entry) => {
                    let (shutdown_tx, shutdown_rx) = oneshot::channel();
                    let pump = Pump {
                        id: id.to_string(),
                        generation,
                        channel,
                        handler,
                        entries: self.entries.clone(),
                        close_notified: entry.close_notified.clone(),
                    };
                    let span = subscription_span(id, address);
                    entry.state = SubscriptionState::Open;
                    entry.shutdown = Some(shutdown_tx);
                    entry.task = Some(tokio::spawn(
                        pump.run(shutdown_rx, ready_tx).instrument(span),
                    ));
                    None
                }
                None => Some(channel),
            }
        };

        if let Some(mut channel) = cancelled {
            debug!(id, "subscription closed while connecting");
            if let Err(e) = channel.close().await {
                debug!(id, error = %e, "close after cancelled open failed");
            }
            return Ok(());
        }

        let _ = ready_rx.await;
        emit_subscription_opened(id, address);
        Ok(())
    }

    /// Close a subscription. Closing an unknown or already closing id is a
    /// no-op. Teardown is forced after the close timeout.
    pub async fn close(&self, id: &str) {
        let (generation, shutdown, task, handler, close_notified) = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(id) else {
                return;
            };
            if entry.state == SubscriptionState::Closing {
                return;
            }
            entry.state = SubscriptionState::Closing;
            (
                entry.generation,
                entry.shutdown.take(),
                entry.task.take(),
                entry.handler.clone(),
                entry.close_notified.clone(),
            )
        };

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        if let Some(mut task) = task {
            if tokio::time::timeout(self.close_timeout, &mut task)
                .await
                .is_err()
            {
                warn!(
                    id,
                    timeout_ms = self.close_timeout.as_millis() as u64,
                    "subscription did not confirm close, aborting"
                );
                task.abort();
                if !close_notified.swap(true, Ordering::SeqCst) {
                    handler.on_close(id).await;
                }
            }
        }

        remove_if_current(&self.entries, id, generation).await;
    }

    /// Close every subscription.
    pub async fn close_all(&self) {
        let ids = self.ids().await;
        futures::future::join_all(ids.iter().map(|id| self.close(id))).await;
    }
}

async fn remove_if_current(entries: &Entries, id: &str, generation: u64) {
    let mut entries = entries.write().await;
    if entries.get(id).is_some_and(|e| e.generation == generation) {
        entries.remove(id);
    }
}

/// Per-subscription delivery loop.
struct Pump {
    id: String,
    generation: u64,
    channel: Box<dyn LiveChannel>,
    handler: Arc<dyn SubscriptionHandler>,
    entries: Entries,
    close_notified: Arc<AtomicBool>,
}

impl Pump {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>, ready: oneshot::Sender<()>) {
        self.handler.on_open(&self.id).await;
        let _ = ready.send(());

        let mut messages: u64 = 0;
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    if let Err(e) = self.channel.close().await {
                        debug!(id = %self.id, error = %e, "channel close failed");
                    }
                    break;
                }
                next = self.channel.next_message() => match next {
                    Some(Ok(raw)) => {
                        messages += 1;
                        self.handler.on_message(&self.id, &raw).await;
                    }
                    Some(Err(e)) => {
                        self.set_state(SubscriptionState::Error).await;
                        emit_subscription_error(&self.id, &e);
                        self.handler.on_error(&self.id, &e).await;
                        break;
                    }
                    None => {
                        debug!(id = %self.id, "peer closed subscription");
                        break;
                    }
                },
            }
        }

        if !self.close_notified.swap(true, Ordering::SeqCst) {
            self.handler.on_close(&self.id).await;
        }
        emit_subscription_closed(&self.id, messages);

        // Closing entries are removed by `close` once it sees the task end.
        let mut entries = self.entries.write().await;
        if entries.get(&self.id).is_some_and(|e| {
            e.generation == self.generation && e.state != SubscriptionState::Closing
        }) {
            entries.remove(&self.id);
        }
    }

    async fn set_state(&mut self, state: SubscriptionState) {
        if let Some(entry) = self
            .entries
            .write()
            .await
            .get_mut(&self.id)
            .filter(|e| e.generation == self.generation)
        {
            entry.state = state;
        }
    }
}
