//! In-memory fakes for the transport and snapshot traits (testing only).
//!
//! [`MemoryTransport`] hands out channels whose far end is a [`MemoryPeer`]
//! held by the test. [`MemorySnapshotSource`] serves canned snapshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use livesync_core::{InfraRecord, TerraformState};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{SnapshotError, TransportError};
use crate::snapshot::{SnapshotFilter, SnapshotSource};
use crate::transport::{LiveChannel, Transport};

// ---------------------------------------------------------------------------
// MemoryTransport
// ---------------------------------------------------------------------------

enum Frame {
    Text(String),
    Fail(String),
    Close,
}

/// Far end of an in-memory channel.
#[derive(Clone)]
pub struct MemoryPeer {
    tx: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
    stall_close: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Deliver a text message to the subscriber.
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.tx.send(Frame::Text(text.into()));
    }

    /// Fail the channel with a transport error.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Frame::Fail(reason.into()));
    }

    /// Close the channel from the peer side.
    pub fn close(&self) {
        let _ = self.tx.send(Frame::Close);
    }

    /// Never confirm a close request from the subscriber.
    pub fn stall_close(&self) {
        self.stall_close.store(true, Ordering::SeqCst);
    }

    /// Whether the subscriber closed its end.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MemoryChannel {
    rx: mpsc::UnboundedReceiver<Frame>,
    closed: Arc<AtomicBool>,
    stall_close: Arc<AtomicBool>,
}

#[async_trait]
impl LiveChannel for MemoryChannel {
    async fn next_message(&mut self) -> Option<Result<String, TransportError>> {
        match self.rx.recv().await? {
            Frame::Text(text) => Some(Ok(text)),
            Frame::Fail(reason) => Some(Err(TransportError::WebSocket(
                tokio_tungstenite::tungstenite::Error::Io(std::io::Error::other(reason)),
            ))),
            Frame::Close => None,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.stall_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Transport whose channels are backed by in-process queues.
#[derive(Default)]
pub struct MemoryTransport {
    pending: Mutex<HashMap<String, MemoryChannel>>,
    connects: AtomicU32,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare a channel for `address` and return its far end. The next
    /// `connect` to that address picks it up.
    pub fn register(&self, address: &str) -> MemoryPeer {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let stall_close = Arc::new(AtomicBool::new(false));
        let channel = MemoryChannel {
            rx,
            closed: closed.clone(),
            stall_close: stall_close.clone(),
        };
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string(), channel);
        MemoryPeer {
            tx,
            closed,
            stall_close,
        }
    }

    /// Number of successful connects so far.
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, address: &str) -> Result<Box<dyn LiveChannel>, TransportError> {
        let channel = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address)
            .ok_or_else(|| TransportError::Connect {
                address: address.to_string(),
                reason: "no peer registered".to_string(),
            })?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(channel))
    }
}

// ---------------------------------------------------------------------------
// MemorySnapshotSource
// ---------------------------------------------------------------------------

/// Snapshot source serving fixed data, optionally failing the first calls.
#[derive(Debug, Default)]
pub struct MemorySnapshotSource {
    pub records: Vec<Value>,
    pub infras: Vec<InfraRecord>,
    pub desired: HashMap<u64, Vec<Value>>,
    pub current: HashMap<u64, TerraformState>,
    failures_left: AtomicU32,
    calls: AtomicU32,
}

impl MemorySnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with a 503.
    pub fn failing_first(self, n: u32) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn tick(&self, what: &str) -> Result<(), SnapshotError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SnapshotError::Status {
                url: format!("memory://{what}"),
                status: 503,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotSource for MemorySnapshotSource {
    async fn fetch_snapshot(&self, _filter: &SnapshotFilter) -> Result<Vec<Value>, SnapshotError> {
        self.tick("releases")?;
        Ok(self.records.clone())
    }

    async fn fetch_infras(&self, _project_id: u64) -> Result<Vec<InfraRecord>, SnapshotError> {
        self.tick("infras")?;
        Ok(self.infras.clone())
    }

    async fn fetch_desired(
        &self,
        _project_id: u64,
        infra_id: u64,
    ) -> Result<Vec<Value>, SnapshotError> {
        self.tick("desired")?;
        Ok(self.desired.get(&infra_id).cloned().unwrap_or_default())
    }

    async fn fetch_current(
        &self,
        _project_id: u64,
        infra_id: u64,
    ) -> Result<TerraformState, SnapshotError> {
        self.tick("current")?;
        Ok(self.current.get(&infra_id).cloned().unwrap_or_default())
    }
}
