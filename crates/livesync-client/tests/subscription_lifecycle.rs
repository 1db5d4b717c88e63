//! Subscription manager lifecycle against the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use livesync_client::fakes::MemoryTransport;
use livesync_client::{
    SubscriptionError, SubscriptionHandler, SubscriptionManager, SubscriptionState,
    TransportError,
};
use tokio::sync::{mpsc, Mutex};

/// Forwards every callback to a channel so tests can await them.
struct Probe {
    tx: mpsc::UnboundedSender<String>,
    seen: Mutex<Vec<String>>,
}

impl Probe {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                seen: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    async fn record(&self, call: String) {
        self.seen.lock().await.push(call.clone());
        let _ = self.tx.send(call);
    }
}

#[async_trait]
impl SubscriptionHandler for Probe {
    async fn on_open(&self, id: &str) {
        self.record(format!("open:{id}")).await;
    }
    async fn on_message(&self, id: &str, raw: &str) {
        self.record(format!("message:{id}:{raw}")).await;
    }
    async fn on_error(&self, id: &str, _error: &TransportError) {
        self.record(format!("error:{id}")).await;
    }
    async fn on_close(&self, id: &str) {
        self.record(format!("close:{id}")).await;
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("callback within timeout")
        .expect("probe channel open")
}

#[tokio::test]
async fn messages_arrive_in_order() {
    let transport = Arc::new(MemoryTransport::new());
    let peer = transport.register("mem://releases");
    let manager = SubscriptionManager::new(transport);
    let (probe, mut rx) = Probe::new();

    manager.open("releases", "mem://releases", probe.clone()).await.unwrap();
    assert_eq!(manager.state("releases").await, SubscriptionState::Open);
    assert_eq!(next(&mut rx).await, "open:releases");

    for i in 0..5 {
        peer.send(format!("m{i}"));
    }
    for i in 0..5 {
        assert_eq!(next(&mut rx).await, format!("message:releases:m{i}"));
    }

    manager.close("releases").await;
    assert_eq!(next(&mut rx).await, "close:releases");
    assert_eq!(manager.state("releases").await, SubscriptionState::Closed);
}

#[tokio::test]
async fn transport_error_closes_without_reconnect() {
    let transport = Arc::new(MemoryTransport::new());
    let peer = transport.register("mem://infra/4");
    let manager = SubscriptionManager::new(transport.clone());
    let (probe, mut rx) = Probe::new();

    manager.open("4", "mem://infra/4", probe).await.unwrap();
    assert_eq!(next(&mut rx).await, "open:4");

    peer.fail("connection reset");
    assert_eq!(next(&mut rx).await, "error:4");
    assert_eq!(next(&mut rx).await, "close:4");

    // The pump removes the entry after on_close returns.
    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.state("4").await != SubscriptionState::Closed {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(transport.connects(), 1);
}

#[tokio::test]
async fn reopen_after_close_uses_new_channel() {
    let transport = Arc::new(MemoryTransport::new());
    let _first = transport.register("mem://a");
    let manager = SubscriptionManager::new(transport.clone());
    let (probe, _rx) = Probe::new();

    manager.open("a", "mem://a", probe.clone()).await.unwrap();
    manager.close("a").await;

    let second = transport.register("mem://a");
    manager.open("a", "mem://a", probe.clone()).await.unwrap();
    assert_eq!(manager.state("a").await, SubscriptionState::Open);
    assert_eq!(transport.connects(), 2);

    second.send("hello");
    manager.close("a").await;
    assert!(second.is_closed());
}

#[tokio::test]
async fn open_while_open_is_rejected() {
    let transport = Arc::new(MemoryTransport::new());
    let _peer = transport.register("mem://a");
    let manager = SubscriptionManager::new(transport);
    let (probe, _rx) = Probe::new();

    manager.open("a", "mem://a", probe.clone()).await.unwrap();
    let err = manager.open("a", "mem://a", probe).await.unwrap_err();
    assert!(matches!(err, SubscriptionError::AlreadyOpen { id } if id == "a"));
}

#[tokio::test(start_paused = true)]
async fn close_is_forced_after_timeout() {
    let transport = Arc::new(MemoryTransport::new());
    let peer = transport.register("mem://stuck");
    let manager =
        SubscriptionManager::new(transport).with_close_timeout(Duration::from_millis(200));
    let (probe, _rx) = Probe::new();

    manager.open("stuck", "mem://stuck", probe.clone()).await.unwrap();
    peer.stall_close();

    manager.close("stuck").await;

    assert_eq!(manager.state("stuck").await, SubscriptionState::Closed);
    assert!(!peer.is_closed());
    let seen = probe.seen.lock().await.clone();
    assert_eq!(seen, vec!["open:stuck", "close:stuck"]);
}

#[tokio::test]
async fn close_all_closes_every_subscription() {
    let transport = Arc::new(MemoryTransport::new());
    let a = transport.register("mem://a");
    let b = transport.register("mem://b");
    let manager = SubscriptionManager::new(transport);
    let (probe, _rx) = Probe::new();

    manager.open("a", "mem://a", probe.clone()).await.unwrap();
    manager.open("b", "mem://b", probe.clone()).await.unwrap();
    assert_eq!(manager.ids().await, vec!["a", "b"]);

    manager.close_all().await;

    assert!(manager.ids().await.is_empty());
    assert!(a.is_closed());
    assert!(b.is_closed());
}
