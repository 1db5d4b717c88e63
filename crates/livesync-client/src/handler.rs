//! The subscription handler that keeps a collection in sync.
//!
//! Every message runs through parse, identity resolution and reconciliation
//! under one async mutex. Each resulting collection is published whole
//! through a `watch` channel, so readers never see a half-applied batch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use livesync_core::{
    apply_event_with_outcome, decode_and_key, emit_message_dropped, emit_status_changed,
    ApplyOutcome, Collection, CollectionHealth, EntityKey, EntityStatus, KeyedEvent,
    ProgressWatchdog, StreamScope, METRICS,
};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::debug;

use crate::error::TransportError;
use crate::subscription::SubscriptionHandler;

/// What the view layer reads.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveView {
    pub collection: Collection,
    pub health: CollectionHealth,
    /// Last transport error per subscription id.
    pub connection_errors: BTreeMap<String, String>,
}

struct Tracker {
    collection: Collection,
    watchdog: ProgressWatchdog,
    connection_errors: BTreeMap<String, String>,
}

impl Tracker {
    fn view(&self) -> LiveView {
        LiveView {
            collection: self.collection.clone(),
            health: CollectionHealth::evaluate(&self.collection, &self.watchdog),
            connection_errors: self.connection_errors.clone(),
        }
    }

    fn apply(&mut self, events: &[KeyedEvent]) {
        let before = self.collection.clone();
        for event in events {
            let (next, outcome) = apply_event_with_outcome(&self.collection, event);
            match outcome {
                ApplyOutcome::StaleDiscarded => METRICS.inc_stale_discarded(),
                o if o.changed() => METRICS.inc_events_applied(),
                _ => {}
            }
            self.collection = next;
        }
        report_status_changes(&before, &self.collection);
        self.watchdog.observe(&self.collection, now());
    }
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

fn report_status_changes(before: &Collection, after: &Collection) {
    for entity in after.iter() {
        let previous: Option<EntityStatus> = before.get(&entity.id).map(|e| e.status);
        if previous != Some(entity.status) {
            emit_status_changed(&entity.id, previous, entity.status);
        }
    }
}

/// Reconciles every message of the subscriptions it is attached to into one
/// shared collection.
pub struct ReconcilingHandler {
    scopes: RwLock<HashMap<String, StreamScope>>,
    tracker: Mutex<Tracker>,
    publisher: watch::Sender<LiveView>,
}

impl ReconcilingHandler {
    /// Start from a seeded collection.
    pub fn new(initial: Collection, watchdog: ProgressWatchdog) -> Arc<Self> {
        let mut tracker = Tracker {
            collection: initial,
            watchdog,
            connection_errors: BTreeMap::new(),
        };
        tracker.watchdog.observe(&tracker.collection, now());
        let (publisher, _) = watch::channel(tracker.view());
        Arc::new(Self {
            scopes: RwLock::new(HashMap::new()),
            tracker: Mutex::new(tracker),
            publisher,
        })
    }

    /// Attribute events of subscription `id` to one infra module. Other
    /// subscriptions key events from the objects themselves.
    pub async fn scope(&self, id: &str, scope: StreamScope) {
        self.scopes.write().await.insert(id.to_string(), scope);
    }

    pub fn subscribe(&self) -> watch::Receiver<LiveView> {
        self.publisher.subscribe()
    }

    pub fn current(&self) -> LiveView {
        self.publisher.borrow().clone()
    }

    /// Re-evaluate the watchdog without a new message so stalled entities
    /// surface even when their stream is silent.
    pub async fn tick(&self) -> Vec<EntityKey> {
        let mut guard = self.tracker.lock().await;
        let tracker = &mut *guard;
        let timed_out = tracker.watchdog.observe(&tracker.collection, now());
        if !timed_out.is_empty() {
            self.publisher.send_replace(tracker.view());
        }
        timed_out
    }

    /// Apply events that did not come from a subscription (snapshot refreshes).
    pub async fn apply(&self, events: &[KeyedEvent]) {
        let mut tracker = self.tracker.lock().await;
        tracker.apply(events);
        self.publisher.send_replace(tracker.view());
    }

    async fn scope_of(&self, id: &str) -> StreamScope {
        self.scopes
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or(StreamScope::Objects)
    }
}

#[async_trait]
impl SubscriptionHandler for ReconcilingHandler {
    async fn on_open(&self, id: &str) {
        let mut tracker = self.tracker.lock().await;
        if tracker.connection_errors.remove(id).is_some() {
            self.publisher.send_replace(tracker.view());
        }
    }

    async fn on_message(&self, id: &str, raw: &str) {
        let scope = self.scope_of(id).await;
        let events = match decode_and_key(raw, &scope) {
            Ok(events) => events,
            Err(e) => {
                METRICS.inc_messages_dropped();
                emit_message_dropped(id, &e);
                return;
            }
        };
        if events.is_empty() {
            debug!(id, "message carried no applicable events");
            return;
        }

        let mut tracker = self.tracker.lock().await;
        tracker.apply(&events);
        self.publisher.send_replace(tracker.view());
    }

    async fn on_error(&self, id: &str, error: &TransportError) {
        let scope = self.scope_of(id).await;
        let mut tracker = self.tracker.lock().await;
        tracker
            .connection_errors
            .insert(id.to_string(), error.to_string());
        if let StreamScope::Module(key) = scope {
            let message = format!("Lost connection to provisioning logs: {error}");
            tracker.apply(&[KeyedEvent::error(key, None, message)]);
        }
        self.publisher.send_replace(tracker.view());
    }

    async fn on_close(&self, id: &str) {
        debug!(id, "subscription detached from collection");
        METRICS.flush();
    }
}
