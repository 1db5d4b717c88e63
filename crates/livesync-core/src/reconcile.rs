//! The reconciler: a pure merge of one keyed event into a collection.
//!
//! Every call returns a new [`Collection`]; the input is never mutated. The
//! collection is backed by persistent maps, so the previous value stays
//! cheap to keep around for change detection.
//!
//! Merge rules:
//! - ADD on an existing key behaves like UPDATE; UPDATE on a missing key
//!   behaves like ADD.
//! - Whole-entity updates older than `last_event_version` are discarded.
//! - DELETE is idempotent. Removing an entity leaves a tombstone at the
//!   DELETE's version, or at the entity's own version when the DELETE carries
//!   none, so a late UPDATE at or below it cannot resurrect the entity.
//! - Child-level events (`ChildApplied`, `Diagnostic` with an address) skip
//!   the entity version check and are last-write-wins per address. Events
//!   for addresses outside the known child list are buffered on the entity
//!   until a whole-entity ADD/UPDATE brings that child in.

use im::OrdMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entity::{EntityKey, EntitySeed, ErrorState, TrackedEntity, KIND_INFRA_MODULE};

/// Severity of a provisioning diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn from_level(level: &str) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "error" => Severity::Error,
            "warn" | "warning" => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

/// What a keyed event does to its entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Add(EntitySeed),
    Update(EntitySeed),
    Delete {
        version: Option<u64>,
    },
    ChildApplied {
        address: String,
    },
    Diagnostic {
        address: Option<String>,
        severity: Severity,
        message: String,
    },
}

/// A reconciler input: an entity key plus the change to apply to it.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedEvent {
    pub key: EntityKey,
    pub change: Change,
}

impl KeyedEvent {
    pub fn add(key: impl Into<EntityKey>, seed: EntitySeed) -> Self {
        Self {
            key: key.into(),
            change: Change::Add(seed),
        }
    }

    pub fn update(key: impl Into<EntityKey>, seed: EntitySeed) -> Self {
        Self {
            key: key.into(),
            change: Change::Update(seed),
        }
    }

    pub fn delete(key: impl Into<EntityKey>, version: Option<u64>) -> Self {
        Self {
            key: key.into(),
            change: Change::Delete { version },
        }
    }

    pub fn child_applied(key: impl Into<EntityKey>, address: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            change: Change::ChildApplied {
                address: address.into(),
            },
        }
    }

    pub fn error(
        key: impl Into<EntityKey>,
        address: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            change: Change::Diagnostic {
                address: address.map(str::to_string),
                severity: Severity::Error,
                message: message.into(),
            },
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self.change {
            Change::Add(_) => "add",
            Change::Update(_) => "update",
            Change::Delete { .. } => "delete",
            Change::ChildApplied { .. } => "child_applied",
            Change::Diagnostic { .. } => "diagnostic",
        }
    }
}

/// What applying an event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Replaced,
    Removed,
    AlreadyAbsent,
    StaleDiscarded,
    ChildUpdated,
    ApplyBuffered,
    ErrorBuffered,
    GlobalErrorRecorded,
    DuplicateError,
    Ignored,
}

impl ApplyOutcome {
    /// Whether the collection may differ from its input.
    pub fn changed(&self) -> bool {
        !matches!(
            self,
            ApplyOutcome::StaleDiscarded
                | ApplyOutcome::DuplicateError
                | ApplyOutcome::Ignored
        )
    }
}

/// The set of tracked entities owned by one consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    entities: OrdMap<EntityKey, TrackedEntity>,
    tombstones: OrdMap<EntityKey, u64>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a sequence of events into an empty collection.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a KeyedEvent>) -> Self {
        events
            .into_iter()
            .fold(Self::new(), |collection, event| apply_event(&collection, event))
    }

    pub fn get(&self, key: &EntityKey) -> Option<&TrackedEntity> {
        self.entities.get(key)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entities.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entities in key order.
    pub fn iter(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.entities.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entities.keys()
    }

    /// Version below which UPDATEs of a deleted `key` are discarded.
    pub fn tombstone(&self, key: &EntityKey) -> Option<u64> {
        self.tombstones.get(key).copied()
    }

    /// Drop an entity and its tombstone on explicit request of the consumer.
    pub fn purge(&self, key: &EntityKey) -> Self {
        Self {
            entities: self.entities.without(key),
            tombstones: self.tombstones.without(key),
        }
    }

    fn with_entity(&self, entity: TrackedEntity) -> Self {
        let mut next = self.clone();
        next.tombstones.remove(&entity.id);
        next.entities.insert(entity.id.clone(), entity);
        next
    }
}

/// Apply one event to a collection, returning the new collection.
pub fn apply_event(collection: &Collection, event: &KeyedEvent) -> Collection {
    apply_event_with_outcome(collection, event).0
}

/// Apply one event and report what happened.
pub fn apply_event_with_outcome(
    collection: &Collection,
    event: &KeyedEvent,
) -> (Collection, ApplyOutcome) {
    let key = &event.key;
    let (next, outcome) = match &event.change {
        Change::Add(seed) => upsert(collection, key, seed, true),
        Change::Update(seed) => upsert(collection, key, seed, false),
        Change::Delete { version } => delete(collection, key, *version),
        Change::ChildApplied { address } => child_applied(collection, key, address),
        Change::Diagnostic {
            address,
            severity,
            message,
        } => diagnostic(collection, key, address.as_deref(), *severity, message),
    };
    debug!(key = %key, event = event.label(), outcome = ?outcome, "event reconciled");
    (next, outcome)
}

fn upsert(
    collection: &Collection,
    key: &EntityKey,
    seed: &EntitySeed,
    is_add: bool,
) -> (Collection, ApplyOutcome) {
    let incoming = seed.version.unwrap_or(0);

    let Some(existing) = collection.get(key) else {
        if !is_add {
            if let Some(deleted_at) = collection.tombstone(key) {
                if incoming <= deleted_at {
                    return (collection.clone(), ApplyOutcome::StaleDiscarded);
                }
            }
        }
        let entity = TrackedEntity::from_seed(key.clone(), seed.clone());
        return (collection.with_entity(entity), ApplyOutcome::Inserted);
    };

    if incoming < existing.last_event_version {
        return (collection.clone(), ApplyOutcome::StaleDiscarded);
    }

    let mut entity = TrackedEntity::from_seed(key.clone(), seed.clone());
    for message in &existing.global_errors {
        entity.push_global_error(message);
    }
    entity.pending_errors = existing.pending_errors.clone();
    entity.pending_applied = existing.pending_applied.clone();
    entity.drain_pending();
    entity.refresh_status();
    (collection.with_entity(entity), ApplyOutcome::Replaced)
}

fn delete(
    collection: &Collection,
    key: &EntityKey,
    version: Option<u64>,
) -> (Collection, ApplyOutcome) {
    let mut next = collection.clone();
    let removed = next.entities.remove(key);
    let deleted_at = version.or(removed.as_ref().map(|e| e.last_event_version));
    if let Some(version) = deleted_at {
        let deleted_at = next.tombstones.get(key).map_or(version, |v| (*v).max(version));
        next.tombstones.insert(key.clone(), deleted_at);
    }
    match removed {
        Some(_) => (next, ApplyOutcome::Removed),
        None => (next, ApplyOutcome::AlreadyAbsent),
    }
}

/// Entity a child-level event targets, created as a placeholder when absent.
/// Tombstoned keys are left alone.
fn child_target(collection: &Collection, key: &EntityKey) -> Option<TrackedEntity> {
    match collection.get(key) {
        Some(entity) => Some(entity.clone()),
        None if collection.tombstone(key).is_some() => None,
        None => Some(TrackedEntity::placeholder(key.clone(), KIND_INFRA_MODULE)),
    }
}

fn child_applied(
    collection: &Collection,
    key: &EntityKey,
    address: &str,
) -> (Collection, ApplyOutcome) {
    let Some(mut entity) = child_target(collection, key) else {
        return (collection.clone(), ApplyOutcome::Ignored);
    };

    let outcome = match entity.child_mut(address) {
        Some(child) => {
            child.provisioned = true;
            child.error_state = Some(ErrorState::Clear);
            ApplyOutcome::ChildUpdated
        }
        None => {
            debug!(key = %key, address, "child not known yet, buffering apply event");
            entity.pending_applied.insert(address.to_string());
            ApplyOutcome::ApplyBuffered
        }
    };

    entity.pending_errors.remove(address);
    entity.refresh_status();
    (collection.with_entity(entity), outcome)
}

fn diagnostic(
    collection: &Collection,
    key: &EntityKey,
    address: Option<&str>,
    severity: Severity,
    message: &str,
) -> (Collection, ApplyOutcome) {
    if severity != Severity::Error {
        debug!(key = %key, ?severity, diagnostic = message, "non-error diagnostic ignored");
        return (collection.clone(), ApplyOutcome::Ignored);
    }
    let Some(mut entity) = child_target(collection, key) else {
        return (collection.clone(), ApplyOutcome::Ignored);
    };

    let outcome = match address {
        None => {
            if entity.push_global_error(message) {
                ApplyOutcome::GlobalErrorRecorded
            } else {
                return (collection.clone(), ApplyOutcome::DuplicateError);
            }
        }
        Some(address) => match entity.child_mut(address) {
            Some(child) => {
                child.error_state = Some(ErrorState::errored(message));
                ApplyOutcome::ChildUpdated
            }
            None => {
                entity.pending_applied.remove(address);
                entity
                    .pending_errors
                    .insert(address.to_string(), message.to_string());
                ApplyOutcome::ErrorBuffered
            }
        },
    };

    entity.refresh_status();
    (collection.with_entity(entity), outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ChildResource, EntityStatus, KIND_RELEASE};
    use crate::status::derive_status;
    use serde_json::json;

    fn release(version: u64) -> EntitySeed {
        EntitySeed::new(KIND_RELEASE, json!({ "version": version })).with_version(version)
    }

    fn module(children: Vec<ChildResource>) -> EntitySeed {
        EntitySeed::new(KIND_INFRA_MODULE, json!({})).with_children(children)
    }

    #[test]
    fn add_inserts_new_entity() {
        let c = apply_event(&Collection::new(), &KeyedEvent::add("a/ns", release(1)));
        let entity = c.get(&"a/ns".into()).unwrap();
        assert_eq!(entity.last_event_version, 1);
        assert_eq!(entity.status, EntityStatus::Successful);
    }

    #[test]
    fn duplicate_add_does_not_duplicate() {
        let c = Collection::from_events(&[
            KeyedEvent::add("a/ns", release(1)),
            KeyedEvent::add("a/ns", release(2)),
        ]);
        assert_eq!(c.len(), 1);
        assert_eq!(c.get(&"a/ns".into()).unwrap().version, 2);
    }

    #[test]
    fn stale_update_is_discarded() {
        let c = apply_event(&Collection::new(), &KeyedEvent::add("a/ns", release(5)));
        let (next, outcome) = apply_event_with_outcome(&c, &KeyedEvent::update("a/ns", release(3)));
        assert_eq!(outcome, ApplyOutcome::StaleDiscarded);
        assert_eq!(next, c);
    }

    #[test]
    fn equal_version_update_is_applied() {
        let c = apply_event(&Collection::new(), &KeyedEvent::add("a/ns", release(5)));
        let (_, outcome) = apply_event_with_outcome(&c, &KeyedEvent::update("a/ns", release(5)));
        assert_eq!(outcome, ApplyOutcome::Replaced);
    }

    #[test]
    fn update_for_missing_key_inserts() {
        let (c, outcome) =
            apply_event_with_outcome(&Collection::new(), &KeyedEvent::update("a/ns", release(2)));
        assert_eq!(outcome, ApplyOutcome::Inserted);
        assert!(c.contains(&"a/ns".into()));
    }

    #[test]
    fn delete_wins_over_late_lower_update() {
        let c = Collection::from_events(&[
            KeyedEvent::add("a/ns", release(3)),
            KeyedEvent::delete("a/ns", Some(4)),
        ]);
        let (next, outcome) = apply_event_with_outcome(&c, &KeyedEvent::update("a/ns", release(4)));
        assert_eq!(outcome, ApplyOutcome::StaleDiscarded);
        assert!(next.is_empty());

        let revived = apply_event(&c, &KeyedEvent::update("a/ns", release(5)));
        assert!(revived.contains(&"a/ns".into()));
        assert_eq!(revived.tombstone(&"a/ns".into()), None);
    }

    #[test]
    fn add_after_versioned_delete_recreates() {
        let c = Collection::from_events(&[
            KeyedEvent::add("a/ns", release(3)),
            KeyedEvent::delete("a/ns", Some(3)),
            KeyedEvent::add("a/ns", release(1)),
        ]);
        assert_eq!(c.get(&"a/ns".into()).unwrap().version, 1);
    }

    #[test]
    fn unversioned_delete_blocks_older_update() {
        let c = Collection::from_events(&[
            KeyedEvent::add("a/ns", release(5)),
            KeyedEvent::delete("a/ns", None),
        ]);
        assert_eq!(c.tombstone(&"a/ns".into()), Some(5));

        let (next, outcome) = apply_event_with_outcome(&c, &KeyedEvent::update("a/ns", release(3)));
        assert_eq!(outcome, ApplyOutcome::StaleDiscarded);
        assert!(next.is_empty());

        let revived = apply_event(&c, &KeyedEvent::update("a/ns", release(6)));
        assert_eq!(revived.get(&"a/ns".into()).unwrap().version, 6);
    }

    #[test]
    fn delete_of_missing_key_is_noop() {
        let (c, outcome) =
            apply_event_with_outcome(&Collection::new(), &KeyedEvent::delete("a/ns", None));
        assert_eq!(outcome, ApplyOutcome::AlreadyAbsent);
        assert_eq!(c, Collection::new());
    }

    #[test]
    fn child_applied_updates_in_place() {
        let c = Collection::from_events(&[
            KeyedEvent::add("7", module(vec![
                ChildResource::pending("aws_vpc.main"),
                ChildResource::pending("aws_subnet.a"),
            ])),
            KeyedEvent::child_applied("7", "aws_vpc.main"),
            KeyedEvent::child_applied("7", "aws_vpc.main"),
        ]);
        let entity = c.get(&"7".into()).unwrap();
        assert_eq!(entity.total_children(), Some(2));
        assert_eq!(entity.provisioned_children(), 1);
        assert_eq!(entity.status, EntityStatus::Pending);
    }

    #[test]
    fn child_applied_clears_previous_error() {
        let c = Collection::from_events(&[
            KeyedEvent::add("7", module(vec![ChildResource::pending("aws_vpc.main")])),
            KeyedEvent::error("7", Some("aws_vpc.main"), "throttled"),
            KeyedEvent::child_applied("7", "aws_vpc.main"),
        ]);
        assert_eq!(c.get(&"7".into()).unwrap().status, EntityStatus::Successful);
    }

    #[test]
    fn child_applied_before_child_list_is_buffered() {
        let (c, outcome) = apply_event_with_outcome(
            &Collection::new(),
            &KeyedEvent::child_applied("7", "aws_vpc.main"),
        );
        assert_eq!(outcome, ApplyOutcome::ApplyBuffered);
        let placeholder = c.get(&"7".into()).unwrap();
        assert_eq!(placeholder.total_children(), None);
        assert!(placeholder.pending_applied.contains("aws_vpc.main"));
    }

    #[test]
    fn buffered_apply_lands_when_children_arrive() {
        let c = Collection::from_events(&[
            KeyedEvent::error("4", Some("aws_eks_cluster.main"), "quota"),
            KeyedEvent::child_applied("4", "aws_vpc.main"),
            KeyedEvent::add("4", module(vec![ChildResource::pending("aws_vpc.main")])),
        ]);
        let entity = c.get(&"4".into()).unwrap();
        assert!(entity.child("aws_vpc.main").unwrap().provisioned);
        assert!(entity.pending_applied.is_empty());
        assert_eq!(entity.status, EntityStatus::Successful);
        assert_eq!(derive_status(entity).progress_fraction, 1.0);
        // The eks error stays buffered until that child shows up.
        assert!(entity.pending_errors.contains_key("aws_eks_cluster.main"));
    }

    #[test]
    fn child_applied_outside_child_list_does_not_inflate_progress() {
        let c = Collection::from_events(&[
            KeyedEvent::add("7", module(vec![
                ChildResource::pending("aws_vpc.main"),
                ChildResource::pending("aws_instance.web"),
            ])),
            KeyedEvent::child_applied("7", "aws_vpc.main"),
            KeyedEvent::child_applied("7", "aws_ami.ubuntu"),
        ]);
        let entity = c.get(&"7".into()).unwrap();
        assert_eq!(entity.total_children(), Some(2));
        assert_eq!(derive_status(entity).progress_fraction, 0.5);
        assert!(entity.pending_applied.contains("aws_ami.ubuntu"));
    }

    #[test]
    fn later_diagnostic_replaces_buffered_apply() {
        let c = Collection::from_events(&[
            KeyedEvent::child_applied("7", "aws_vpc.main"),
            KeyedEvent::error("7", Some("aws_vpc.main"), "throttled"),
            KeyedEvent::update("7", module(vec![ChildResource::pending("aws_vpc.main")])),
        ]);
        let child = c.get(&"7".into()).unwrap().child("aws_vpc.main").unwrap().clone();
        assert!(!child.provisioned);
        assert!(child.is_errored());
    }

    #[test]
    fn global_errors_are_exactly_deduplicated() {
        let c = Collection::from_events(&[
            KeyedEvent::add("7", module(vec![])),
            KeyedEvent::error("7", None, "quota exceeded"),
        ]);
        let (_, outcome) =
            apply_event_with_outcome(&c, &KeyedEvent::error("7", None, "quota exceeded"));
        assert_eq!(outcome, ApplyOutcome::DuplicateError);

        let c = apply_event(&c, &KeyedEvent::error("7", None, "quota exceeded for vCPU"));
        assert_eq!(c.get(&"7".into()).unwrap().global_errors.len(), 2);
    }

    #[test]
    fn global_errors_survive_whole_entity_update() {
        let c = Collection::from_events(&[
            KeyedEvent::add("7", module(vec![])),
            KeyedEvent::error("7", None, "quota exceeded"),
            KeyedEvent::update("7", module(vec![ChildResource::pending("a.b")])),
        ]);
        let entity = c.get(&"7".into()).unwrap();
        assert_eq!(entity.global_errors, vec!["quota exceeded".to_string()]);
        assert_eq!(entity.status, EntityStatus::Error);
    }

    #[test]
    fn warning_diagnostics_are_ignored() {
        let event = KeyedEvent {
            key: "7".into(),
            change: Change::Diagnostic {
                address: None,
                severity: Severity::Warning,
                message: "deprecated".to_string(),
            },
        };
        let (c, outcome) = apply_event_with_outcome(&Collection::new(), &event);
        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert!(c.is_empty());
    }

    #[test]
    fn diagnostic_for_missing_entity_creates_placeholder() {
        let c = apply_event(&Collection::new(), &KeyedEvent::error("7", None, "boom"));
        let entity = c.get(&"7".into()).unwrap();
        assert_eq!(entity.kind, KIND_INFRA_MODULE);
        assert_eq!(entity.total_children(), None);
        assert_eq!(entity.status, EntityStatus::Error);
    }

    #[test]
    fn input_collection_is_untouched() {
        let before = apply_event(&Collection::new(), &KeyedEvent::add("a/ns", release(1)));
        let snapshot = before.clone();
        let _after = apply_event(&before, &KeyedEvent::delete("a/ns", None));
        assert_eq!(before, snapshot);
    }

    #[test]
    fn purge_removes_entity_and_tombstone() {
        let c = Collection::from_events(&[
            KeyedEvent::add("a/ns", release(1)),
            KeyedEvent::delete("b/ns", Some(2)),
        ]);
        let c = c.purge(&"a/ns".into()).purge(&"b/ns".into());
        assert_eq!(c, Collection::new());
    }

    #[test]
    fn severity_parses_levels() {
        assert_eq!(Severity::from_level("ERROR"), Severity::Error);
        assert_eq!(Severity::from_level("warn"), Severity::Warning);
        assert_eq!(Severity::from_level("info"), Severity::Info);
    }
}
