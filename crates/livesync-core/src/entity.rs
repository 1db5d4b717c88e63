//! Tracked entities: the reconciled in-memory form of one backend object.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status;

/// Category tag for Helm releases.
pub const KIND_RELEASE: &str = "release";
/// Category tag for workload controllers (deployments, stateful sets, ...).
pub const KIND_CONTROLLER: &str = "controller";
/// Category tag for infrastructure modules under provisioning.
pub const KIND_INFRA_MODULE: &str = "infra-module";

/// Stable identity key of an entity, unique within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(key: impl Into<String>) -> Self {
        EntityKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityKey {
    fn from(s: &str) -> Self {
        EntityKey(s.to_string())
    }
}

impl From<String> for EntityKey {
    fn from(s: String) -> Self {
        EntityKey(s)
    }
}

/// Error state reported for a single child resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ErrorState {
    Clear,
    Errored { message: String },
}

impl ErrorState {
    pub fn errored(message: impl Into<String>) -> Self {
        ErrorState::Errored {
            message: message.into(),
        }
    }

    pub fn is_errored(&self) -> bool {
        matches!(self, ErrorState::Errored { .. })
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ErrorState::Errored { message } => Some(message),
            ErrorState::Clear => None,
        }
    }
}

/// One sub-resource of a tracked entity, identified by its address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildResource {
    pub address: String,
    pub provisioned: bool,
    pub error_state: Option<ErrorState>,
}

impl ChildResource {
    /// A child that is known but not yet provisioned.
    pub fn pending(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            provisioned: false,
            error_state: None,
        }
    }

    /// A child whose provisioning has completed.
    pub fn provisioned(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            provisioned: true,
            error_state: Some(ErrorState::Clear),
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_state = Some(ErrorState::errored(message));
        self
    }

    pub fn is_errored(&self) -> bool {
        self.error_state
            .as_ref()
            .is_some_and(ErrorState::is_errored)
    }
}

/// Derived roll-up status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    Pending,
    Successful,
    Error,
    Destroyed,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Pending => "pending",
            EntityStatus::Successful => "successful",
            EntityStatus::Error => "error",
            EntityStatus::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The state an ADD or UPDATE event carries for a whole entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySeed {
    pub kind: String,
    pub version: Option<u64>,
    /// `None` when the object does not describe its children yet.
    pub children: Option<Vec<ChildResource>>,
    pub destroyed: bool,
    pub payload: Value,
}

impl EntitySeed {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            version: None,
            children: Some(Vec::new()),
            destroyed: false,
            payload,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_children(mut self, children: Vec<ChildResource>) -> Self {
        self.children = Some(children);
        self
    }

    pub fn with_unknown_children(mut self) -> Self {
        self.children = None;
        self
    }

    pub fn destroyed(mut self, destroyed: bool) -> Self {
        self.destroyed = destroyed;
        self
    }
}

/// The reconciled in-memory representation of one backend-managed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub id: EntityKey,
    pub kind: String,
    pub version: u64,
    pub children: Option<Vec<ChildResource>>,
    pub global_errors: Vec<String>,
    pub status: EntityStatus,
    pub last_event_version: u64,
    pub destroyed: bool,
    /// Diagnostics for child addresses that have not been seen yet.
    pub pending_errors: BTreeMap<String, String>,
    /// Apply completions for child addresses that have not been seen yet.
    #[serde(default)]
    pub pending_applied: BTreeSet<String>,
    pub payload: Value,
}

impl TrackedEntity {
    /// Build an entity from a seed. Duplicate child addresses collapse onto
    /// the first occurrence, later entries winning.
    pub fn from_seed(id: EntityKey, seed: EntitySeed) -> Self {
        let version = seed.version.unwrap_or(0);
        let mut entity = Self {
            id,
            kind: seed.kind,
            version,
            children: seed.children.map(dedupe_children),
            global_errors: Vec::new(),
            status: EntityStatus::Pending,
            last_event_version: version,
            destroyed: seed.destroyed,
            pending_errors: BTreeMap::new(),
            pending_applied: BTreeSet::new(),
            payload: seed.payload,
        };
        entity.refresh_status();
        entity
    }

    /// An entity whose existence is known only from a diagnostic.
    pub fn placeholder(id: EntityKey, kind: impl Into<String>) -> Self {
        Self::from_seed(
            id,
            EntitySeed::new(kind, Value::Null).with_unknown_children(),
        )
    }

    pub fn child(&self, address: &str) -> Option<&ChildResource> {
        self.children
            .as_ref()
            .and_then(|children| children.iter().find(|c| c.address == address))
    }

    pub(crate) fn child_mut(&mut self, address: &str) -> Option<&mut ChildResource> {
        self.children
            .as_mut()
            .and_then(|children| children.iter_mut().find(|c| c.address == address))
    }

    /// Number of known children, or `None` when the child list is unknown.
    pub fn total_children(&self) -> Option<usize> {
        self.children.as_ref().map(Vec::len)
    }

    pub fn provisioned_children(&self) -> usize {
        self.children
            .iter()
            .flatten()
            .filter(|c| c.provisioned)
            .count()
    }

    pub fn errored_children(&self) -> usize {
        self.children
            .iter()
            .flatten()
            .filter(|c| c.is_errored())
            .count()
    }

    /// All error messages attached to this entity, children first, exact
    /// duplicates removed.
    pub fn error_messages(&self) -> Vec<String> {
        let mut messages: Vec<String> = Vec::new();
        let child_messages = self
            .children
            .iter()
            .flatten()
            .filter_map(|c| c.error_state.as_ref().and_then(ErrorState::message));
        for message in child_messages.chain(self.global_errors.iter().map(String::as_str)) {
            if !messages.iter().any(|m| m == message) {
                messages.push(message.to_string());
            }
        }
        messages
    }

    pub(crate) fn push_global_error(&mut self, message: &str) -> bool {
        if self.global_errors.iter().any(|m| m == message) {
            return false;
        }
        self.global_errors.push(message.to_string());
        true
    }

    /// Apply buffered completions and diagnostics whose child now exists.
    pub(crate) fn drain_pending(&mut self) {
        let applied = std::mem::take(&mut self.pending_applied);
        for address in applied {
            match self.child_mut(&address) {
                Some(child) => {
                    child.provisioned = true;
                    child.error_state = Some(ErrorState::Clear);
                }
                None => {
                    self.pending_applied.insert(address);
                }
            }
        }

        let pending = std::mem::take(&mut self.pending_errors);
        for (address, message) in pending {
            match self.child_mut(&address) {
                Some(child) => child.error_state = Some(ErrorState::Errored { message }),
                None => {
                    self.pending_errors.insert(address, message);
                }
            }
        }
    }

    pub(crate) fn refresh_status(&mut self) {
        self.status = status::entity_status(self);
    }
}

fn dedupe_children(children: Vec<ChildResource>) -> Vec<ChildResource> {
    let mut out: Vec<ChildResource> = Vec::with_capacity(children.len());
    for child in children {
        match out.iter_mut().find(|c| c.address == child.address) {
            Some(existing) => *existing = child,
            None => out.push(child),
        }
    }
    out
}
