//! Infrastructure modules: turning polled provisioning state into events.
//!
//! A module is first seen as an [`InfraRecord`] (kind, status, timestamps).
//! Its desired resource list and the current Terraform state arrive from
//! separate snapshot calls and are folded in as one whole-entity update
//! followed by child-level `ChildApplied` events for every resource the
//! state file already contains.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{EntityKey, EntitySeed, KIND_INFRA_MODULE};
use crate::identity::{children_from_entries, infra_resource_key};
use crate::reconcile::KeyedEvent;

/// Backend status of a module whose provisioning finished.
pub const STATUS_CREATED: &str = "created";
/// Backend status of a module that was torn down.
pub const STATUS_DESTROYED: &str = "destroyed";

/// One infrastructure module as listed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfraRecord {
    pub id: u64,
    #[serde(default)]
    pub project_id: u64,
    pub kind: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InfraRecord {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.id.to_string())
    }

    pub fn is_created(&self) -> bool {
        self.status == STATUS_CREATED
    }

    /// Version used for stale-update checks: last update time in millis.
    pub fn version(&self) -> u64 {
        u64::try_from(self.updated_at.timestamp_millis()).unwrap_or(0)
    }

    fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Terraform state `mode` of data sources.
const MODE_DATA: &str = "data";

/// One resource of a Terraform state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(default)]
    pub mode: String,
}

/// The parts of a Terraform state file the tracker reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerraformState {
    #[serde(default)]
    pub resources: Vec<StateResource>,
}

impl TerraformState {
    /// Addresses of the managed resources already present in the state.
    /// Data sources are read, never provisioned, so they are skipped.
    pub fn addresses(&self) -> Vec<String> {
        self.resources
            .iter()
            .filter(|r| r.mode != MODE_DATA)
            .map(|r| {
                infra_resource_key(&r.resource_type, &r.name)
                    .as_str()
                    .to_string()
            })
            .collect()
    }
}

/// Keep records whose kind is selected. An empty selection keeps everything.
pub fn filter_by_kinds(records: Vec<InfraRecord>, kinds: &[String]) -> Vec<InfraRecord> {
    if kinds.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|r| kinds.iter().any(|k| k == &r.kind))
        .collect()
}

/// Keep only the newest record of each kind, ordered by first appearance
/// of the kind.
pub fn latest_per_kind(records: Vec<InfraRecord>) -> Vec<InfraRecord> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, InfraRecord> = HashMap::new();

    for record in records {
        match latest.get(&record.kind) {
            None => {
                order.push(record.kind.clone());
                latest.insert(record.kind.clone(), record);
            }
            Some(saved) if record.created_at > saved.created_at => {
                latest.insert(record.kind.clone(), record);
            }
            Some(_) => {}
        }
    }

    order
        .into_iter()
        .filter_map(|kind| latest.remove(&kind))
        .collect()
}

/// ADD for a module whose resources are not known yet.
pub fn module_init_event(record: &InfraRecord) -> KeyedEvent {
    let seed = EntitySeed::new(KIND_INFRA_MODULE, record.payload())
        .with_version(record.version())
        .with_unknown_children()
        .destroyed(record.status == STATUS_DESTROYED);
    KeyedEvent::add(record.key(), seed)
}

/// Events that bring a module up to date with its desired resource list and
/// current state.
pub fn module_events(
    record: &InfraRecord,
    desired: &[Value],
    current: &TerraformState,
) -> Vec<KeyedEvent> {
    let seed = EntitySeed::new(KIND_INFRA_MODULE, record.payload())
        .with_version(record.version())
        .with_children(children_from_entries(desired))
        .destroyed(record.status == STATUS_DESTROYED);

    let key = record.key();
    let mut events = vec![KeyedEvent::update(key.clone(), seed)];
    events.extend(
        current
            .addresses()
            .into_iter()
            .map(|address| KeyedEvent::child_applied(key.clone(), address)),
    );
    events
}
