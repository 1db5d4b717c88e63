//! Identity resolution: turning decoded events into keyed reconciler inputs.
//!
//! Keys are derived purely from the object kind and payload:
//!
//! | strategy        | key                                   |
//! |-----------------|---------------------------------------|
//! | release         | `name/namespace`                      |
//! | controller      | `metadata.uid`                        |
//! | infra module    | `id`                                  |
//! | infra resource  | `resource_type.resource_name` (or `addr`) |

use serde_json::Value;

use crate::entity::{
    ChildResource, EntityKey, EntitySeed, ErrorState, KIND_CONTROLLER, KIND_INFRA_MODULE,
    KIND_RELEASE,
};
use crate::envelope::{EventKind, LiveEvent, INFRA_RESOURCE_KIND};
use crate::error::IdentityError;
use crate::reconcile::{Change, KeyedEvent, Severity};

const CONTROLLER_KINDS: &[&str] = &[
    "deployment",
    "statefulset",
    "daemonset",
    "replicaset",
    "job",
    "cronjob",
];

const INFRA_MODULE_KINDS: &[&str] = &["infra", "infra_module", "infra-module"];

/// Category tag given to entities keyed by the infra resource strategy.
pub const KIND_INFRA_RESOURCE: &str = "infra-resource";

/// How an object of a given kind is keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityStrategy {
    Release,
    Controller,
    InfraModule,
    InfraResource,
}

impl IdentityStrategy {
    /// Pick the strategy for a wire object kind. Unrecognised kinds are
    /// treated as release-style objects.
    pub fn for_object_kind(object_kind: &str) -> Self {
        let kind = object_kind.to_ascii_lowercase();
        if kind == INFRA_RESOURCE_KIND {
            IdentityStrategy::InfraResource
        } else if INFRA_MODULE_KINDS.contains(&kind.as_str()) {
            IdentityStrategy::InfraModule
        } else if CONTROLLER_KINDS.contains(&kind.as_str()) {
            IdentityStrategy::Controller
        } else {
            IdentityStrategy::Release
        }
    }

    /// Category tag of entities keyed with this strategy.
    pub fn entity_kind(&self) -> &'static str {
        match self {
            IdentityStrategy::Release => KIND_RELEASE,
            IdentityStrategy::Controller => KIND_CONTROLLER,
            IdentityStrategy::InfraModule => KIND_INFRA_MODULE,
            IdentityStrategy::InfraResource => KIND_INFRA_RESOURCE,
        }
    }
}

/// Which entity the events of a stream belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamScope {
    /// Each object names itself (Kubernetes object streams).
    Objects,
    /// Every event belongs to one infra module (provisioning log streams).
    Module(EntityKey),
}

/// Compute the identity key of an object.
pub fn resolve_key(object_kind: &str, payload: &Value) -> Result<EntityKey, IdentityError> {
    let strategy = IdentityStrategy::for_object_kind(object_kind);
    let missing = |field| IdentityError::MissingField {
        object_kind: kind_label(object_kind),
        field,
    };

    match strategy {
        IdentityStrategy::Release => {
            let name = str_field(payload, &["name"])
                .or_else(|| str_field(payload, &["metadata", "name"]))
                .ok_or_else(|| missing("name"))?;
            let namespace = str_field(payload, &["namespace"])
                .or_else(|| str_field(payload, &["metadata", "namespace"]))
                .ok_or_else(|| missing("namespace"))?;
            non_empty(object_kind, "name", name)?;
            Ok(EntityKey::new(format!("{name}/{namespace}")))
        }
        IdentityStrategy::Controller => {
            let uid = str_field(payload, &["metadata", "uid"])
                .ok_or_else(|| missing("metadata.uid"))?;
            non_empty(object_kind, "metadata.uid", uid)?;
            Ok(EntityKey::new(uid))
        }
        IdentityStrategy::InfraModule => match payload.get("id") {
            Some(Value::Number(n)) => Ok(EntityKey::new(n.to_string())),
            Some(Value::String(s)) if !s.is_empty() => Ok(EntityKey::new(s.as_str())),
            _ => Err(missing("id")),
        },
        IdentityStrategy::InfraResource => {
            let typed = str_field(payload, &["resource_type"])
                .zip(str_field(payload, &["resource_name"]))
                .filter(|(ty, name)| !ty.is_empty() && !name.is_empty());
            if let Some((ty, name)) = typed {
                return Ok(infra_resource_key(ty, name));
            }
            let addr = str_field(payload, &["addr"]).ok_or_else(|| missing("addr"))?;
            non_empty(object_kind, "addr", addr)?;
            Ok(EntityKey::new(addr))
        }
    }
}

/// Provider-assigned address of an infrastructure resource.
pub fn infra_resource_key(resource_type: &str, resource_name: &str) -> EntityKey {
    EntityKey::new(format!("{resource_type}.{resource_name}"))
}

/// Resolve the child address a provisioning record refers to.
///
/// Returns `None` when the record is not attributable to a resource (no
/// `hook.resource`, or an empty address).
pub fn resolve_child_address(record: &Value) -> Option<String> {
    let resource = record.get("hook").and_then(|h| h.get("resource"))?;
    resolve_key(INFRA_RESOURCE_KIND, resource)
        .ok()
        .map(|key| key.as_str().to_string())
}

/// Version carried by an object: the Helm revision when present, otherwise
/// a numeric `metadata.resourceVersion`.
pub fn object_version(payload: &Value) -> Option<u64> {
    if let Some(version) = payload.get("version").and_then(Value::as_u64) {
        return Some(version);
    }
    match payload.get("metadata").and_then(|m| m.get("resourceVersion")) {
        Some(Value::String(s)) => s.parse().ok(),
        Some(Value::Number(n)) => n.as_u64(),
        _ => None,
    }
}

/// Build the seed an ADD or UPDATE carries for a whole entity.
pub fn seed_from_object(object_kind: &str, payload: &Value) -> EntitySeed {
    let strategy = IdentityStrategy::for_object_kind(object_kind);
    let mut seed = EntitySeed::new(strategy.entity_kind(), payload.clone());
    seed.version = object_version(payload);
    seed.destroyed = payload.get("status").and_then(Value::as_str) == Some("destroyed");
    seed.children = match payload.get("resources").and_then(Value::as_array) {
        Some(entries) => Some(children_from_entries(entries)),
        None if strategy == IdentityStrategy::InfraModule => None,
        None => Some(Vec::new()),
    };
    seed
}

/// Decode a list of resource descriptions into children, skipping entries
/// that cannot be keyed.
pub fn children_from_entries(entries: &[Value]) -> Vec<ChildResource> {
    entries
        .iter()
        .filter_map(|entry| match resolve_key(INFRA_RESOURCE_KIND, entry) {
            Ok(address) => Some(ChildResource {
                address: address.as_str().to_string(),
                provisioned: entry
                    .get("provisioned")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                error_state: entry.get("errored").map(error_state_from_value),
            }),
            Err(e) => {
                tracing::warn!(error = %e, "skipping resource that cannot be keyed");
                None
            }
        })
        .collect()
}

fn error_state_from_value(value: &Value) -> ErrorState {
    let errored = value
        .get("errored_out")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if errored {
        let message = value
            .get("error_context")
            .and_then(Value::as_str)
            .unwrap_or_default();
        ErrorState::errored(message)
    } else {
        ErrorState::Clear
    }
}

/// Turn a decoded event into a keyed reconciler input.
pub fn key_event(event: &LiveEvent, scope: &StreamScope) -> Result<KeyedEvent, IdentityError> {
    match event.kind {
        EventKind::Add | EventKind::Update | EventKind::Delete => {
            let key = resolve_key(&event.object_kind, &event.payload)?;
            let change = match event.kind {
                EventKind::Add => Change::Add(seed_from_object(&event.object_kind, &event.payload)),
                EventKind::Update => {
                    Change::Update(seed_from_object(&event.object_kind, &event.payload))
                }
                _ => Change::Delete {
                    version: object_version(&event.payload),
                },
            };
            Ok(KeyedEvent { key, change })
        }
        EventKind::ApplyComplete => {
            let key = module_key(scope, "APPLY_COMPLETE")?;
            let address = resolve_child_address(&event.payload).ok_or_else(|| {
                IdentityError::MissingField {
                    object_kind: kind_label(&event.object_kind),
                    field: "hook.resource.addr",
                }
            })?;
            Ok(KeyedEvent {
                key,
                change: Change::ChildApplied { address },
            })
        }
        EventKind::Diagnostic => {
            let key = module_key(scope, "DIAGNOSTIC")?;
            let severity = event
                .payload
                .get("@level")
                .and_then(Value::as_str)
                .map(Severity::from_level)
                .unwrap_or(Severity::Error);
            let message = event
                .payload
                .get("@message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(KeyedEvent {
                key,
                change: Change::Diagnostic {
                    address: resolve_child_address(&event.payload),
                    severity,
                    message,
                },
            })
        }
    }
}

/// Key a record from a polled snapshot as an ADD of the whole entity.
pub fn snapshot_event(object_kind: &str, record: &Value) -> Result<KeyedEvent, IdentityError> {
    let key = resolve_key(object_kind, record)?;
    Ok(KeyedEvent {
        key,
        change: Change::Add(seed_from_object(object_kind, record)),
    })
}

fn module_key(scope: &StreamScope, event: &'static str) -> Result<EntityKey, IdentityError> {
    match scope {
        StreamScope::Module(key) => Ok(key.clone()),
        StreamScope::Objects => Err(IdentityError::UnscopedStreamEvent { event }),
    }
}

fn str_field<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, segment| v.get(*segment))
        .and_then(Value::as_str)
}

fn non_empty(object_kind: &str, field: &'static str, value: &str) -> Result<(), IdentityError> {
    if value.is_empty() {
        return Err(IdentityError::EmptyField {
            object_kind: kind_label(object_kind),
            field,
        });
    }
    Ok(())
}

fn kind_label(object_kind: &str) -> String {
    if object_kind.is_empty() {
        KIND_RELEASE.to_string()
    } else {
        object_kind.to_string()
    }
}
