//! End-to-end scenarios: raw wire messages through parsing, keying,
//! reconciliation and status roll-up.

use livesync_core::{
    apply_event, decode_and_key, derive_status, ChildResource, Collection, EntityKey,
    EntitySeed, EntityStatus, ErrorState, KeyedEvent, StreamScope, KIND_INFRA_MODULE,
};
use serde_json::{json, Value};

fn stream_message(records: &[Value]) -> String {
    let entries: Vec<Value> = records
        .iter()
        .enumerate()
        .map(|(i, r)| json!({ "ID": format!("{i}-0"), "Values": { "data": r.to_string() } }))
        .collect();
    Value::Array(entries).to_string()
}

fn diagnostic(addr: &str, message: &str) -> Value {
    let (ty, name) = addr.split_once('.').unwrap();
    json!({
        "type": "diagnostic",
        "@level": "error",
        "@message": message,
        "hook": { "resource": { "addr": addr, "resource_type": ty, "resource_name": name } }
    })
}

fn fold(collection: Collection, events: &[KeyedEvent]) -> Collection {
    events.iter().fold(collection, |c, e| apply_event(&c, e))
}

#[test]
fn add_to_empty_collection_is_successful() {
    let raw = json!({
        "event_type": "ADD",
        "Kind": "",
        "Object": { "name": "a", "namespace": "ns", "version": 1 }
    })
    .to_string();

    let events = decode_and_key(&raw, &StreamScope::Objects).unwrap();
    let c = fold(Collection::new(), &events);

    assert_eq!(c.len(), 1);
    let summary = derive_status(c.get(&"a/ns".into()).unwrap());
    assert_eq!(summary.status, EntityStatus::Successful);
    assert_eq!(summary.progress_fraction, 1.0);
}

#[test]
fn child_error_flips_status_but_not_progress() {
    let seed = EntitySeed::new(KIND_INFRA_MODULE, json!({})).with_children(vec![
        ChildResource::provisioned("aws_vpc.main"),
        ChildResource::pending("aws_instance.web"),
    ]);
    let c = apply_event(&Collection::new(), &KeyedEvent::add("a/ns", seed));
    assert_eq!(derive_status(c.get(&"a/ns".into()).unwrap()).progress_fraction, 0.5);

    let raw = stream_message(&[diagnostic("aws_instance.web", "instance quota exceeded")]);
    let events = decode_and_key(&raw, &StreamScope::Module(EntityKey::new("a/ns"))).unwrap();
    let c = fold(c, &events);

    let summary = derive_status(c.get(&"a/ns".into()).unwrap());
    assert_eq!(summary.status, EntityStatus::Error);
    assert_eq!(summary.progress_fraction, 0.5);
}

#[test]
fn diagnostic_before_add_is_buffered_then_applied() {
    let scope = StreamScope::Module(EntityKey::new("12"));
    let raw = stream_message(&[diagnostic("aws_instance.web", "AMI not found")]);
    let c = fold(Collection::new(), &decode_and_key(&raw, &scope).unwrap());

    let placeholder = c.get(&"12".into()).unwrap();
    assert!(placeholder.children.is_none());
    assert_eq!(
        placeholder.pending_errors.get("aws_instance.web").map(String::as_str),
        Some("AMI not found")
    );

    let add = json!({
        "event_type": "ADD",
        "Kind": "infra",
        "Object": {
            "id": 12,
            "resources": [
                { "resource_type": "aws_instance", "resource_name": "web", "provisioned": false },
                { "resource_type": "aws_vpc", "resource_name": "main", "provisioned": true }
            ]
        }
    })
    .to_string();
    let c = fold(c, &decode_and_key(&add, &StreamScope::Objects).unwrap());

    let entity = c.get(&"12".into()).unwrap();
    assert_eq!(
        entity.child("aws_instance.web").unwrap().error_state,
        Some(ErrorState::errored("AMI not found"))
    );
    assert!(entity.pending_errors.is_empty());
    assert_eq!(entity.status, EntityStatus::Error);
}

#[test]
fn provisioning_stream_drives_module_to_success() {
    let scope = StreamScope::Module(EntityKey::new("4"));
    let add = json!({
        "event_type": "ADD",
        "Kind": "infra",
        "Object": {
            "id": 4,
            "resources": [
                { "addr": "aws_vpc.main", "resource_type": "aws_vpc", "resource_name": "main" },
                { "addr": "aws_eks_cluster.main", "resource_type": "aws_eks_cluster", "resource_name": "main" }
            ]
        }
    })
    .to_string();
    let c = fold(Collection::new(), &decode_and_key(&add, &StreamScope::Objects).unwrap());

    let apply = |addr: &str| {
        let (ty, name) = addr.split_once('.').unwrap();
        json!({
            "type": "apply_complete",
            "hook": { "resource": { "addr": addr, "resource_type": ty, "resource_name": name } }
        })
    };
    let banner = json!({ "type": "version", "terraform": "1.5.0" });
    let raw = stream_message(&[banner, apply("aws_vpc.main"), apply("aws_eks_cluster.main")]);
    let events = decode_and_key(&raw, &scope).unwrap();
    assert_eq!(events.len(), 2);

    let summary = derive_status(fold(c, &events).get(&"4".into()).unwrap());
    assert_eq!(summary.status, EntityStatus::Successful);
    assert_eq!(summary.progress_fraction, 1.0);
}

#[test]
fn unkeyable_objects_are_dropped_without_failing() {
    let raw = json!({
        "event_type": "UPDATE",
        "Kind": "deployment",
        "Object": { "metadata": { "name": "web" } }
    })
    .to_string();
    assert!(decode_and_key(&raw, &StreamScope::Objects).unwrap().is_empty());
}

#[test]
fn malformed_message_is_rejected() {
    assert!(decode_and_key("{not json", &StreamScope::Objects).is_err());
}
