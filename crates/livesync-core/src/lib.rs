//! livesync core library
//!
//! Decodes live-channel messages, keys them to tracked entities, folds them
//! into a persistent collection and rolls up per-entity and per-collection
//! status. Nothing here performs I/O; transports and snapshot fetching live
//! in `livesync-client`.

pub mod entity;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod infra;
pub mod metrics;
pub mod obs;
pub mod reconcile;
pub mod status;
pub mod telemetry;
pub mod watchdog;

pub use entity::{
    ChildResource, EntityKey, EntitySeed, EntityStatus, ErrorState, TrackedEntity,
    KIND_CONTROLLER, KIND_INFRA_MODULE, KIND_RELEASE,
};
pub use envelope::{parse_message, EventKind, LiveEvent, INFRA_RESOURCE_KIND};
pub use error::{IdentityError, ParseError};
pub use identity::{
    infra_resource_key, key_event, resolve_child_address, resolve_key, snapshot_event,
    IdentityStrategy, StreamScope,
};
pub use infra::{
    filter_by_kinds, latest_per_kind, module_events, module_init_event, InfraRecord,
    StateResource, TerraformState,
};
pub use metrics::METRICS;
pub use obs::{
    emit_message_dropped, emit_status_changed, emit_subscription_closed,
    emit_subscription_error, emit_subscription_opened, subscription_span,
};
pub use reconcile::{
    apply_event, apply_event_with_outcome, ApplyOutcome, Change, Collection, KeyedEvent,
    Severity,
};
pub use status::{derive_status, entity_status, CollectionHealth, StatusSummary};
pub use telemetry::init_tracing;
pub use watchdog::{ProgressWatchdog, Verdict, DEFAULT_PROGRESS_LIMIT};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Decode a raw message and key every event it carries.
///
/// Parse failures reject the whole message. Events that cannot be keyed are
/// skipped with a warning and counted, so one bad object does not hide the
/// rest of a batch.
pub fn decode_and_key(raw: &str, scope: &StreamScope) -> Result<Vec<KeyedEvent>, ParseError> {
    let events = parse_message(raw)?;
    let mut keyed = Vec::with_capacity(events.len());
    for event in &events {
        match key_event(event, scope) {
            Ok(k) => keyed.push(k),
            Err(e) => {
                METRICS.inc_identity_failures();
                tracing::warn!(error = %e, event = event.kind.as_str(), "dropping unkeyable event");
            }
        }
    }
    Ok(keyed)
}
