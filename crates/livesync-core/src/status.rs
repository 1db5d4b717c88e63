//! Status roll-up for tracked entities and whole collections.

use serde::{Deserialize, Serialize};

use crate::entity::{EntityStatus, TrackedEntity};
use crate::reconcile::Collection;
use crate::watchdog::ProgressWatchdog;

/// Description surfaced when an entity made no progress within the watchdog limit.
pub const TIMED_OUT_DESCRIPTION: &str =
    "We weren't able to provision after 45 minutes, please try again.";

/// Display status plus progress of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub status: EntityStatus,
    /// Provisioned share of children, always within `[0.0, 1.0]`.
    pub progress_fraction: f64,
}

/// Status of an entity from its children, global errors and lifecycle flag.
///
/// Errors take precedence over everything, then backend-reported
/// destruction; an entity whose child list is unknown stays pending.
pub fn entity_status(entity: &TrackedEntity) -> EntityStatus {
    if entity.errored_children() > 0 || !entity.global_errors.is_empty() {
        return EntityStatus::Error;
    }
    if entity.destroyed {
        return EntityStatus::Destroyed;
    }
    match &entity.children {
        Some(children) if children.iter().all(|c| c.provisioned) => EntityStatus::Successful,
        _ => EntityStatus::Pending,
    }
}

/// Derive the roll-up status and progress fraction of an entity.
pub fn derive_status(entity: &TrackedEntity) -> StatusSummary {
    let progress_fraction = match entity.total_children() {
        None => 0.0,
        Some(0) => 1.0,
        Some(total) => entity.provisioned_children() as f64 / total as f64,
    };
    StatusSummary {
        status: entity_status(entity),
        progress_fraction,
    }
}

/// Overall health of a collection, as shown next to a provisioning flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CollectionHealth {
    /// Nothing is tracked yet.
    Unknown,
    InProgress,
    Ready,
    Failed { description: Option<String> },
}

impl CollectionHealth {
    /// Evaluate the collection. A timed-out entity fails the whole
    /// collection even while others are still pending; otherwise pending
    /// entities keep it in progress until every entity has settled.
    pub fn evaluate(collection: &Collection, watchdog: &ProgressWatchdog) -> Self {
        if collection.is_empty() {
            return CollectionHealth::Unknown;
        }
        if collection.keys().any(|key| watchdog.is_timed_out(key)) {
            return CollectionHealth::Failed {
                description: Some(TIMED_OUT_DESCRIPTION.to_string()),
            };
        }

        let statuses: Vec<EntityStatus> = collection.iter().map(entity_status).collect();
        if statuses.contains(&EntityStatus::Pending) {
            return CollectionHealth::InProgress;
        }
        if statuses
            .iter()
            .any(|s| matches!(s, EntityStatus::Error | EntityStatus::Destroyed))
        {
            return CollectionHealth::Failed { description: None };
        }
        CollectionHealth::Ready
    }

    pub fn has_error(&self) -> bool {
        matches!(self, CollectionHealth::Failed { .. })
    }
}
