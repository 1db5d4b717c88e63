//! No-progress detection for entities under provisioning.
//!
//! One deadline per entity, re-armed whenever the entity's progress
//! fingerprint changes and evaluated on every reconciliation step. There are
//! no per-entity timers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::entity::{EntityKey, EntityStatus, TrackedEntity};
use crate::reconcile::Collection;
use crate::status::entity_status;

/// How long a pending entity may go without progress.
pub const DEFAULT_PROGRESS_LIMIT: Duration = Duration::from_secs(45 * 60);

/// Watchdog view of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Still pending and within its limit.
    Progressing,
    /// No longer pending.
    Settled,
    /// Pending with no progress for the whole limit. Terminal.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    total: Option<usize>,
    provisioned: usize,
    errored: usize,
    global_errors: usize,
}

impl Fingerprint {
    fn of(entity: &TrackedEntity) -> Self {
        Self {
            total: entity.total_children(),
            provisioned: entity.provisioned_children(),
            errored: entity.errored_children(),
            global_errors: entity.global_errors.len(),
        }
    }
}

#[derive(Debug, Clone)]
struct Mark {
    fingerprint: Fingerprint,
    since: Instant,
    status: EntityStatus,
    timed_out: bool,
}

/// Tracks the last instant each entity made progress.
#[derive(Debug, Clone)]
pub struct ProgressWatchdog {
    limit: Duration,
    marks: HashMap<EntityKey, Mark>,
}

impl Default for ProgressWatchdog {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_LIMIT)
    }
}

impl ProgressWatchdog {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            marks: HashMap::new(),
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Re-evaluate every entity at `now`. Returns the keys that timed out
    /// during this call. Marks of entities no longer in the collection are
    /// dropped.
    pub fn observe(&mut self, collection: &Collection, now: Instant) -> Vec<EntityKey> {
        self.marks.retain(|key, _| collection.contains(key));

        let mut newly_timed_out = Vec::new();
        for entity in collection.iter() {
            let fingerprint = Fingerprint::of(entity);
            let status = entity_status(entity);
            let mark = self.marks.entry(entity.id.clone()).or_insert(Mark {
                fingerprint,
                since: now,
                status,
                timed_out: false,
            });
            if mark.timed_out {
                continue;
            }
            if mark.fingerprint != fingerprint {
                mark.fingerprint = fingerprint;
                mark.since = now;
            }
            mark.status = status;

            let stalled = now.saturating_duration_since(mark.since) >= self.limit;
            if status == EntityStatus::Pending && stalled {
                mark.timed_out = true;
                tracing::warn!(
                    key = %entity.id,
                    limit_secs = self.limit.as_secs(),
                    "entity made no progress within limit"
                );
                newly_timed_out.push(entity.id.clone());
            }
        }
        newly_timed_out
    }

    pub fn verdict(&self, key: &EntityKey) -> Option<Verdict> {
        self.marks.get(key).map(|mark| {
            if mark.timed_out {
                Verdict::TimedOut
            } else if mark.status == EntityStatus::Pending {
                Verdict::Progressing
            } else {
                Verdict::Settled
            }
        })
    }

    pub fn is_timed_out(&self, key: &EntityKey) -> bool {
        self.verdict(key) == Some(Verdict::TimedOut)
    }

    /// Stop tracking an entity (for example after the consumer purges it).
    pub fn forget(&mut self, key: &EntityKey) {
        self.marks.remove(key);
    }
}
