//! Structured observability hooks for live subscriptions.
//!
//! This module provides:
//! - The subscription-scoped span every delivery task runs in
//! - Emission functions for lifecycle events: open, close, transport error,
//!   dropped message and status change
//!
//! Events are emitted at `info!` level unless they report a failure.

use tracing::{info, Span};

use crate::entity::{EntityKey, EntityStatus};

/// Span for one subscription. Attach it with `Instrument::instrument` so
/// every event of the delivery task carries the subscription id.
pub fn subscription_span(subscription_id: &str, address: &str) -> Span {
    tracing::info_span!(
        "livesync.subscription",
        subscription_id = %subscription_id,
        address = %address,
    )
}

pub fn emit_subscription_opened(subscription_id: &str, address: &str) {
    info!(event = "subscription.opened", subscription_id = %subscription_id, address = %address);
}

pub fn emit_subscription_closed(subscription_id: &str, messages: u64) {
    info!(
        event = "subscription.closed",
        subscription_id = %subscription_id,
        messages = messages,
    );
}

/// Transport failure on an open subscription (warning level).
pub fn emit_subscription_error(subscription_id: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "subscription.error", subscription_id = %subscription_id, error = %error);
}

/// A message was dropped before reaching the collection (warning level).
pub fn emit_message_dropped(subscription_id: &str, reason: &dyn std::fmt::Display) {
    tracing::warn!(event = "message.dropped", subscription_id = %subscription_id, reason = %reason);
}

pub fn emit_status_changed(key: &EntityKey, from: Option<EntityStatus>, to: EntityStatus) {
    info!(
        event = "entity.status_changed",
        key = %key,
        from = from.map(|s| s.as_str()).unwrap_or("none"),
        to = %to,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_span_names_subscription() {
        let span = subscription_span("releases", "ws://localhost/releases");
        let _entered = span.enter();
        emit_subscription_opened("releases", "ws://localhost/releases");
    }
}
