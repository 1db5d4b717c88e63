//! livesync client
//!
//! The I/O half of livesync: live channel transports, the subscription
//! manager, snapshot fetching and the handler that reconciles messages into
//! a published collection.

pub mod config;
pub mod error;
pub mod fakes;
pub mod handler;
pub mod routes;
pub mod snapshot;
pub mod subscription;
pub mod transport;

pub use config::ClientConfig;
pub use error::{ConfigError, SnapshotError, SubscriptionError, TransportError};
pub use handler::{LiveView, ReconcilingHandler};
pub use snapshot::{
    fetch_with_retry, seed_collection, seed_infra, HttpSnapshotSource, InfraSeed, RetryPolicy,
    SnapshotFilter, SnapshotSource,
};
pub use subscription::{SubscriptionHandler, SubscriptionManager, SubscriptionState};
pub use transport::{LiveChannel, Transport, WsTransport};
