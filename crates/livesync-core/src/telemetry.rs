//! Tracing setup for the livesync binary.
//!
//! Logs go to stderr; stdout is reserved for status rows so `--json` output
//! stays machine-readable. Without `RUST_LOG`, only the livesync crates log
//! at the requested level and the transport stack (tungstenite, reqwest,
//! hyper) is held at `warn`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LIVESYNC_TARGETS: &[&str] = &["livesync", "livesync_core", "livesync_client"];

/// Install the global subscriber. Only the first call takes effect.
///
/// JSON lines carry the active subscription span, so every record of a
/// delivery task can be grouped by `subscription_id`.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .ok();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    let mut directives = vec!["warn".to_string()];
    directives.extend(LIVESYNC_TARGETS.iter().map(|t| format!("{t}={level}")));
    directives.join(",")
}
