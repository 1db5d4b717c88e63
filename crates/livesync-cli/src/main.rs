//! LiveSync CLI
//!
//! The `livesync` command seeds a collection from the backend, subscribes to
//! its live stream and prints status roll-ups as they change.
//!
//! ## Commands
//!
//! - `releases`: watch Helm releases of a cluster
//! - `controllers`: watch workload controllers of one kind
//! - `infra`: watch infrastructure modules while they provision

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use livesync_client::{
    routes, seed_collection, seed_infra, ClientConfig, HttpSnapshotSource, LiveView,
    ReconcilingHandler, SnapshotFilter, SubscriptionManager, WsTransport,
};
use livesync_core::{
    derive_status, Collection, CollectionHealth, EntityKey, ProgressWatchdog, StreamScope,
    METRICS,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, Level};

/// How often the watchdog is re-evaluated while streams are silent.
const TICK: Duration = Duration::from_secs(15);

/// Upper bound for `--limit-minutes`: one week.
const MAX_LIMIT_MINUTES: u64 = 7 * 24 * 60;

#[derive(Parser)]
#[command(name = "livesync")]
#[command(author = "Stevedores Org")]
#[command(version = livesync_core::VERSION)]
#[command(about = "Watch live cluster and infrastructure state", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and status rows
    #[arg(long, global = true)]
    json: bool,

    /// Base URL of the HTTP API
    #[arg(long, global = true, env = "LIVESYNC_API_URL")]
    api_url: Option<String>,

    /// Base URL of the live channel endpoint
    #[arg(long, global = true, env = "LIVESYNC_WS_URL")]
    ws_url: Option<String>,

    /// Bearer token
    #[arg(long, global = true, env = "LIVESYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch Helm releases of a cluster
    Releases {
        #[arg(long)]
        project: u64,

        #[arg(long)]
        cluster: u64,

        /// Only releases of this namespace
        #[arg(short, long)]
        namespace: Option<String>,

        /// Print the snapshot and exit without subscribing
        #[arg(long)]
        once: bool,
    },

    /// Watch workload controllers (deployment, statefulset, ...) of a cluster
    Controllers {
        #[arg(long)]
        project: u64,

        #[arg(long)]
        cluster: u64,

        /// Controller kind to watch
        #[arg(long, default_value = "deployment")]
        kind: String,
    },

    /// Watch infrastructure modules until they finish provisioning
    Infra {
        #[arg(long)]
        project: u64,

        /// Only modules of these kinds (repeatable); all kinds when omitted
        #[arg(long = "kind")]
        kinds: Vec<String>,

        /// Track only the newest module of each kind
        #[arg(long)]
        newest: bool,

        /// Minutes a module may go without progress before it is failed
        #[arg(
            long,
            default_value_t = 45,
            value_parser = clap::value_parser!(u64).range(1..=MAX_LIMIT_MINUTES)
        )]
        limit_minutes: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    livesync_core::init_tracing(cli.json, level);

    let config = build_config(&cli)?;
    let result = match cli.command {
        Commands::Releases {
            project,
            cluster,
            ref namespace,
            once,
        } => cmd_releases(&config, project, cluster, namespace.as_deref(), once, cli.json).await,
        Commands::Controllers {
            project,
            cluster,
            ref kind,
        } => cmd_controllers(&config, project, cluster, kind, cli.json).await,
        Commands::Infra {
            project,
            ref kinds,
            newest,
            limit_minutes,
        } => {
            let limit = Duration::from_secs(limit_minutes * 60);
            cmd_infra(&config, project, kinds, newest, limit, cli.json).await
        }
    };
    METRICS.flush();
    result
}

fn build_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = ClientConfig::from_env().context("Invalid LIVESYNC_* environment")?;
    if let Some(url) = &cli.api_url {
        config.api_url = url.trim_end_matches('/').to_string();
    }
    if let Some(url) = &cli.ws_url {
        config.ws_url = url.trim_end_matches('/').to_string();
    }
    if let Some(token) = &cli.token {
        config = config.with_token(token);
    }
    Ok(config)
}

async fn cmd_releases(
    config: &ClientConfig,
    project: u64,
    cluster: u64,
    namespace: Option<&str>,
    once: bool,
    json: bool,
) -> Result<()> {
    let source = HttpSnapshotSource::new(config.clone())?;
    let mut filter = SnapshotFilter::new(project, cluster);
    if let Some(ns) = namespace {
        filter = filter.with_namespace(ns);
    }
    let collection = seed_collection(&source, &filter, "", &config.retry)
        .await
        .context("Failed to fetch release snapshot")?;

    if once {
        print_rows(&collection, json)?;
        return Ok(());
    }

    let handler = ReconcilingHandler::new(collection, ProgressWatchdog::default());
    let manager = manager(config);
    let address = config.ws_address(&routes::releases_stream(project, cluster, namespace));
    manager
        .open("helm_releases", &address, handler.clone())
        .await
        .context("Failed to open release stream")?;

    let outcome = follow(&handler, json, |_| false).await;
    manager.close_all().await;
    outcome.map(|_| ())
}

async fn cmd_controllers(
    config: &ClientConfig,
    project: u64,
    cluster: u64,
    kind: &str,
    json: bool,
) -> Result<()> {
    // Controller streams start with an ADD for every existing object.
    let handler = ReconcilingHandler::new(Collection::new(), ProgressWatchdog::default());
    let manager = manager(config);
    let address = config.ws_address(&routes::controller_stream(project, cluster, kind));
    manager
        .open(kind, &address, handler.clone())
        .await
        .with_context(|| format!("Failed to open {kind} stream"))?;

    let outcome = follow(&handler, json, |_| false).await;
    manager.close_all().await;
    outcome.map(|_| ())
}

async fn cmd_infra(
    config: &ClientConfig,
    project: u64,
    kinds: &[String],
    newest: bool,
    limit: Duration,
    json: bool,
) -> Result<()> {
    let source = HttpSnapshotSource::new(config.clone())?;
    let seed = seed_infra(&source, project, kinds, newest, &config.retry)
        .await
        .context("Failed to fetch infrastructure")?;

    if seed.records.is_empty() {
        println!("We couldn't find any infra being provisioned.");
        return Ok(());
    }
    if seed.all_created() {
        print_rows(&seed.collection, json)?;
        info!(modules = seed.records.len(), "all infrastructure already created");
        return Ok(());
    }

    let handler = ReconcilingHandler::new(seed.collection.clone(), ProgressWatchdog::new(limit));
    let manager = manager(config);
    for record in &seed.records {
        let id = record.id.to_string();
        handler
            .scope(&id, StreamScope::Module(EntityKey::new(id.as_str())))
            .await;
        let address = config.ws_address(&routes::infra_logs(project, record.id));
        manager
            .open(&id, &address, handler.clone())
            .await
            .with_context(|| format!("Failed to open provisioning logs of infra {id}"))?;
    }

    let outcome = follow(&handler, json, |view| {
        matches!(
            view.health,
            CollectionHealth::Ready | CollectionHealth::Failed { .. }
        )
    })
    .await;
    manager.close_all().await;

    match outcome?.health {
        CollectionHealth::Failed { description } => bail!(
            "{}",
            description.unwrap_or_else(|| "Provisioning failed".to_string())
        ),
        _ => Ok(()),
    }
}

fn manager(config: &ClientConfig) -> SubscriptionManager<WsTransport> {
    SubscriptionManager::new(Arc::new(WsTransport::new(config.token.clone())))
        .with_close_timeout(config.close_timeout)
}

/// Print every published view until `done` holds or ctrl-c is pressed.
/// Returns the last view seen.
async fn follow(
    handler: &ReconcilingHandler,
    json: bool,
    done: impl Fn(&LiveView) -> bool,
) -> Result<LiveView> {
    let mut rx: watch::Receiver<LiveView> = handler.subscribe();
    let mut ticker = tokio::time::interval(TICK);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut last = rx.borrow_and_update().clone();
    print_rows(&last.collection, json)?;
    if done(&last) {
        return Ok(last);
    }

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                last = rx.borrow_and_update().clone();
                print_rows(&last.collection, json)?;
                for (id, error) in &last.connection_errors {
                    eprintln!("subscription {id}: {error}");
                }
                if done(&last) {
                    break;
                }
            }
            _ = ticker.tick() => {
                handler.tick().await;
            }
            _ = &mut ctrl_c => {
                info!("interrupted, closing subscriptions");
                break;
            }
        }
    }
    Ok(last)
}

#[derive(Debug, Serialize, PartialEq)]
struct StatusRow {
    key: String,
    kind: String,
    status: String,
    progress: f64,
    errors: Vec<String>,
}

fn status_rows(collection: &Collection) -> Vec<StatusRow> {
    collection
        .iter()
        .map(|entity| {
            let summary = derive_status(entity);
            StatusRow {
                key: entity.id.to_string(),
                kind: entity.kind.clone(),
                status: summary.status.to_string(),
                progress: summary.progress_fraction,
                errors: entity.error_messages(),
            }
        })
        .collect()
}

fn print_rows(collection: &Collection, json: bool) -> Result<()> {
    let rows = status_rows(collection);
    if json {
        println!("{}", serde_json::to_string(&rows)?);
        return Ok(());
    }
    for row in &rows {
        println!(
            "{:<40} {:<12} {:>5.1}%",
            row.key,
            row.status,
            row.progress * 100.0
        );
        for error in &row.errors {
            println!("    ! {error}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use livesync_core::{apply_event, ChildResource, EntitySeed, KeyedEvent, KIND_INFRA_MODULE};
    use serde_json::json;

    #[test]
    fn rows_carry_progress_and_errors() {
        let seed = EntitySeed::new(KIND_INFRA_MODULE, json!({})).with_children(vec![
            ChildResource::provisioned("aws_vpc.main"),
            ChildResource::pending("aws_eks_cluster.main").with_error("quota"),
        ]);
        let c = apply_event(&Collection::new(), &KeyedEvent::add("4", seed));

        let rows = status_rows(&c);
        assert_eq!(
            rows,
            vec![StatusRow {
                key: "4".to_string(),
                kind: KIND_INFRA_MODULE.to_string(),
                status: "error".to_string(),
                progress: 0.5,
                errors: vec!["quota".to_string()],
            }]
        );
    }

    #[test]
    fn cli_parses_infra_kinds() {
        let cli = Cli::try_parse_from([
            "livesync", "infra", "--project", "1", "--kind", "eks", "--kind", "ecr", "--newest",
        ])
        .unwrap();
        match cli.command {
            Commands::Infra {
                project,
                kinds,
                newest,
                limit_minutes,
            } => {
                assert_eq!(project, 1);
                assert_eq!(kinds, vec!["eks", "ecr"]);
                assert!(newest);
                assert_eq!(limit_minutes, 45);
            }
            _ => panic!("expected infra command"),
        }
    }

    #[test]
    fn cli_rejects_out_of_range_limit() {
        for limit in ["0", "10081", "18446744073709551615"] {
            let parsed = Cli::try_parse_from([
                "livesync", "infra", "--project", "1", "--limit-minutes", limit,
            ]);
            assert!(parsed.is_err(), "limit {limit} should be rejected");
        }
    }
}
