//! Snapshot fetching: the initial state a collection is seeded from before
//! live events are applied on top.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use livesync_core::{
    apply_event, filter_by_kinds, latest_per_kind, module_events, module_init_event,
    snapshot_event, Collection, InfraRecord, TerraformState, METRICS,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::SnapshotError;
use crate::routes;

/// Release statuses a dashboard asks for by default.
pub const DEFAULT_STATUSES: &[&str] = &[
    "deployed",
    "uninstalled",
    "pending",
    "pending-install",
    "pending-upgrade",
    "pending-rollback",
    "superseded",
    "failed",
];

/// Linear backoff: `attempt * base_delay`, clamped to `[base_delay, max_delay]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(2000),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before retrying after failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let upper = self.max_delay.max(self.base_delay);
        self.base_delay
            .saturating_mul(attempt)
            .clamp(self.base_delay, upper)
    }
}

/// Run `op` until it succeeds or the policy runs out of attempts.
pub async fn fetch_with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, SnapshotError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SnapshotError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 >= attempts => {
                return Err(SnapshotError::RetriesExhausted {
                    attempts,
                    last: Box::new(e),
                })
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "snapshot fetch failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Which release objects a snapshot should contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFilter {
    pub project_id: u64,
    pub cluster_id: u64,
    pub namespace: Option<String>,
    pub limit: u32,
    pub skip: u32,
    pub statuses: Vec<String>,
}

impl SnapshotFilter {
    pub fn new(project_id: u64, cluster_id: u64) -> Self {
        Self {
            project_id,
            cluster_id,
            namespace: None,
            limit: 50,
            skip: 0,
            statuses: DEFAULT_STATUSES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string()).filter(|ns| !ns.is_empty());
        self
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("cluster_id", self.cluster_id.to_string()),
            ("limit", self.limit.to_string()),
            ("skip", self.skip.to_string()),
            ("storage", "secret".to_string()),
        ];
        if let Some(ns) = &self.namespace {
            query.push(("namespace", ns.clone()));
        }
        for status in &self.statuses {
            query.push(("statusFilter", status.clone()));
        }
        query
    }
}

/// Where snapshots come from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Release-style objects matching `filter`.
    async fn fetch_snapshot(&self, filter: &SnapshotFilter) -> Result<Vec<Value>, SnapshotError>;

    /// Infra modules of a project.
    async fn fetch_infras(&self, project_id: u64) -> Result<Vec<InfraRecord>, SnapshotError>;

    /// Desired resource list of one infra module.
    async fn fetch_desired(&self, project_id: u64, infra_id: u64)
        -> Result<Vec<Value>, SnapshotError>;

    /// Current Terraform state of one infra module.
    async fn fetch_current(
        &self,
        project_id: u64,
        infra_id: u64,
    ) -> Result<TerraformState, SnapshotError>;
}

/// Snapshot source over the backend HTTP API.
pub struct HttpSnapshotSource {
    config: ClientConfig,
    http_client: reqwest::Client,
}

impl HttpSnapshotSource {
    pub fn new(config: ClientConfig) -> Result<Self, SnapshotError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("livesync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            config,
            http_client,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, SnapshotError> {
        let url = self.config.api_address(path);
        let mut request = self.http_client.get(&url).query(query);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SnapshotError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let body = response.text().await?;
        debug!(url = %url, bytes = body.len(), "snapshot fetched");
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_snapshot(&self, filter: &SnapshotFilter) -> Result<Vec<Value>, SnapshotError> {
        // An empty body decodes as `null` on some backends.
        let records: Option<Vec<Value>> = self
            .get_json(&routes::releases(filter.project_id), &filter.query())
            .await?;
        Ok(records.unwrap_or_default())
    }

    async fn fetch_infras(&self, project_id: u64) -> Result<Vec<InfraRecord>, SnapshotError> {
        let records: Option<Vec<InfraRecord>> =
            self.get_json(&routes::infras(project_id), &[]).await?;
        Ok(records.unwrap_or_default())
    }

    async fn fetch_desired(
        &self,
        project_id: u64,
        infra_id: u64,
    ) -> Result<Vec<Value>, SnapshotError> {
        let desired: Option<Vec<Value>> = self
            .get_json(&routes::infra_desired(project_id, infra_id), &[])
            .await?;
        Ok(desired.unwrap_or_default())
    }

    async fn fetch_current(
        &self,
        project_id: u64,
        infra_id: u64,
    ) -> Result<TerraformState, SnapshotError> {
        self.get_json(&routes::infra_current(project_id, infra_id), &[])
            .await
    }
}

/// Seed a collection from a release-style snapshot. Records that cannot be
/// keyed are skipped with a warning.
pub async fn seed_collection(
    source: &dyn SnapshotSource,
    filter: &SnapshotFilter,
    object_kind: &str,
    policy: &RetryPolicy,
) -> Result<Collection, SnapshotError> {
    let records = fetch_with_retry(policy, || source.fetch_snapshot(filter)).await?;

    let mut collection = Collection::new();
    for record in &records {
        match snapshot_event(object_kind, record) {
            Ok(event) => collection = apply_event(&collection, &event),
            Err(e) => {
                METRICS.inc_identity_failures();
                warn!(error = %e, "skipping snapshot record");
            }
        }
    }
    info!(records = records.len(), tracked = collection.len(), "collection seeded");
    Ok(collection)
}

/// Infra modules selected for tracking plus the collection seeded from them.
#[derive(Debug, Clone)]
pub struct InfraSeed {
    pub records: Vec<InfraRecord>,
    pub collection: Collection,
}

impl InfraSeed {
    /// Whether every selected module already finished provisioning.
    pub fn all_created(&self) -> bool {
        self.records.iter().all(InfraRecord::is_created)
    }
}

/// Seed infra modules: list, select, then fold in the desired resource list
/// and current state of each one.
///
/// A module whose desired list cannot be fetched stays with unknown children
/// (pending) rather than failing the whole seed. A missing current state is
/// treated as empty.
pub async fn seed_infra(
    source: &dyn SnapshotSource,
    project_id: u64,
    kinds: &[String],
    newest_only: bool,
    policy: &RetryPolicy,
) -> Result<InfraSeed, SnapshotError> {
    let all = fetch_with_retry(policy, || source.fetch_infras(project_id)).await?;
    let mut records = filter_by_kinds(all, kinds);
    if newest_only {
        records = latest_per_kind(records);
    }

    let mut collection = Collection::new();
    for record in &records {
        collection = apply_event(&collection, &module_init_event(record));

        let desired =
            match fetch_with_retry(policy, || source.fetch_desired(project_id, record.id)).await {
                Ok(desired) => desired,
                Err(e) => {
                    warn!(infra_id = record.id, error = %e, "desired state unavailable");
                    continue;
                }
            };
        let current = source
            .fetch_current(project_id, record.id)
            .await
            .unwrap_or_else(|e| {
                debug!(infra_id = record.id, error = %e, "no current state yet");
                TerraformState::default()
            });

        collection = module_events(record, &desired, &current)
            .iter()
            .fold(collection, |c, e| apply_event(&c, e));
    }

    Ok(InfraSeed {
        records,
        collection,
    })
}
