//! Backend API paths for snapshots and live channels.

use url::form_urlencoded;

/// Live stream of Helm release objects for a cluster.
pub fn releases_stream(project_id: u64, cluster_id: u64, namespace: Option<&str>) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair("cluster_id", &cluster_id.to_string());
    if let Some(ns) = namespace.filter(|ns| !ns.is_empty()) {
        query.append_pair("namespace", ns);
    }
    format!(
        "/api/projects/{project_id}/k8s/helm_releases?{}",
        query.finish()
    )
}

/// Live status stream of one controller kind (deployment, statefulset, ...).
pub fn controller_stream(project_id: u64, cluster_id: u64, kind: &str) -> String {
    let kind: String = form_urlencoded::byte_serialize(kind.as_bytes()).collect();
    format!("/api/projects/{project_id}/k8s/{kind}/status?cluster_id={cluster_id}")
}

/// Live provisioning log stream of one infra module.
pub fn infra_logs(project_id: u64, infra_id: u64) -> String {
    format!("/api/projects/{project_id}/infras/{infra_id}/logs")
}

pub fn releases(project_id: u64) -> String {
    format!("/api/projects/{project_id}/releases")
}

pub fn infras(project_id: u64) -> String {
    format!("/api/projects/{project_id}/infras")
}

pub fn infra_desired(project_id: u64, infra_id: u64) -> String {
    format!("/api/projects/{project_id}/infras/{infra_id}/desired")
}

pub fn infra_current(project_id: u64, infra_id: u64) -> String {
    format!("/api/projects/{project_id}/infras/{infra_id}/current")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_stream_appends_namespace_only_when_set() {
        assert_eq!(
            releases_stream(1, 2, None),
            "/api/projects/1/k8s/helm_releases?cluster_id=2"
        );
        assert_eq!(
            releases_stream(1, 2, Some("default")),
            "/api/projects/1/k8s/helm_releases?cluster_id=2&namespace=default"
        );
        assert_eq!(releases_stream(1, 2, Some("")), releases_stream(1, 2, None));
    }

    #[test]
    fn stream_paths_are_escaped() {
        assert_eq!(
            releases_stream(1, 2, Some("team a&b=c")),
            "/api/projects/1/k8s/helm_releases?cluster_id=2&namespace=team+a%26b%3Dc"
        );
        assert_eq!(
            controller_stream(1, 2, "job/../x"),
            "/api/projects/1/k8s/job%2F..%2Fx/status?cluster_id=2"
        );
    }
}
