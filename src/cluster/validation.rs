//! Precondition checks run before any container is touched

use std::collections::HashSet;

use super::ClusterError;
use crate::types::{Cluster, Role, MAX_CLUSTER_NAME_LEN};

/// Env var / server flag pointing k3s at an external datastore
const DATASTORE_ENV: &str = "K3S_DATASTORE_ENDPOINT";
const DATASTORE_ARG: &str = "--datastore-endpoint";

/// Cluster names become part of hostnames: RFC 1123 label, at most
/// [`MAX_CLUSTER_NAME_LEN`] characters
pub fn validate_cluster_name(name: &str) -> Result<(), ClusterError> {
    let invalid = |reason: &str| ClusterError::Invalid(format!("cluster name '{}' {}", name, reason));

    if name.is_empty() {
        return Err(invalid("is empty"));
    }
    if name.len() > MAX_CLUSTER_NAME_LEN {
        return Err(invalid(&format!(
            "is longer than {} characters",
            MAX_CLUSTER_NAME_LEN
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("must not start or end with '-'"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid("may only contain lowercase letters, digits and '-'"));
    }
    Ok(())
}

/// Check the requested topology
pub fn validate_cluster(cluster: &Cluster) -> Result<(), ClusterError> {
    validate_cluster_name(&cluster.name)?;

    let servers: Vec<_> = cluster.nodes_with_role(Role::Server).collect();
    if servers.is_empty() {
        return Err(ClusterError::Invalid(
            "a cluster needs at least one server".to_string(),
        ));
    }

    if cluster.network.is_host() && cluster.nodes.len() > 1 {
        return Err(ClusterError::Invalid(format!(
            "host network allows a single node, got {}",
            cluster.nodes.len()
        )));
    }

    let init_nodes = cluster.nodes.iter().filter(|n| n.server_opts.is_init).count();
    if init_nodes > 1 {
        return Err(ClusterError::Invalid(format!(
            "at most one init node allowed, got {}",
            init_nodes
        )));
    }
    if let Some(init) = cluster.init_node() {
        if init.role != Role::Server {
            return Err(ClusterError::Invalid(format!(
                "init node '{}' is not a server",
                init.name
            )));
        }
    }

    let external_datastore = servers
        .iter()
        .any(|n| n.env_value(DATASTORE_ENV).is_some() || n.has_arg(DATASTORE_ARG));
    if servers.len() > 1 && init_nodes == 0 && !external_datastore {
        return Err(ClusterError::Invalid(format!(
            "{} servers need an init node or an external datastore",
            servers.len()
        )));
    }

    if cluster.kube_api.host_port == 0 {
        return Err(ClusterError::Invalid(
            "API port must be between 1 and 65535".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for node in &cluster.nodes {
        let mut ports = HashSet::new();
        for binding in node.ports.values().flatten() {
            let Some(port) = &binding.host_port else {
                continue;
            };
            // the same mapping listed twice on one node is harmless
            if !ports.insert((binding.host_ip.clone(), port.clone())) {
                continue;
            }
            if !seen.insert((binding.host_ip.clone(), port.clone())) {
                return Err(ClusterError::Invalid(format!(
                    "host port {} is bound more than once",
                    port
                )));
            }
        }
    }

    Ok(())
}
