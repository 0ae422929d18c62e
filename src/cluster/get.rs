//! Reconstructing clusters from runtime labels
//!
//! Nothing is stored outside the runtime. A cluster is whatever carries its
//! `k3d.cluster` label, and every other attribute is read back from the
//! labels written at create time.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use super::ClusterError;
use crate::runtime::Runtime;
use crate::types::{labels, Cluster, LoadbalancerSettings, Node, Role};

/// Summary of a cluster's live state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterState {
    pub name: String,
    pub servers: usize,
    pub servers_running: usize,
    pub agents: usize,
    pub agents_running: usize,
    pub has_loadbalancer: bool,
    pub network: String,
    pub external_network: bool,
    pub image_volume: Option<String>,
}

impl From<&Cluster> for ClusterState {
    fn from(cluster: &Cluster) -> Self {
        let running = |role| {
            cluster
                .nodes_with_role(role)
                .filter(|n| n.state.running)
                .count()
        };
        Self {
            name: cluster.name.clone(),
            servers: cluster.server_count(),
            servers_running: running(Role::Server),
            agents: cluster.agent_count(),
            agents_running: running(Role::Agent),
            has_loadbalancer: cluster.load_balancer().is_some(),
            network: cluster.network.name.clone(),
            external_network: cluster.network.external,
            image_volume: cluster.image_volume.clone(),
        }
    }
}

/// Build a cluster value from the nodes carrying its label
pub fn cluster_from_nodes(name: &str, mut nodes: Vec<Node>) -> Cluster {
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    let mut cluster = Cluster::new(name);

    for node in &nodes {
        let l = &node.runtime_labels;
        if let Some(network) = l.get(labels::LABEL_NETWORK) {
            cluster.network.name = network.clone();
        }
        if let Some(id) = l.get(labels::LABEL_NETWORK_ID).filter(|id| !id.is_empty()) {
            cluster.network.id = id.clone();
        }
        if labels::is_true(l, labels::LABEL_NETWORK_EXTERNAL) {
            cluster.network.external = true;
        }
        if let Some(prefix) = l
            .get(labels::LABEL_NETWORK_IPRANGE)
            .and_then(|p| p.parse().ok())
        {
            cluster.network.ipam.ip_prefix = Some(prefix);
        }
        if cluster.token.is_empty() {
            if let Some(token) = l
                .get(labels::LABEL_TOKEN)
                .map(String::as_str)
                .or_else(|| node.env_value("K3S_TOKEN"))
            {
                cluster.token = token.to_string();
            }
        }
        if let Some(volume) = l.get(labels::LABEL_IMAGE_VOLUME) {
            cluster.image_volume = Some(volume.clone());
        }
        if node.role == Role::Server {
            if let Some(host) = l.get(labels::LABEL_SERVER_API_HOST) {
                cluster.kube_api.host = host.clone();
            }
            if let Some(host_ip) = l.get(labels::LABEL_SERVER_API_HOST_IP) {
                cluster.kube_api.host_ip = host_ip.clone();
            }
            if let Some(port) = l
                .get(labels::LABEL_SERVER_API_PORT)
                .and_then(|p| p.parse().ok())
            {
                cluster.kube_api.host_port = port;
            }
        }
        if node.ip.is_static {
            cluster.network.ipam.managed = true;
            if let Some(ip) = node.ip.ip {
                cluster.network.ipam.mark_used(ip);
            }
        }
    }

    if nodes.iter().any(|n| n.role == Role::LoadBalancer) {
        cluster.server_load_balancer = Some(LoadbalancerSettings::default());
    }
    if let Some(volume) = &cluster.image_volume {
        cluster.volumes.push(volume.clone());
    }
    cluster.nodes = nodes;
    cluster
}

/// Read a cluster back from the runtime
pub async fn get_cluster<R: Runtime + ?Sized>(runtime: &R, name: &str) -> Result<Cluster, ClusterError> {
    let nodes = runtime
        .get_nodes_by_label(&labels::cluster_selector(name))
        .await?;
    if nodes.is_empty() {
        return Err(ClusterError::NotFound(name.to_string()));
    }
    debug!("Found {} node(s) of cluster '{}'", nodes.len(), name);

    let mut cluster = cluster_from_nodes(name, nodes);

    if let Some(network) = runtime.get_network(&cluster.network.name).await? {
        if cluster.network.id.is_empty() {
            cluster.network.id = network.id;
        }
        if cluster.network.ipam.ip_prefix.is_none() {
            cluster.network.ipam.ip_prefix = network.ipam.ip_prefix;
        }
        cluster.network.ipam.gateway = network.ipam.gateway;
        for ip in network.ipam.ips_used {
            cluster.network.ipam.mark_used(ip);
        }
        cluster.network.members = network.members;
    }

    for volume in runtime
        .get_volumes_by_label(&labels::cluster_selector(name))
        .await?
    {
        if !cluster.volumes.contains(&volume) {
            cluster.volumes.push(volume);
        }
    }

    Ok(cluster)
}

/// All clusters known to the runtime, sorted by name
pub async fn list_clusters<R: Runtime + ?Sized>(runtime: &R) -> Result<Vec<Cluster>, ClusterError> {
    let nodes = runtime.get_nodes_by_label(&labels::app_selector()).await?;

    let mut by_cluster: BTreeMap<String, Vec<Node>> = BTreeMap::new();
    for node in nodes {
        if let Some(name) = node.cluster_name().map(str::to_string) {
            by_cluster.entry(name).or_default().push(node);
        }
    }

    Ok(by_cluster
        .into_iter()
        .map(|(name, nodes)| cluster_from_nodes(&name, nodes))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::create::prepare_nodes;
    use crate::cluster::test_cluster;
    use crate::loadbalancer::new_loadbalancer_node;
    use crate::runtime::mock::MockRuntime;
    use crate::types::{ClusterCreateOpts, ClusterNetwork};

    fn seeded_runtime() -> MockRuntime {
        let runtime = MockRuntime::new();
        for (name, servers, agents) in [("dev", 3, 1), ("prod", 1, 0)] {
            let mut cluster = test_cluster(servers, agents);
            cluster.name = name.to_string();
            for node in cluster.nodes.iter_mut() {
                node.name = node.name.replace("-dev-", &format!("-{}-", name));
            }
            cluster.network = ClusterNetwork::new(format!("k3d-{}", name));
            cluster.token = format!("{}-token", name);
            cluster.image_volume = Some(format!("k3d-{}-images", name));
            cluster.nodes.push(new_loadbalancer_node(&cluster));
            prepare_nodes(&mut cluster, &ClusterCreateOpts::default()).unwrap();
            for node in cluster.nodes {
                runtime.add_node(node);
            }
        }
        runtime
    }

    #[tokio::test]
    async fn test_get_cluster_from_labels() {
        let runtime = seeded_runtime();
        let cluster = get_cluster(&runtime, "dev").await.unwrap();

        assert_eq!(cluster.name, "dev");
        assert_eq!(cluster.server_count(), 3);
        assert_eq!(cluster.agent_count(), 1);
        assert_eq!(cluster.init_node().unwrap().name, "k3d-dev-server-0");
        assert_eq!(cluster.load_balancer().unwrap().name, "k3d-dev-serverlb");
        assert!(cluster.server_load_balancer.is_some());
        assert_eq!(cluster.network.name, "k3d-dev");
        assert_eq!(cluster.token, "dev-token");
        assert_eq!(cluster.image_volume.as_deref(), Some("k3d-dev-images"));
        assert_eq!(cluster.volumes, vec!["k3d-dev-images"]);
    }

    #[tokio::test]
    async fn test_get_missing_cluster() {
        let runtime = seeded_runtime();
        let err = get_cluster(&runtime, "nope").await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_list_clusters_sorted() {
        let runtime = seeded_runtime();
        runtime.add_node(Node::new("unrelated", Role::None, "busybox"));

        let clusters = list_clusters(&runtime).await.unwrap();
        let names: Vec<_> = clusters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["dev", "prod"]);
        assert_eq!(clusters[1].nodes.len(), 2);
    }

    #[test]
    fn test_cluster_state_summary() {
        let mut cluster = test_cluster(1, 2);
        cluster.nodes[1].state.running = true;
        let state = ClusterState::from(&cluster);
        assert_eq!(state.servers, 1);
        assert_eq!(state.servers_running, 0);
        assert_eq!(state.agents, 2);
        assert_eq!(state.agents_running, 1);
        assert!(!state.has_loadbalancer);
    }
}
