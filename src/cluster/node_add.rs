//! Adding a node to a running cluster

use tracing::info;

use super::{get_cluster, until_cancelled, with_timeout, ClusterError, ClusterOrchestrator};
use crate::loadbalancer;
use crate::network;
use crate::runtime::Runtime;
use crate::types::{labels, Cluster, Intent, Node, NodeCreateOpts, NodeIP, Role, DEFAULT_API_PORT};

/// Labels copied from an existing cluster member to a new node
const INHERITED_LABELS: &[&str] = &[
    labels::LABEL_APP,
    labels::LABEL_VERSION,
    labels::LABEL_CLUSTER,
    labels::LABEL_NETWORK,
    labels::LABEL_NETWORK_ID,
    labels::LABEL_NETWORK_EXTERNAL,
    labels::LABEL_NETWORK_IPRANGE,
    labels::LABEL_TOKEN,
    labels::LABEL_IMAGE_VOLUME,
];

/// Turn a bare node into a member of `cluster`, borrowing settings from an
/// existing node
pub fn prepare_node_for_cluster(cluster: &mut Cluster, mut node: Node) -> Result<Node, ClusterError> {
    if !matches!(node.role, Role::Server | Role::Agent) {
        return Err(ClusterError::Invalid(format!(
            "only server and agent nodes can be added, got '{}'",
            node.role
        )));
    }
    if cluster.node(&node.name).is_some() {
        return Err(ClusterError::Invalid(format!(
            "node '{}' already exists in cluster '{}'",
            node.name, cluster.name
        )));
    }

    let template = cluster
        .nodes_with_role(node.role)
        .next()
        .or_else(|| cluster.nodes_with_role(Role::Server).next())
        .ok_or_else(|| ClusterError::Invalid(format!("cluster '{}' has no nodes to join", cluster.name)))?;

    for key in INHERITED_LABELS {
        if let Some(value) = template.runtime_labels.get(*key) {
            node.runtime_labels.insert(key.to_string(), value.clone());
        }
    }
    node.runtime_labels
        .insert(labels::LABEL_ROLE.to_string(), node.role.to_string());
    if node.image.is_empty() {
        node.image = template.image.clone();
    }
    if node.networks.is_empty() {
        node.networks = vec![cluster.network.name.clone()];
    }
    node.restart = true;

    let subcommand = node.role.as_str();
    if node.args.first().map(String::as_str) != Some(subcommand) {
        node.args.insert(0, subcommand.to_string());
    }
    node.set_env("K3S_TOKEN", &cluster.token);

    let mut servers: Vec<&str> = cluster
        .nodes_with_role(Role::Server)
        .map(|n| n.name.as_str())
        .collect();
    servers.sort();
    let join = cluster
        .init_node()
        .map(|n| n.name.as_str())
        .or_else(|| servers.first().copied());
    if let Some(server) = join {
        node.set_env("K3S_URL", &format!("https://{}:{}", server, DEFAULT_API_PORT));
    }

    if let Some(volume) = &cluster.image_volume {
        let mount = format!("{}:{}", volume, crate::types::IMAGE_VOLUME_MOUNT_PATH);
        if !node.volumes.contains(&mount) {
            node.volumes.push(mount);
        }
    }

    if cluster.network.ipam.managed && !node.ip.is_static {
        let ip = network::allocate_ip(&mut cluster.network)?;
        node.ip = NodeIP {
            ip: Some(ip),
            is_static: true,
        };
        node.runtime_labels
            .insert(labels::LABEL_NODE_STATIC_IP.to_string(), "true".to_string());
    }

    Ok(node)
}

impl<R: Runtime> ClusterOrchestrator<R> {
    /// Create `node` in the existing cluster `cluster_name`. Adding a server
    /// replaces the load balancer so it proxies to the new server as well.
    pub async fn node_add_to_cluster(
        &self,
        node: Node,
        cluster_name: &str,
        opts: &NodeCreateOpts,
    ) -> Result<Node, ClusterError> {
        until_cancelled(
            &self.cancel,
            with_timeout(opts.timeout, self.node_add_inner(node, cluster_name, opts)),
        )
        .await
    }

    async fn node_add_inner(&self, node: Node, cluster_name: &str, opts: &NodeCreateOpts) -> Result<Node, ClusterError> {
        let mut cluster = get_cluster(&self.runtime, cluster_name).await?;
        let node = prepare_node_for_cluster(&mut cluster, node)?;

        info!("Adding node '{}' to cluster '{}'", node.name, cluster.name);
        self.create_node_and_wait(&node, Intent::NodeCreate, opts.wait, &opts.wait_opts)
            .await?;

        if node.role == Role::Server {
            cluster.nodes.push(node.clone());
            loadbalancer::update_loadbalancer(&self.runtime, &mut cluster).await?;
        }
        Ok(node)
    }
}
