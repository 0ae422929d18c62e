//! Server load balancer
//!
//! The load balancer is a disposable proxy container in front of all server
//! nodes. Its configuration is derived from the cluster topology and written
//! into the container by a pre-start hook; changing it means replacing the
//! container.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::runtime::{Runtime, RuntimeError};
use crate::types::{
    labels, node_name, Cluster, HookAction, HookStage, LoadbalancerSettings, Node, NodeHook,
    NodeState, PortMapping, Role, DEFAULT_API_PORT, DEFAULT_LB_IMAGE,
};

/// Where the proxy reads its configuration from
pub const LB_CONFIG_PATH: &str = "/etc/confd/values.yaml";

/// Name suffix of the load balancer node
pub const LB_NAME_SUFFIX: &str = "serverlb";

#[derive(Error, Debug)]
pub enum LoadbalancerError {
    #[error("Failed to serialize load balancer config: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Port (`<port>/<proto>`) to backend node names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadbalancerConfig {
    pub ports: BTreeMap<String, Vec<String>>,
    pub settings: LoadbalancerSettings,
}

impl LoadbalancerConfig {
    pub fn to_yaml(&self) -> Result<String, LoadbalancerError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// The Kubernetes API port key, always present
pub fn api_port_key() -> String {
    format!("{}/tcp", DEFAULT_API_PORT)
}

/// Build the proxy configuration from the current server set.
///
/// Every container port exposed on a server or on the load balancer itself
/// is proxied to all servers. Output only depends on server names and
/// exposed ports.
pub fn generate_config(cluster: &Cluster) -> LoadbalancerConfig {
    let mut servers: Vec<String> = cluster
        .nodes_with_role(Role::Server)
        .map(|n| n.name.clone())
        .collect();
    servers.sort();

    let mut ports = BTreeMap::new();
    ports.insert(api_port_key(), servers.clone());

    for node in cluster
        .nodes
        .iter()
        .filter(|n| matches!(n.role, Role::Server | Role::LoadBalancer))
    {
        for port in node.ports.keys() {
            ports.entry(port.clone()).or_insert_with(|| servers.clone());
        }
    }

    LoadbalancerConfig {
        ports,
        settings: cluster.server_load_balancer.clone().unwrap_or_default(),
    }
}

/// Pre-start hook writing `config` to [`LB_CONFIG_PATH`]
pub fn config_hook(config: &LoadbalancerConfig) -> Result<NodeHook, LoadbalancerError> {
    Ok(NodeHook {
        stage: HookStage::PreStart,
        action: HookAction::WriteFile {
            dest: LB_CONFIG_PATH.to_string(),
            content: config.to_yaml()?.into_bytes(),
            mode: 0o644,
            description: "Write load balancer configuration".to_string(),
        },
    })
}

/// Load balancer node of a cluster, publishing the Kubernetes API on the
/// cluster's configured host address
pub fn new_loadbalancer_node(cluster: &Cluster) -> Node {
    let mut node = Node::new(
        node_name(&cluster.name, LB_NAME_SUFFIX),
        Role::LoadBalancer,
        DEFAULT_LB_IMAGE,
    );
    node.restart = true;
    node.networks = vec![cluster.network.name.clone()];
    node.runtime_labels = labels::default_runtime_labels();
    node.runtime_labels
        .insert(labels::LABEL_CLUSTER.to_string(), cluster.name.clone());
    node.runtime_labels
        .insert(labels::LABEL_ROLE.to_string(), Role::LoadBalancer.to_string());

    node.add_port(PortMapping {
        container_port: api_port_key(),
        binding: crate::types::PortBinding {
            host_ip: Some(cluster.kube_api.host_ip.clone()),
            host_port: Some(cluster.kube_api.host_port.to_string()),
        },
    });
    node
}

/// Replace the load balancer hooks with a freshly generated config hook
pub fn attach_config(cluster: &mut Cluster) -> Result<(), LoadbalancerError> {
    let config = generate_config(cluster);
    let hook = config_hook(&config)?;
    if let Some(lb) = cluster
        .nodes
        .iter_mut()
        .find(|n| n.role == Role::LoadBalancer)
    {
        debug!(
            "Load balancer config for '{}': {} port(s)",
            lb.name,
            config.ports.len()
        );
        lb.hooks.retain(|h| h.stage != HookStage::PreStart);
        lb.hooks.push(hook);
    }
    Ok(())
}

/// Regenerate the config and replace the running load balancer.
///
/// No-op for clusters without a load balancer.
pub async fn update_loadbalancer<R: Runtime + ?Sized>(
    runtime: &R,
    cluster: &mut Cluster,
) -> Result<(), LoadbalancerError> {
    if cluster.load_balancer().is_none() {
        debug!("Cluster '{}' has no load balancer to update", cluster.name);
        return Ok(());
    }

    attach_config(cluster)?;
    let Some(lb) = cluster.nodes.iter_mut().find(|n| n.role == Role::LoadBalancer) else {
        return Ok(());
    };

    info!("Replacing load balancer '{}' with new configuration", lb.name);
    match runtime.stop_node(lb).await {
        Ok(()) | Err(RuntimeError::NodeNotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    match runtime.delete_node(lb).await {
        Ok(()) | Err(RuntimeError::NodeNotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }

    lb.state = NodeState::default();
    runtime.create_node(lb).await?;
    runtime.start_node(lb).await?;
    Ok(())
}
