//! Cluster resource and the options of the lifecycle operations

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::network::ClusterNetwork;
use super::node::{KubeApi, Node, Role};

/// Maximum length of a cluster name; node names derive from it
pub const MAX_CLUSTER_NAME_LEN: usize = 32;

/// Default k3s image for server and agent nodes
pub const DEFAULT_K3S_IMAGE: &str = "docker.io/rancher/k3s:v1.31.5-k3s1";

/// Default image of the server load balancer
pub const DEFAULT_LB_IMAGE: &str = "ghcr.io/k3d-io/k3d-proxy:5.8.3";

/// Settings of the server load balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadbalancerSettings {
    pub worker_connections: u32,
    /// Seconds; `None` keeps the proxy default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_proxy_timeout: Option<u32>,
}

impl Default for LoadbalancerSettings {
    fn default() -> Self {
        Self {
            worker_connections: 1024,
            default_proxy_timeout: None,
        }
    }
}

/// A set of nodes sharing a network, a join token and a datastore
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub network: ClusterNetwork,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Settings for the load balancer node; `None` means no load balancer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_load_balancer: Option<LoadbalancerSettings>,
    /// Volumes owned by the cluster and removed with it
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub kube_api: KubeApi,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_volume: Option<String>,
}

impl Cluster {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            network: ClusterNetwork::new(super::network::default_network_name(&name)),
            name,
            ..Default::default()
        }
    }

    pub fn nodes_with_role(&self, role: Role) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.role == role)
    }

    pub fn server_count(&self) -> usize {
        self.nodes_with_role(Role::Server).count()
    }

    pub fn agent_count(&self) -> usize {
        self.nodes_with_role(Role::Agent).count()
    }

    /// The bootstrap server, if one is designated
    pub fn init_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.server_opts.is_init)
    }

    pub fn load_balancer(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.role == Role::LoadBalancer)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }
}

/// Why a node is being brought up; selects the readiness marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Intent {
    ClusterCreate,
    ClusterStart,
    NodeCreate,
    #[default]
    Any,
}

/// Parameters of the readiness poll loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOptions {
    /// Pause between two log reads
    pub poll_interval: Duration,
    /// Pause after the marker was found
    pub settle_delay: Duration,
    /// Restarts tolerated before the node counts as crash-looping
    pub backoff_limit: u32,
    /// Deadline of a single readiness wait
    pub timeout: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            settle_delay: Duration::from_millis(500),
            backoff_limit: 10,
            timeout: None,
        }
    }
}

/// Extra `/etc/hosts` entry injected into every node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAlias {
    pub ip: Ipv4Addr,
    pub hostnames: Vec<String>,
}

/// Options of the create operation
#[derive(Debug, Clone, Default)]
pub struct ClusterCreateOpts {
    /// Block until every server is ready
    pub wait_for_server: bool,
    /// Overall deadline of the operation
    pub timeout: Option<Duration>,
    pub disable_image_volume: bool,
    /// Labels added to every node
    pub global_labels: HashMap<String, String>,
    /// `KEY=VALUE` entries added to every node
    pub global_env: Vec<String>,
    pub host_aliases: Vec<HostAlias>,
    pub disable_coredns_patch: bool,
    pub wait: WaitOptions,
}

/// Options of the start operation
#[derive(Debug, Clone, Default)]
pub struct ClusterStartOpts {
    pub wait_for_server: bool,
    pub timeout: Option<Duration>,
    pub intent: Intent,
    pub host_aliases: Vec<HostAlias>,
    pub disable_coredns_patch: bool,
    pub wait: WaitOptions,
}

impl ClusterStartOpts {
    /// Start options used right after a create
    pub fn after_create(opts: &ClusterCreateOpts) -> Self {
        Self {
            wait_for_server: opts.wait_for_server,
            timeout: None,
            intent: Intent::ClusterCreate,
            host_aliases: opts.host_aliases.clone(),
            disable_coredns_patch: opts.disable_coredns_patch,
            wait: opts.wait.clone(),
        }
    }
}

/// Options of the delete operation
#[derive(Debug, Clone, Default)]
pub struct ClusterDeleteOpts {
    /// Remove registries even if other networks still use them
    pub skip_registry_check: bool,
}

/// Options of adding a single node to a running cluster
#[derive(Debug, Clone, Default)]
pub struct NodeCreateOpts {
    /// Block until the new node is ready
    pub wait: bool,
    pub timeout: Option<Duration>,
    pub wait_opts: WaitOptions,
}
