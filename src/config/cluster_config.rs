//! Cluster config file: parsing, validation and transformation into a
//! [`Cluster`]. Pure functions, no I/O.
//!
//! ```yaml
//! name: dev
//! servers: 3
//! agents: 2
//! subnet: auto
//! kubeAPI:
//!   hostPort: 6550
//! ports:
//!   - port: 8080:80
//!     nodeFilters: [loadbalancer]
//! volumes:
//!   - volume: ~/data:/data
//!     nodeFilters: ["agent:*"]
//! options:
//!   timeout: 2m
//! ```

use std::collections::HashMap;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::loadbalancer::{api_port_key, new_loadbalancer_node};
use crate::nodefilter::{filter_node_indices, filter_node_indices_with_suffix, NodeFilterError, NO_SUFFIX};
use crate::types::{
    node_name, Cluster, ClusterCreateOpts, HostAlias, KubeApi, LoadbalancerSettings, Node,
    NodeSpecError, PortBinding, PortMapping, Role, ServerOpts, WaitOptions, DEFAULT_K3S_IMAGE,
};

/// Subnet value asking for a runtime-assigned, managed subnet
pub const SUBNET_AUTO: &str = "auto";

/// Port filter suffixes: `proxy` publishes through the load balancer,
/// `direct` on the targeted nodes themselves
const PORT_SUFFIX_PROXY: &str = "proxy";
const PORT_SUFFIX_DIRECT: &str = "direct";

#[derive(Error, Debug)]
pub enum ClusterConfigError {
    #[error("YAML parse error: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Invalid node setting: {0}")]
    NodeSpec(#[from] NodeSpecError),

    #[error("Node filter error: {0}")]
    NodeFilter(#[from] NodeFilterError),

    #[error("Invalid duration '{0}': expected e.g. 90s, 2m or 1h")]
    InvalidDuration(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeApiConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, rename = "hostIP", skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortWithFilters {
    pub port: String,
    #[serde(default)]
    pub node_filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeWithFilters {
    pub volume: String,
    #[serde(default)]
    pub node_filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelWithFilters {
    pub label: String,
    #[serde(default)]
    pub node_filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarWithFilters {
    pub env_var: String,
    #[serde(default)]
    pub node_filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOptions {
    #[serde(default = "default_true")]
    pub wait: bool,
    /// e.g. `90s`, `2m`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default)]
    pub disable_loadbalancer: bool,
    #[serde(default)]
    pub disable_image_volume: bool,
    #[serde(default, rename = "disableCoreDNSPatch")]
    pub disable_coredns_patch: bool,
    #[serde(default)]
    pub host_network: bool,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            wait: true,
            timeout: None,
            disable_loadbalancer: false,
            disable_image_volume: false,
            disable_coredns_patch: false,
            host_network: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_servers() -> usize {
    1
}

/// User-facing description of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default = "default_servers")]
    pub servers: usize,
    #[serde(default)]
    pub agents: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// CIDR, or `auto` for a managed subnet picked by the runtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, rename = "kubeAPI")]
    pub kube_api: KubeApiConfig,
    #[serde(default)]
    pub ports: Vec<PortWithFilters>,
    #[serde(default)]
    pub volumes: Vec<VolumeWithFilters>,
    #[serde(default)]
    pub labels: Vec<LabelWithFilters>,
    #[serde(default)]
    pub env: Vec<EnvVarWithFilters>,
    #[serde(default)]
    pub host_aliases: Vec<HostAlias>,
    #[serde(default)]
    pub options: ConfigOptions,
}

impl ClusterConfig {
    /// A config with defaults for everything but the name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            servers: 1,
            agents: 0,
            image: None,
            network: None,
            subnet: None,
            token: None,
            kube_api: KubeApiConfig::default(),
            ports: Vec::new(),
            volumes: Vec::new(),
            labels: Vec::new(),
            env: Vec::new(),
            host_aliases: Vec::new(),
            options: ConfigOptions::default(),
        }
    }

    /// Parse and validate from YAML
    pub fn from_yaml(content: &str) -> Result<Self, ClusterConfigError> {
        let config: ClusterConfig =
            serde_yaml::from_str(content).map_err(|e| ClusterConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ClusterConfigError> {
        if self.name.is_empty() {
            return Err(ClusterConfigError::Invalid("name is required".to_string()));
        }
        if self.servers == 0 {
            return Err(ClusterConfigError::Invalid(
                "at least one server is required".to_string(),
            ));
        }
        if self.options.host_network && self.servers + self.agents > 1 {
            return Err(ClusterConfigError::Invalid(
                "host network supports exactly one server and no agents".to_string(),
            ));
        }
        if let Some(subnet) = &self.subnet {
            if subnet != SUBNET_AUTO && subnet.parse::<Ipv4Net>().is_err() {
                return Err(ClusterConfigError::Invalid(format!(
                    "subnet '{}' is neither a CIDR nor '{}'",
                    subnet, SUBNET_AUTO
                )));
            }
        }
        if let Some(timeout) = &self.options.timeout {
            parse_duration(timeout)?;
        }
        Ok(())
    }

    fn with_loadbalancer(&self) -> bool {
        !self.options.disable_loadbalancer && !self.options.host_network
    }

    /// Build the cluster value and create options, resolving every node
    /// filter against the generated node list
    pub fn into_cluster(self) -> Result<(Cluster, ClusterCreateOpts), ClusterConfigError> {
        self.validate()?;

        let mut cluster = Cluster::new(&self.name);
        if self.options.host_network {
            cluster.network.name = "host".to_string();
        } else if let Some(network) = &self.network {
            cluster.network.name = network.clone();
        }
        match self.subnet.as_deref() {
            Some(SUBNET_AUTO) => cluster.network.ipam.managed = true,
            Some(cidr) => {
                cluster.network.ipam.managed = true;
                cluster.network.ipam.ip_prefix = cidr.parse().ok();
            }
            None => {}
        }
        if let Some(token) = &self.token {
            cluster.token = token.clone();
        }

        let defaults = KubeApi::default();
        cluster.kube_api = KubeApi {
            host: self.kube_api.host.clone().unwrap_or(defaults.host),
            host_ip: self.kube_api.host_ip.clone().unwrap_or(defaults.host_ip),
            host_port: self.kube_api.host_port.unwrap_or(defaults.host_port),
        };

        let image = self
            .image
            .clone()
            .unwrap_or_else(|| DEFAULT_K3S_IMAGE.to_string());
        for i in 0..self.servers {
            let mut node = Node::new(
                node_name(&self.name, &format!("server-{}", i)),
                Role::Server,
                &image,
            );
            node.server_opts = ServerOpts {
                is_init: false,
                kube_api: Some(cluster.kube_api.clone()),
            };
            cluster.nodes.push(node);
        }
        for i in 0..self.agents {
            cluster.nodes.push(Node::new(
                node_name(&self.name, &format!("agent-{}", i)),
                Role::Agent,
                &image,
            ));
        }

        if self.with_loadbalancer() {
            cluster.server_load_balancer = Some(LoadbalancerSettings::default());
            let lb = new_loadbalancer_node(&cluster);
            cluster.nodes.push(lb);
        } else if let Some(first) = cluster.nodes.first_mut() {
            // no proxy in front: publish the API on the first server
            first.add_port(PortMapping {
                container_port: api_port_key(),
                binding: PortBinding {
                    host_ip: Some(cluster.kube_api.host_ip.clone()),
                    host_port: Some(cluster.kube_api.host_port.to_string()),
                },
            });
        }

        self.apply_ports(&mut cluster)?;
        self.apply_volumes(&mut cluster)?;
        self.apply_labels(&mut cluster)?;
        self.apply_env(&mut cluster)?;

        let external_datastore = cluster.nodes_with_role(Role::Server).any(|n| {
            n.env_value("K3S_DATASTORE_ENDPOINT").is_some() || n.has_arg("--datastore-endpoint")
        });
        if self.servers > 1 && !external_datastore {
            if let Some(first) = cluster.nodes.iter_mut().find(|n| n.role == Role::Server) {
                debug!("Server '{}' will initialize the cluster", first.name);
                first.server_opts.is_init = true;
            }
        }

        let opts = ClusterCreateOpts {
            wait_for_server: self.options.wait,
            timeout: self
                .options
                .timeout
                .as_deref()
                .map(parse_duration)
                .transpose()?,
            disable_image_volume: self.options.disable_image_volume,
            global_labels: HashMap::new(),
            global_env: Vec::new(),
            host_aliases: self.host_aliases.clone(),
            disable_coredns_patch: self.options.disable_coredns_patch,
            wait: WaitOptions::default(),
        };

        Ok((cluster, opts))
    }

    fn apply_ports(&self, cluster: &mut Cluster) -> Result<(), ClusterConfigError> {
        let has_lb = cluster.load_balancer().is_some();
        for entry in &self.ports {
            let mapping = PortMapping::parse(&entry.port)?;
            let filters = filters_or(&entry.node_filters, if has_lb { "loadbalancer" } else { "server:0" });
            let buckets = filter_node_indices_with_suffix(
                &cluster.nodes,
                &filters,
                &[PORT_SUFFIX_PROXY, PORT_SUFFIX_DIRECT],
            )?;

            for (suffix, indices) in buckets {
                if indices.is_empty() {
                    continue;
                }
                let proxied = suffix == PORT_SUFFIX_PROXY
                    || (suffix == NO_SUFFIX
                        && has_lb
                        && indices.iter().any(|&i| cluster.nodes[i].role != Role::LoadBalancer));
                if proxied {
                    let lb = cluster
                        .nodes
                        .iter_mut()
                        .find(|n| n.role == Role::LoadBalancer)
                        .ok_or_else(|| {
                            ClusterConfigError::Invalid(format!(
                                "port '{}' should be proxied, but the load balancer is disabled",
                                entry.port
                            ))
                        })?;
                    lb.add_port(mapping.clone());
                } else {
                    for i in indices {
                        cluster.nodes[i].add_port(mapping.clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_volumes(&self, cluster: &mut Cluster) -> Result<(), ClusterConfigError> {
        for entry in &self.volumes {
            let volume = expand_volume(&entry.volume)?;
            let filters = filters_or(&entry.node_filters, "all");
            for i in filter_node_indices(&cluster.nodes, &filters)? {
                if cluster.nodes[i].role == Role::LoadBalancer {
                    continue;
                }
                cluster.nodes[i].volumes.push(volume.clone());
            }
        }
        Ok(())
    }

    fn apply_labels(&self, cluster: &mut Cluster) -> Result<(), ClusterConfigError> {
        for entry in &self.labels {
            let (key, value) = split_key_value(&entry.label)?;
            let filters = filters_or(&entry.node_filters, "all");
            for i in filter_node_indices(&cluster.nodes, &filters)? {
                cluster.nodes[i]
                    .runtime_labels
                    .insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    fn apply_env(&self, cluster: &mut Cluster) -> Result<(), ClusterConfigError> {
        for entry in &self.env {
            let (key, value) = split_key_value(&entry.env_var)?;
            let filters = filters_or(&entry.node_filters, "all");
            for i in filter_node_indices(&cluster.nodes, &filters)? {
                cluster.nodes[i].set_env(key, value);
            }
        }
        Ok(())
    }
}

fn filters_or<'a>(filters: &'a [String], default: &'a str) -> Vec<&'a str> {
    if filters.is_empty() {
        vec![default]
    } else {
        filters.iter().map(String::as_str).collect()
    }
}

fn split_key_value(s: &str) -> Result<(&str, &str), ClusterConfigError> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err(ClusterConfigError::Invalid(format!(
            "'{}' is not of the form KEY=VALUE",
            s
        ))),
    }
}

/// Expand `~` and environment variables in the host side of a
/// `source:destination[:mode]` volume
fn expand_volume(volume: &str) -> Result<String, ClusterConfigError> {
    let (source, rest) = match volume.split_once(':') {
        Some((source, rest)) => (source, Some(rest)),
        None => (volume, None),
    };
    if rest.map(str::is_empty).unwrap_or(false) || source.is_empty() {
        return Err(ClusterConfigError::Invalid(format!(
            "volume '{}' is not of the form SOURCE[:DEST[:MODE]]",
            volume
        )));
    }
    let source = shellexpand::full(source)
        .map_err(|e| ClusterConfigError::Invalid(format!("volume '{}': {}", volume, e)))?;
    Ok(match rest {
        Some(rest) => format!("{}:{}", source, rest),
        None => source.into_owned(),
    })
}

/// Parse `500ms`, `90s`, `2m`, `1h` or a bare number of seconds
pub fn parse_duration(s: &str) -> Result<Duration, ClusterConfigError> {
    let s = s.trim();
    let invalid = || ClusterConfigError::InvalidDuration(s.to_string());
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: u64 = number.parse().map_err(|_| invalid())?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => value.checked_mul(60).map(Duration::from_secs).ok_or_else(invalid),
        "h" => value.checked_mul(3600).map(Duration::from_secs).ok_or_else(invalid),
        _ => Err(invalid()),
    }
}
