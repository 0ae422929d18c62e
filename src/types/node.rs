//! Node resource - one container acting as a cluster member

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::labels;

/// Port the Kubernetes API server listens on inside server containers
pub const DEFAULT_API_PORT: u16 = 6443;

/// Where the image volume is mounted inside server and agent nodes
pub const IMAGE_VOLUME_MOUNT_PATH: &str = "/k3d/images";

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Agent,
    #[serde(rename = "loadbalancer")]
    LoadBalancer,
    Registry,
    #[default]
    #[serde(rename = "noRole")]
    None,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Agent => "agent",
            Role::LoadBalancer => "loadbalancer",
            Role::Registry => "registry",
            Role::None => "noRole",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = NodeSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Role::Server),
            "agent" => Ok(Role::Agent),
            "loadbalancer" => Ok(Role::LoadBalancer),
            "registry" => Ok(Role::Registry),
            "noRole" | "" => Ok(Role::None),
            other => Err(NodeSpecError::UnknownRole(other.to_string())),
        }
    }
}

/// Errors parsing user supplied node attributes
#[derive(Error, Debug, PartialEq)]
pub enum NodeSpecError {
    #[error("Unknown node role '{0}'")]
    UnknownRole(String),

    #[error("Invalid port mapping '{0}': {1}")]
    InvalidPortMapping(String, String),
}

/// Host side of a published container port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<String>,
}

/// A parsed `[hostIP:][hostPort:]containerPort[/proto]` mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Container port with protocol, e.g. `80/tcp`
    pub container_port: String,
    pub binding: PortBinding,
}

impl PortMapping {
    pub fn parse(spec: &str) -> Result<Self, NodeSpecError> {
        let invalid = |reason: &str| NodeSpecError::InvalidPortMapping(spec.to_string(), reason.to_string());

        let (addr, proto) = match spec.rsplit_once('/') {
            Some((addr, proto)) => (addr, proto.to_lowercase()),
            None => (spec, "tcp".to_string()),
        };
        if proto != "tcp" && proto != "udp" && proto != "sctp" {
            return Err(invalid("protocol must be tcp, udp or sctp"));
        }

        let parts: Vec<&str> = addr.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [container] => (None, None, *container),
            [host, container] => (None, Some(*host), *container),
            [ip, host, container] => (Some(*ip), Some(*host), *container),
            _ => return Err(invalid("too many ':' separators")),
        };

        if container_port.parse::<u16>().is_err() {
            return Err(invalid("container port is not a number"));
        }
        if let Some(host) = host_port {
            if !host.is_empty() && host.parse::<u16>().is_err() {
                return Err(invalid("host port is not a number"));
            }
        }
        if let Some(ip) = host_ip {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(invalid("host IP is not an IP address"));
            }
        }

        Ok(Self {
            container_port: format!("{}/{}", container_port, proto),
            binding: PortBinding {
                host_ip: host_ip.map(str::to_string),
                host_port: host_port.filter(|p| !p.is_empty()).map(str::to_string),
            },
        })
    }
}

/// Address assigned to a node in the cluster network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIP {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    /// Assigned by the IP allocator rather than by the runtime
    #[serde(default)]
    pub is_static: bool,
}

/// Live state of a node as reported by the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub running: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_count: u32,
}

/// Where the Kubernetes API of a cluster is reachable from the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeApi {
    pub host: String,
    pub host_ip: String,
    pub host_port: u16,
}

impl Default for KubeApi {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            host_ip: "0.0.0.0".to_string(),
            host_port: DEFAULT_API_PORT,
        }
    }
}

/// Server-only node options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerOpts {
    /// Bootstraps the clustered datastore (`--cluster-init`)
    #[serde(default)]
    pub is_init: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kube_api: Option<KubeApi>,
}

/// When a hook runs relative to the container process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookStage {
    PreStart,
    PostStart,
}

/// What a hook does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookAction {
    /// Write a file into the container filesystem
    WriteFile {
        dest: String,
        content: Vec<u8>,
        mode: u32,
        description: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHook {
    pub stage: HookStage,
    pub action: HookAction,
}

/// A single container representing one cluster member
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub role: Role,
    pub image: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// `KEY=VALUE` entries
    #[serde(default)]
    pub env: Vec<String>,
    /// Container port (`80/tcp`) to host bindings
    #[serde(default)]
    pub ports: BTreeMap<String, Vec<PortBinding>>,
    /// `source:destination[:mode]` entries
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub runtime_labels: HashMap<String, String>,
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub ip: NodeIP,
    #[serde(default)]
    pub server_opts: ServerOpts,
    #[serde(default)]
    pub state: NodeState,
    #[serde(skip)]
    pub hooks: Vec<NodeHook>,
}

impl Node {
    pub fn new(name: impl Into<String>, role: Role, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role,
            image: image.into(),
            ..Default::default()
        }
    }

    /// Cluster this node belongs to, from its runtime labels
    pub fn cluster_name(&self) -> Option<&str> {
        self.runtime_labels.get(labels::LABEL_CLUSTER).map(String::as_str)
    }

    /// Value of an environment variable, if set
    pub fn env_value(&self, key: &str) -> Option<&str> {
        let prefix = format!("{}=", key);
        self.env
            .iter()
            .find_map(|e| e.strip_prefix(prefix.as_str()))
    }

    /// Set an environment variable, replacing an existing value
    pub fn set_env(&mut self, key: &str, value: &str) {
        let prefix = format!("{}=", key);
        self.env.retain(|e| !e.starts_with(&prefix));
        self.env.push(format!("{}={}", key, value));
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg || a.starts_with(&format!("{}=", arg)))
    }

    pub fn add_port(&mut self, mapping: PortMapping) {
        self.ports
            .entry(mapping.container_port)
            .or_default()
            .push(mapping.binding);
    }

    pub fn hooks_for(&self, stage: HookStage) -> impl Iterator<Item = &NodeHook> {
        self.hooks.iter().filter(move |h| h.stage == stage)
    }
}

/// Standard node name: `k3d-<cluster>-<suffix>`
pub fn node_name(cluster: &str, suffix: &str) -> String {
    format!("k3d-{}-{}", cluster, suffix)
}
