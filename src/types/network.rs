//! Cluster network and its IP address management state

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Default network name for a cluster: `k3d-<cluster>`
pub fn default_network_name(cluster: &str) -> String {
    format!("k3d-{}", cluster)
}

/// Subnet state of a network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipam {
    /// Subnet of the network, known once the runtime created/inspected it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_prefix: Option<Ipv4Net>,
    /// Gateway reported by the runtime, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    /// Addresses handed out to nodes; never contains duplicates
    #[serde(default)]
    pub ips_used: Vec<Ipv4Addr>,
    /// Nodes get static IPs from the allocator
    #[serde(default)]
    pub managed: bool,
}

impl Ipam {
    /// Record an address as used. Returns false if it already was.
    pub fn mark_used(&mut self, ip: Ipv4Addr) -> bool {
        if self.ips_used.contains(&ip) {
            return false;
        }
        self.ips_used.push(ip);
        true
    }

    /// The address treated as gateway: the reported one, or the first host
    /// address of the prefix
    pub fn effective_gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
            .or_else(|| self.ip_prefix.and_then(|prefix| prefix.hosts().next()))
    }
}

/// A container attached to a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMember {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
}

/// The bridge network all nodes of a cluster are attached to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNetwork {
    pub name: String,
    #[serde(default)]
    pub id: String,
    /// Managed by the caller; never deleted with the cluster
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub ipam: Ipam,
    #[serde(default)]
    pub members: Vec<NetworkMember>,
}

impl ClusterNetwork {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The `host` network mode of the runtime rather than a bridge
    pub fn is_host(&self) -> bool {
        self.name == "host"
    }
}
