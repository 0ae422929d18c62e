//! Cluster network management and static IP allocation
//!
//! Networks that already exist when a cluster is created belong to the
//! caller: they are returned as `external` and never deleted with the
//! cluster. The allocator has no lock; callers assign every address before
//! any concurrent node creation starts.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::{debug, info};

use crate::runtime::{Runtime, RuntimeError};
use crate::types::{ClusterNetwork, Ipam};

/// Suffix of the throwaway network used to learn a free subnet
const PROBE_SUFFIX: &str = "ipam-probe";

/// Network and IPAM errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Network '{0}' has no IPv4 subnet")]
    NoSubnet(String),

    #[error("No free IP address left in {prefix}")]
    Exhausted { prefix: String },
}

/// Look up a network by name and create it if absent.
///
/// An existing network is returned with `external` set. When `network.ipam`
/// is managed but carries no prefix, a probe network is created to learn a
/// runtime-assigned free subnet, deleted again, and its prefix reused for
/// the real network. Returns the network and whether it existed.
pub async fn create_network_if_not_present<R: Runtime + ?Sized>(
    runtime: &R,
    network: &ClusterNetwork,
    labels: &HashMap<String, String>,
) -> Result<(ClusterNetwork, bool), NetworkError> {
    if network.is_host() {
        debug!("Using host network, nothing to create");
        let mut host = network.clone();
        host.external = true;
        return Ok((host, true));
    }

    if let Some(mut existing) = runtime.get_network(&network.name).await? {
        info!("Re-using existing network '{}' ({})", existing.name, existing.id);
        existing.external = true;
        existing.ipam.managed = network.ipam.managed;
        return Ok((existing, true));
    }

    let mut wanted = network.clone();
    if wanted.ipam.managed && wanted.ipam.ip_prefix.is_none() {
        let (prefix, gateway) = probe_free_subnet(runtime, &network.name, labels).await?;
        wanted.ipam.ip_prefix = Some(prefix);
        wanted.ipam.gateway = gateway;
    }

    let (mut created, existed) = runtime.create_network_if_not_present(&wanted, labels).await?;
    created.external = existed || network.external;
    created.ipam.managed = network.ipam.managed;
    if created.ipam.ip_prefix.is_none() {
        created.ipam.ip_prefix = wanted.ipam.ip_prefix;
    }
    for ip in network.ipam.ips_used.iter().copied() {
        created.ipam.mark_used(ip);
    }

    info!(
        "Created network '{}'{}",
        created.name,
        created
            .ipam
            .ip_prefix
            .map(|p| format!(" with subnet {}", p))
            .unwrap_or_default()
    );
    Ok((created, existed))
}

async fn probe_free_subnet<R: Runtime + ?Sized>(
    runtime: &R,
    name: &str,
    labels: &HashMap<String, String>,
) -> Result<(ipnet::Ipv4Net, Option<Ipv4Addr>), NetworkError> {
    let probe = ClusterNetwork::new(format!("{}-{}", name, PROBE_SUFFIX));
    debug!("Creating probe network '{}' to find a free subnet", probe.name);

    let (created, _) = runtime.create_network_if_not_present(&probe, labels).await?;
    runtime.delete_network(&probe.name).await?;

    let prefix = created
        .ipam
        .ip_prefix
        .ok_or_else(|| NetworkError::NoSubnet(probe.name.clone()))?;
    debug!("Runtime assigned subnet {} to probe network", prefix);
    Ok((prefix, created.ipam.gateway))
}

/// Next free host address of the network's prefix.
///
/// Skips the network, broadcast and gateway addresses as well as every
/// address in `ips_used`. The caller must record the result with
/// [`Ipam::mark_used`] before asking again.
pub fn get_ip(network_name: &str, ipam: &Ipam) -> Result<Ipv4Addr, NetworkError> {
    let prefix = ipam
        .ip_prefix
        .ok_or_else(|| NetworkError::NoSubnet(network_name.to_string()))?;
    let gateway = ipam.effective_gateway();

    prefix
        .hosts()
        .find(|ip| Some(*ip) != gateway && !ipam.ips_used.contains(ip))
        .ok_or_else(|| NetworkError::Exhausted {
            prefix: prefix.to_string(),
        })
}

/// [`get_ip`] and record the address as used
pub fn allocate_ip(network: &mut ClusterNetwork) -> Result<Ipv4Addr, NetworkError> {
    let ip = get_ip(&network.name, &network.ipam)?;
    network.ipam.mark_used(ip);
    debug!("Allocated {} in network '{}'", ip, network.name);
    Ok(ip)
}
