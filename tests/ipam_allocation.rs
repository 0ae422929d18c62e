//! Static IP allocation inside a cluster subnet

use std::net::Ipv4Addr;

use k3d::network::{allocate_ip, get_ip, NetworkError};
use k3d::types::{ClusterNetwork, Ipam};

fn network(prefix: &str) -> ClusterNetwork {
    let mut network = ClusterNetwork::new("k3d-dev");
    network.ipam = Ipam {
        ip_prefix: Some(prefix.parse().unwrap()),
        gateway: None,
        ips_used: Vec::new(),
        managed: true,
    };
    network
}

#[test]
fn allocation_skips_gateway_and_is_sequential() {
    let mut network = network("172.28.0.0/16");
    let ips: Vec<Ipv4Addr> = (0..3).map(|_| allocate_ip(&mut network).unwrap()).collect();
    assert_eq!(
        ips,
        vec![
            Ipv4Addr::new(172, 28, 0, 2),
            Ipv4Addr::new(172, 28, 0, 3),
            Ipv4Addr::new(172, 28, 0, 4),
        ]
    );
    assert_eq!(network.ipam.ips_used.len(), 3);
}

#[test]
fn allocated_addresses_are_unique() {
    let mut network = network("10.10.0.0/24");
    network.ipam.mark_used(Ipv4Addr::new(10, 10, 0, 3));

    let mut seen = Vec::new();
    for _ in 0..20 {
        let ip = allocate_ip(&mut network).unwrap();
        assert!(!seen.contains(&ip));
        assert_ne!(ip, Ipv4Addr::new(10, 10, 0, 3));
        seen.push(ip);
    }
}

#[test]
fn get_ip_does_not_reserve() {
    let network = network("10.10.0.0/24");
    let first = get_ip(&network.name, &network.ipam).unwrap();
    let second = get_ip(&network.name, &network.ipam).unwrap();
    assert_eq!(first, second);
}

#[test]
fn exhausted_subnet() {
    // /30 has two hosts, one of them the gateway
    let mut network = network("192.168.5.0/30");
    allocate_ip(&mut network).unwrap();
    assert!(matches!(allocate_ip(&mut network), Err(NetworkError::Exhausted { .. })));
}

#[test]
fn no_subnet() {
    let network = ClusterNetwork::new("k3d-dev");
    assert!(matches!(
        get_ip(&network.name, &network.ipam),
        Err(NetworkError::NoSubnet(name)) if name == "k3d-dev"
    ));
}
