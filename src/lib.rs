//! k3d: multi-node k3s clusters in Docker containers

pub mod cli;
pub mod cluster;
pub mod config;
pub mod loadbalancer;
pub mod network;
pub mod nodefilter;
pub mod runtime;
pub mod types;
