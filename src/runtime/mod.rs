//! Container runtime abstraction
//!
//! The orchestrator never talks to a container engine directly. Everything it
//! needs is behind [`Runtime`], implemented for the Docker CLI by
//! [`DockerRuntime`] and by a recording mock in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{ClusterNetwork, Node};

pub mod docker;
#[cfg(test)]
pub mod mock;

pub use docker::DockerRuntime;

/// Errors reported by a container runtime
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Container runtime not available: {0}")]
    NotAvailable(String),

    #[error("Failed to {op} '{target}': {message}")]
    CommandFailed {
        op: String,
        target: String,
        message: String,
    },

    #[error("Node '{0}' not found")]
    NodeNotFound(String),

    #[error("Network '{0}' not found")]
    NetworkNotFound(String),

    #[error("Network '{0}' still has containers attached")]
    NetworkInUse(String),

    #[error("Failed to parse runtime output: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn command_failed(op: &str, target: &str, message: impl Into<String>) -> Self {
        RuntimeError::CommandFailed {
            op: op.to_string(),
            target: target.to_string(),
            message: message.into(),
        }
    }
}

/// Everything the orchestrator needs from a container engine.
///
/// Calls are cancelled by dropping the returned future.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Create a bridge network unless one with that name exists.
    ///
    /// Returns the inspected network and whether it existed before.
    async fn create_network_if_not_present(
        &self,
        network: &ClusterNetwork,
        labels: &HashMap<String, String>,
    ) -> Result<(ClusterNetwork, bool), RuntimeError>;

    async fn get_network(&self, name: &str) -> Result<Option<ClusterNetwork>, RuntimeError>;

    /// Fails with [`RuntimeError::NetworkInUse`] while containers are attached
    async fn delete_network(&self, name: &str) -> Result<(), RuntimeError>;

    async fn get_nodes_in_network(&self, network: &str) -> Result<Vec<Node>, RuntimeError>;

    async fn connect_node_to_network(&self, node: &Node, network: &str) -> Result<(), RuntimeError>;

    async fn disconnect_node_from_network(&self, node: &Node, network: &str) -> Result<(), RuntimeError>;

    /// Create the container without starting it
    async fn create_node(&self, node: &Node) -> Result<(), RuntimeError>;

    /// Run the node's pre-start hooks, then start the container
    async fn start_node(&self, node: &Node) -> Result<(), RuntimeError>;

    async fn stop_node(&self, node: &Node) -> Result<(), RuntimeError>;

    /// Remove the container and its anonymous volumes
    async fn delete_node(&self, node: &Node) -> Result<(), RuntimeError>;

    /// Inspect a single node, including its live state
    async fn get_node(&self, name: &str) -> Result<Node, RuntimeError>;

    /// All nodes carrying every given label
    async fn get_nodes_by_label(&self, labels: &HashMap<String, String>) -> Result<Vec<Node>, RuntimeError>;

    /// Full log output of a node, optionally only since a point in time
    async fn get_node_logs(&self, node: &Node, since: Option<DateTime<Utc>>) -> Result<String, RuntimeError>;

    /// Run a command inside a running node and return its output
    async fn exec_in_node(&self, node: &Node, cmd: &[String]) -> Result<String, RuntimeError>;

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<(), RuntimeError>;

    async fn delete_volume(&self, name: &str) -> Result<(), RuntimeError>;

    async fn get_volumes_by_label(&self, labels: &HashMap<String, String>) -> Result<Vec<String>, RuntimeError>;
}
