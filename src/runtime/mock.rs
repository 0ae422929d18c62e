//! Recording in-memory runtime for orchestrator tests

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::{Runtime, RuntimeError};
use crate::types::{ClusterNetwork, HookAction, HookStage, NetworkMember, Node};

/// Log output containing every readiness marker
pub const READY_LOG: &str = "level=info msg=\"Containerd is now running\"\n\
    level=info msg=\"Running kube-apiserver --advertise-port=6443\"\n\
    level=info msg=\"Successfully registered node\"\n\
    start worker processes\n\
    listening on [::]:5000\n";

/// One recorded runtime call
#[derive(Debug, Clone)]
pub struct MockCall {
    pub op: &'static str,
    pub target: String,
    pub at: Instant,
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    nodes: Vec<Node>,
    networks: HashMap<String, ClusterNetwork>,
    volumes: HashMap<String, HashMap<String, String>>,
    failures: HashSet<(String, String)>,
    /// node -> (log, number of reads before it shows up)
    logs: HashMap<String, (String, usize)>,
    log_reads: HashMap<String, usize>,
    restart_counts: HashMap<String, u32>,
    written_files: Vec<(String, String, Vec<u8>)>,
    next_subnet: u8,
}

/// A [`Runtime`] that keeps containers, networks and volumes in memory and
/// records every call
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn record(&self, op: &'static str, target: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.calls.push(MockCall {
            op,
            target: target.to_string(),
            at: Instant::now(),
        });
        if state.failures.contains(&(op.to_string(), target.to_string())) {
            return Err(RuntimeError::command_failed(op, target, "scripted failure"));
        }
        Ok(())
    }

    /// Make every `op` call against `target` fail
    pub fn fail(&self, op: &str, target: &str) {
        self.lock()
            .failures
            .insert((op.to_string(), target.to_string()));
    }

    /// Serve `log` for `node` starting with the `after`-th read (1-based);
    /// earlier reads return nothing
    pub fn set_logs(&self, node: &str, log: &str, after: usize) {
        self.lock()
            .logs
            .insert(node.to_string(), (log.to_string(), after.max(1)));
    }

    pub fn set_restart_count(&self, node: &str, count: u32) {
        self.lock().restart_counts.insert(node.to_string(), count);
    }

    /// Seed a pre-existing container
    pub fn add_node(&self, node: Node) {
        self.lock().nodes.push(node);
    }

    /// Seed a pre-existing volume
    pub fn add_volume(&self, name: &str, labels: HashMap<String, String>) {
        self.lock().volumes.insert(name.to_string(), labels);
    }

    /// Seed a pre-existing network
    pub fn add_network(&self, network: ClusterNetwork) {
        self.lock().networks.insert(network.name.clone(), network);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Targets of all calls of one kind, in call order
    pub fn targets(&self, op: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.target.clone())
            .collect()
    }

    /// Index of the first matching call in the call log
    pub fn position(&self, op: &str, target: &str) -> Option<usize> {
        self.lock()
            .calls
            .iter()
            .position(|c| c.op == op && c.target == target)
    }

    pub fn log_reads(&self, node: &str) -> usize {
        self.lock().log_reads.get(node).copied().unwrap_or(0)
    }

    pub fn node_names(&self) -> Vec<String> {
        self.lock().nodes.iter().map(|n| n.name.clone()).collect()
    }

    pub fn stored_node(&self, name: &str) -> Option<Node> {
        self.lock().nodes.iter().find(|n| n.name == name).cloned()
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.lock().networks.contains_key(name)
    }

    pub fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().volumes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Files written into containers by pre-start hooks: (node, dest, content)
    pub fn written_files(&self) -> Vec<(String, String, Vec<u8>)> {
        self.lock().written_files.clone()
    }

    fn with_members(state: &MockState, network: &ClusterNetwork) -> ClusterNetwork {
        let mut network = network.clone();
        network.members = state
            .nodes
            .iter()
            .filter(|n| n.networks.contains(&network.name))
            .map(|n| NetworkMember {
                name: n.name.clone(),
                ip: n.ip.ip,
            })
            .collect();
        network
    }
}

fn labels_match(have: &HashMap<String, String>, want: &HashMap<String, String>) -> bool {
    want.iter().all(|(k, v)| have.get(k) == Some(v))
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn create_network_if_not_present(
        &self,
        network: &ClusterNetwork,
        _labels: &HashMap<String, String>,
    ) -> Result<(ClusterNetwork, bool), RuntimeError> {
        self.record("create_network", &network.name)?;
        let mut state = self.lock();
        if let Some(existing) = state.networks.get(&network.name) {
            return Ok((Self::with_members(&state, existing), true));
        }

        let mut created = network.clone();
        created.id = format!("net-{}", network.name);
        if created.ipam.ip_prefix.is_none() {
            let octet = 20 + state.next_subnet;
            state.next_subnet += 1;
            created.ipam.ip_prefix = format!("172.{}.0.0/16", octet).parse().ok();
            created.ipam.gateway = Some(Ipv4Addr::new(172, octet, 0, 1));
        }
        state.networks.insert(created.name.clone(), created.clone());
        Ok((created, false))
    }

    async fn get_network(&self, name: &str) -> Result<Option<ClusterNetwork>, RuntimeError> {
        let state = self.lock();
        Ok(state.networks.get(name).map(|n| Self::with_members(&state, n)))
    }

    async fn delete_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("delete_network", name)?;
        let mut state = self.lock();
        if state.nodes.iter().any(|n| n.networks.iter().any(|net| net == name)) {
            return Err(RuntimeError::NetworkInUse(name.to_string()));
        }
        state
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NetworkNotFound(name.to_string()))
    }

    async fn get_nodes_in_network(&self, network: &str) -> Result<Vec<Node>, RuntimeError> {
        Ok(self
            .lock()
            .nodes
            .iter()
            .filter(|n| n.networks.iter().any(|net| net == network))
            .cloned()
            .collect())
    }

    async fn connect_node_to_network(&self, node: &Node, network: &str) -> Result<(), RuntimeError> {
        self.record("connect_network", &node.name)?;
        let mut state = self.lock();
        let stored = state
            .nodes
            .iter_mut()
            .find(|n| n.name == node.name)
            .ok_or_else(|| RuntimeError::NodeNotFound(node.name.clone()))?;
        if !stored.networks.iter().any(|n| n == network) {
            stored.networks.push(network.to_string());
        }
        Ok(())
    }

    async fn disconnect_node_from_network(&self, node: &Node, network: &str) -> Result<(), RuntimeError> {
        self.record("disconnect_network", &node.name)?;
        let mut state = self.lock();
        let stored = state
            .nodes
            .iter_mut()
            .find(|n| n.name == node.name)
            .ok_or_else(|| RuntimeError::NodeNotFound(node.name.clone()))?;
        stored.networks.retain(|n| n != network);
        Ok(())
    }

    async fn create_node(&self, node: &Node) -> Result<(), RuntimeError> {
        self.record("create_node", &node.name)?;
        let mut state = self.lock();
        if state.nodes.iter().any(|n| n.name == node.name) {
            return Err(RuntimeError::command_failed(
                "create_node",
                &node.name,
                "name already in use",
            ));
        }
        let mut stored = node.clone();
        stored.state.status = "created".to_string();
        state.nodes.push(stored);
        Ok(())
    }

    async fn start_node(&self, node: &Node) -> Result<(), RuntimeError> {
        self.record("start_node", &node.name)?;
        let mut state = self.lock();
        for hook in node.hooks_for(HookStage::PreStart) {
            let HookAction::WriteFile { dest, content, .. } = &hook.action;
            state
                .written_files
                .push((node.name.clone(), dest.clone(), content.clone()));
        }
        let stored = state
            .nodes
            .iter_mut()
            .find(|n| n.name == node.name)
            .ok_or_else(|| RuntimeError::NodeNotFound(node.name.clone()))?;
        stored.state.running = true;
        stored.state.status = "running".to_string();
        stored.state.started = Some(Utc::now());
        Ok(())
    }

    async fn stop_node(&self, node: &Node) -> Result<(), RuntimeError> {
        self.record("stop_node", &node.name)?;
        let mut state = self.lock();
        if let Some(stored) = state.nodes.iter_mut().find(|n| n.name == node.name) {
            stored.state.running = false;
            stored.state.status = "exited".to_string();
        }
        Ok(())
    }

    async fn delete_node(&self, node: &Node) -> Result<(), RuntimeError> {
        self.record("delete_node", &node.name)?;
        let mut state = self.lock();
        let before = state.nodes.len();
        state.nodes.retain(|n| n.name != node.name);
        if state.nodes.len() == before {
            return Err(RuntimeError::NodeNotFound(node.name.clone()));
        }
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Node, RuntimeError> {
        let state = self.lock();
        let mut node = state
            .nodes
            .iter()
            .find(|n| n.name == name)
            .cloned()
            .ok_or_else(|| RuntimeError::NodeNotFound(name.to_string()))?;
        node.state.restart_count = state.restart_counts.get(name).copied().unwrap_or(0);
        Ok(node)
    }

    async fn get_nodes_by_label(&self, labels: &HashMap<String, String>) -> Result<Vec<Node>, RuntimeError> {
        Ok(self
            .lock()
            .nodes
            .iter()
            .filter(|n| labels_match(&n.runtime_labels, labels))
            .cloned()
            .collect())
    }

    async fn get_node_logs(&self, node: &Node, _since: Option<DateTime<Utc>>) -> Result<String, RuntimeError> {
        self.record("get_node_logs", &node.name)?;
        let mut state = self.lock();
        let reads = {
            let reads = state.log_reads.entry(node.name.clone()).or_insert(0);
            *reads += 1;
            *reads
        };
        match state.logs.get(&node.name) {
            Some((log, after)) if reads >= *after => Ok(log.clone()),
            Some(_) => Ok(String::new()),
            None => Ok(READY_LOG.to_string()),
        }
    }

    async fn exec_in_node(&self, node: &Node, _cmd: &[String]) -> Result<String, RuntimeError> {
        self.record("exec", &node.name)?;
        Ok(String::new())
    }

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<(), RuntimeError> {
        self.record("create_volume", name)?;
        self.lock().volumes.insert(name.to_string(), labels.clone());
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("delete_volume", name)?;
        self.lock().volumes.remove(name);
        Ok(())
    }

    async fn get_volumes_by_label(&self, labels: &HashMap<String, String>) -> Result<Vec<String>, RuntimeError> {
        let mut names: Vec<String> = self
            .lock()
            .volumes
            .iter()
            .filter(|(_, l)| labels_match(l, labels))
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}
