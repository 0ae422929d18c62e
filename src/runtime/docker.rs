//! Docker runtime
//!
//! Implements [`Runtime`] by driving the `docker` CLI. Argument vectors are
//! built by pure `generate_*_args` functions and inspect output is parsed by
//! pure `parse_*` functions, so only [`DockerRuntime::docker`] does I/O.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, trace};

use super::{Runtime, RuntimeError};
use crate::types::{
    labels, ClusterNetwork, HookAction, HookStage, Ipam, NetworkMember, Node, NodeIP, NodeState,
    PortBinding, Role,
};

/// Docker reports this when removing a network that still has containers
const NETWORK_IN_USE_MARKER: &str = "active endpoints";

/// Docker's wordings for a network that does not exist
const NETWORK_MISSING_MARKERS: &[&str] = &["No such network", "not found"];

// ============================================================================
// Pure business logic (no I/O)
// ============================================================================

fn label_args(labels: &HashMap<String, String>) -> Vec<String> {
    let mut sorted: Vec<_> = labels.iter().collect();
    sorted.sort();
    sorted
        .into_iter()
        .flat_map(|(k, v)| ["--label".to_string(), format!("{}={}", k, v)])
        .collect()
}

fn label_filter_args(labels: &HashMap<String, String>) -> Vec<String> {
    let mut sorted: Vec<_> = labels.iter().collect();
    sorted.sort();
    sorted
        .into_iter()
        .flat_map(|(k, v)| ["--filter".to_string(), format!("label={}={}", k, v)])
        .collect()
}

/// `docker network create`
pub fn generate_network_create_args(
    network: &ClusterNetwork,
    labels: &HashMap<String, String>,
) -> Vec<String> {
    let mut args = vec![
        "network".to_string(),
        "create".to_string(),
        "--driver".to_string(),
        "bridge".to_string(),
    ];
    args.extend(label_args(labels));
    if let Some(prefix) = network.ipam.ip_prefix {
        args.push("--subnet".to_string());
        args.push(prefix.to_string());
        if let Some(gateway) = network.ipam.gateway {
            args.push("--gateway".to_string());
            args.push(gateway.to_string());
        }
    }
    args.push(network.name.clone());
    args
}

/// `docker create` for a node
pub fn generate_create_args(node: &Node) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        node.name.clone(),
        "--hostname".to_string(),
        node.name.clone(),
    ];

    if matches!(node.role, Role::Server | Role::Agent) {
        // k3s needs a writable cgroup hierarchy and its own /run
        args.push("--privileged".to_string());
        for tmpfs in ["/run", "/var/run"] {
            args.push("--tmpfs".to_string());
            args.push(tmpfs.to_string());
        }
    }

    if node.restart {
        args.push("--restart".to_string());
        args.push("unless-stopped".to_string());
    }

    args.extend(label_args(&node.runtime_labels));

    for env in &node.env {
        args.push("-e".to_string());
        args.push(env.clone());
    }

    for volume in &node.volumes {
        args.push("-v".to_string());
        args.push(volume.clone());
    }

    for (container_port, bindings) in &node.ports {
        for binding in bindings {
            let host = match (&binding.host_ip, &binding.host_port) {
                (Some(ip), Some(port)) => format!("{}:{}:", ip, port),
                (Some(ip), None) => format!("{}::", ip),
                (None, Some(port)) => format!("{}:", port),
                (None, None) => String::new(),
            };
            args.push("-p".to_string());
            args.push(format!("{}{}", host, container_port));
        }
    }

    // Only the first network can be given at create time; the rest are
    // connected afterwards
    if let Some(network) = node.networks.first() {
        args.push("--network".to_string());
        args.push(network.clone());
        if let (Some(ip), true) = (node.ip.ip, node.ip.is_static) {
            args.push("--ip".to_string());
            args.push(ip.to_string());
        }
    }

    if !node.cmd.is_empty() {
        args.push("--entrypoint".to_string());
        args.push(node.cmd[0].clone());
    }

    args.push(node.image.clone());
    args.extend(node.cmd.iter().skip(1).cloned());
    args.extend(node.args.iter().cloned());
    args
}

/// `docker logs`
pub fn generate_logs_args(name: &str, since: Option<DateTime<Utc>>) -> Vec<String> {
    let mut args = vec!["logs".to_string()];
    if let Some(since) = since {
        args.push("--since".to_string());
        args.push(since.to_rfc3339());
    }
    args.push(name.to_string());
    args
}

/// `docker exec`
pub fn generate_exec_args(name: &str, cmd: &[String]) -> Vec<String> {
    let mut args = vec!["exec".to_string(), name.to_string()];
    args.extend(cmd.iter().cloned());
    args
}

/// `docker ps` listing container names by label
pub fn generate_list_by_label_args(labels: &HashMap<String, String>) -> Vec<String> {
    let mut args = vec!["ps".to_string(), "-a".to_string()];
    args.extend(label_filter_args(labels));
    args.push("--format".to_string());
    args.push("{{.Names}}".to_string());
    args
}

/// `docker volume create`
pub fn generate_volume_create_args(name: &str, labels: &HashMap<String, String>) -> Vec<String> {
    let mut args = vec!["volume".to_string(), "create".to_string()];
    args.extend(label_args(labels));
    args.push(name.to_string());
    args
}

/// `docker volume ls` listing volume names by label
pub fn generate_volume_list_args(labels: &HashMap<String, String>) -> Vec<String> {
    let mut args = vec!["volume".to_string(), "ls".to_string()];
    args.extend(label_filter_args(labels));
    args.push("--format".to_string());
    args.push("{{.Name}}".to_string());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectContainer {
    name: String,
    #[serde(default)]
    restart_count: u32,
    config: InspectConfig,
    state: InspectState,
    #[serde(default)]
    host_config: InspectHostConfig,
    #[serde(default)]
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    cmd: Option<Vec<String>>,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
    #[serde(default)]
    status: String,
    #[serde(default)]
    started_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    #[serde(default)]
    port_bindings: Option<HashMap<String, Option<Vec<InspectPortBinding>>>>,
    #[serde(default)]
    binds: Option<Vec<String>>,
    #[serde(default)]
    restart_policy: Option<InspectRestartPolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRestartPolicy {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct InspectPortBinding {
    #[serde(rename = "HostIp", default)]
    host_ip: String,
    #[serde(rename = "HostPort", default)]
    host_port: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    networks: Option<BTreeMap<String, InspectEndpoint>>,
}

#[derive(Debug, Deserialize)]
struct InspectEndpoint {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

/// Parse `docker inspect --type container` output into nodes
pub fn parse_container_inspect(json: &str) -> Result<Vec<Node>, RuntimeError> {
    let containers: Vec<InspectContainer> =
        serde_json::from_str(json).map_err(|e| RuntimeError::Parse(e.to_string()))?;

    Ok(containers.into_iter().map(node_from_inspect).collect())
}

fn node_from_inspect(c: InspectContainer) -> Node {
    let runtime_labels = c.config.labels.unwrap_or_default();
    let role = runtime_labels
        .get(labels::LABEL_ROLE)
        .and_then(|r| r.parse().ok())
        .unwrap_or_default();

    let networks = c.network_settings.networks.unwrap_or_default();
    let cluster_network = runtime_labels.get(labels::LABEL_NETWORK);
    let ip = cluster_network
        .and_then(|n| networks.get(n))
        .or_else(|| networks.values().next())
        .and_then(|e| e.ip_address.parse::<Ipv4Addr>().ok());

    let mut ports: BTreeMap<String, Vec<PortBinding>> = BTreeMap::new();
    for (port, bindings) in c.host_config.port_bindings.unwrap_or_default() {
        let bindings = bindings
            .unwrap_or_default()
            .into_iter()
            .map(|b| PortBinding {
                host_ip: Some(b.host_ip).filter(|s| !s.is_empty()),
                host_port: Some(b.host_port).filter(|s| !s.is_empty()),
            })
            .collect();
        ports.insert(port, bindings);
    }

    let started = c
        .state
        .started_at
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
        .filter(|t| t.timestamp() > 0);

    Node {
        name: c.name.trim_start_matches('/').to_string(),
        role,
        image: c.config.image,
        cmd: Vec::new(),
        args: c.config.cmd.unwrap_or_default(),
        env: c.config.env.unwrap_or_default(),
        ports,
        volumes: c.host_config.binds.unwrap_or_default(),
        networks: networks.keys().cloned().collect(),
        ip: NodeIP {
            ip,
            is_static: labels::is_true(&runtime_labels, labels::LABEL_NODE_STATIC_IP),
        },
        server_opts: crate::types::ServerOpts {
            is_init: labels::is_true(&runtime_labels, labels::LABEL_SERVER_IS_INIT),
            kube_api: None,
        },
        restart: c
            .host_config
            .restart_policy
            .map(|p| p.name == "unless-stopped" || p.name == "always")
            .unwrap_or(false),
        runtime_labels,
        state: NodeState {
            running: c.state.running,
            status: c.state.status,
            started,
            restart_count: c.restart_count,
        },
        hooks: Vec::new(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    name: String,
    id: String,
    #[serde(rename = "IPAM", default)]
    ipam: Option<InspectIpam>,
    #[serde(default)]
    containers: Option<HashMap<String, InspectNetworkContainer>>,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectIpam {
    #[serde(default)]
    config: Option<Vec<InspectIpamConfig>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectIpamConfig {
    #[serde(default)]
    subnet: Option<String>,
    #[serde(default)]
    gateway: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkContainer {
    name: String,
    #[serde(rename = "IPv4Address", default)]
    ipv4_address: String,
}

/// Parse `docker network inspect` output
pub fn parse_network_inspect(json: &str) -> Result<Vec<ClusterNetwork>, RuntimeError> {
    let networks: Vec<InspectNetwork> =
        serde_json::from_str(json).map_err(|e| RuntimeError::Parse(e.to_string()))?;

    Ok(networks
        .into_iter()
        .map(|n| {
            // first IPv4 subnet wins; IPv6 configs fail to parse and are skipped
            let config = n
                .ipam
                .and_then(|i| i.config)
                .unwrap_or_default()
                .into_iter()
                .find(|c| c.subnet.as_deref().and_then(|s| s.parse::<ipnet::Ipv4Net>().ok()).is_some());

            let mut members: Vec<NetworkMember> = n
                .containers
                .unwrap_or_default()
                .into_values()
                .map(|c| NetworkMember {
                    name: c.name,
                    ip: c
                        .ipv4_address
                        .split('/')
                        .next()
                        .and_then(|ip| ip.parse().ok()),
                })
                .collect();
            members.sort_by(|a, b| a.name.cmp(&b.name));

            let ips_used = members.iter().filter_map(|m| m.ip).collect();

            ClusterNetwork {
                external: n
                    .labels
                    .as_ref()
                    .map(|l| labels::is_true(l, labels::LABEL_NETWORK_EXTERNAL))
                    .unwrap_or(false),
                name: n.name,
                id: n.id,
                ipam: Ipam {
                    ip_prefix: config
                        .as_ref()
                        .and_then(|c| c.subnet.as_deref())
                        .and_then(|s| s.parse().ok()),
                    gateway: config
                        .as_ref()
                        .and_then(|c| c.gateway.as_deref())
                        .and_then(|g| g.parse().ok()),
                    ips_used,
                    managed: false,
                },
                members,
            }
        })
        .collect())
}

/// Map a failed `docker network` call onto the typed network errors
pub fn classify_network_error(name: &str, error: RuntimeError) -> RuntimeError {
    match error {
        RuntimeError::CommandFailed { ref message, .. } if message.contains(NETWORK_IN_USE_MARKER) => {
            RuntimeError::NetworkInUse(name.to_string())
        }
        RuntimeError::CommandFailed { ref message, .. }
            if NETWORK_MISSING_MARKERS.iter().any(|m| message.contains(m)) =>
        {
            RuntimeError::NetworkNotFound(name.to_string())
        }
        RuntimeError::NodeNotFound(_) => RuntimeError::NetworkNotFound(name.to_string()),
        other => other,
    }
}

fn split_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// I/O implementation (docker CLI)
// ============================================================================

/// [`Runtime`] backed by the `docker` CLI
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
    work_dir: PathBuf,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self {
            binary: std::env::var("K3D_DOCKER_BINARY").unwrap_or_else(|_| "docker".to_string()),
            work_dir: std::env::temp_dir().join("k3d-hooks"),
        }
    }

    /// Run a docker command and return its stdout.
    ///
    /// `op`/`target` only label the error.
    async fn docker(&self, args: &[String], op: &str, target: &str) -> Result<String, RuntimeError> {
        trace!("{} {}", self.binary, args.join(" "));

        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => RuntimeError::NotAvailable(format!(
                    "'{}' not found in PATH",
                    self.binary
                )),
                _ => RuntimeError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("No such container") || stderr.contains("No such object") {
                return Err(RuntimeError::NodeNotFound(target.to_string()));
            }
            return Err(RuntimeError::command_failed(op, target, stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Children die with the future awaiting them
    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    async fn inspect_nodes(&self, names: &[String]) -> Result<Vec<Node>, RuntimeError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["inspect".to_string(), "--type".to_string(), "container".to_string()];
        args.extend(names.iter().cloned());
        let out = self.docker(&args, "inspect", &names.join(",")).await?;
        parse_container_inspect(&out)
    }

    async fn run_pre_start_hooks(&self, node: &Node) -> Result<(), RuntimeError> {
        for hook in node.hooks_for(HookStage::PreStart) {
            match &hook.action {
                HookAction::WriteFile {
                    dest,
                    content,
                    mode,
                    description,
                } => {
                    debug!("Running pre-start hook on '{}': {}", node.name, description);

                    tokio::fs::create_dir_all(&self.work_dir).await?;
                    let local = self
                        .work_dir
                        .join(format!("{}-{}", node.name, dest.replace('/', "_")));
                    tokio::fs::write(&local, content).await?;
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        tokio::fs::set_permissions(&local, std::fs::Permissions::from_mode(*mode)).await?;
                    }
                    #[cfg(not(unix))]
                    let _ = mode;

                    let args = vec![
                        "cp".to_string(),
                        local.to_string_lossy().into_owned(),
                        format!("{}:{}", node.name, dest),
                    ];
                    let result = self.docker(&args, "copy hook file into", &node.name).await;
                    let _ = tokio::fs::remove_file(&local).await;
                    result?;
                }
            }
        }
        Ok(())
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn create_network_if_not_present(
        &self,
        network: &ClusterNetwork,
        labels: &HashMap<String, String>,
    ) -> Result<(ClusterNetwork, bool), RuntimeError> {
        if let Some(existing) = self.get_network(&network.name).await? {
            return Ok((existing, true));
        }

        let args = generate_network_create_args(network, labels);
        self.docker(&args, "create network", &network.name).await?;

        let created = self
            .get_network(&network.name)
            .await?
            .ok_or_else(|| RuntimeError::NetworkNotFound(network.name.clone()))?;
        Ok((created, false))
    }

    async fn get_network(&self, name: &str) -> Result<Option<ClusterNetwork>, RuntimeError> {
        let args = vec!["network".to_string(), "inspect".to_string(), name.to_string()];
        match self.docker(&args, "inspect network", name).await {
            Ok(out) => Ok(parse_network_inspect(&out)?.into_iter().next()),
            Err(e) => match classify_network_error(name, e) {
                RuntimeError::NetworkNotFound(_) => Ok(None),
                e => Err(e),
            },
        }
    }

    async fn delete_network(&self, name: &str) -> Result<(), RuntimeError> {
        let args = vec!["network".to_string(), "rm".to_string(), name.to_string()];
        self.docker(&args, "delete network", name)
            .await
            .map(|_| ())
            .map_err(|e| classify_network_error(name, e))
    }

    async fn get_nodes_in_network(&self, network: &str) -> Result<Vec<Node>, RuntimeError> {
        let net = self
            .get_network(network)
            .await?
            .ok_or_else(|| RuntimeError::NetworkNotFound(network.to_string()))?;
        let names: Vec<String> = net.members.into_iter().map(|m| m.name).collect();
        self.inspect_nodes(&names).await
    }

    async fn connect_node_to_network(&self, node: &Node, network: &str) -> Result<(), RuntimeError> {
        let args = vec![
            "network".to_string(),
            "connect".to_string(),
            network.to_string(),
            node.name.clone(),
        ];
        self.docker(&args, "connect node", &node.name).await.map(|_| ())
    }

    async fn disconnect_node_from_network(&self, node: &Node, network: &str) -> Result<(), RuntimeError> {
        let args = vec![
            "network".to_string(),
            "disconnect".to_string(),
            network.to_string(),
            node.name.clone(),
        ];
        self.docker(&args, "disconnect node", &node.name).await.map(|_| ())
    }

    async fn create_node(&self, node: &Node) -> Result<(), RuntimeError> {
        let args = generate_create_args(node);
        debug!("Docker create args: {:?}", args);
        self.docker(&args, "create node", &node.name).await?;

        for network in node.networks.iter().skip(1) {
            self.connect_node_to_network(node, network).await?;
        }
        Ok(())
    }

    async fn start_node(&self, node: &Node) -> Result<(), RuntimeError> {
        self.run_pre_start_hooks(node).await?;
        let args = vec!["start".to_string(), node.name.clone()];
        self.docker(&args, "start node", &node.name).await.map(|_| ())
    }

    async fn stop_node(&self, node: &Node) -> Result<(), RuntimeError> {
        let args = vec!["stop".to_string(), node.name.clone()];
        self.docker(&args, "stop node", &node.name).await.map(|_| ())
    }

    async fn delete_node(&self, node: &Node) -> Result<(), RuntimeError> {
        let args = vec![
            "rm".to_string(),
            "--force".to_string(),
            "--volumes".to_string(),
            node.name.clone(),
        ];
        self.docker(&args, "delete node", &node.name).await.map(|_| ())
    }

    async fn get_node(&self, name: &str) -> Result<Node, RuntimeError> {
        self.inspect_nodes(&[name.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError::NodeNotFound(name.to_string()))
    }

    async fn get_nodes_by_label(&self, labels: &HashMap<String, String>) -> Result<Vec<Node>, RuntimeError> {
        let args = generate_list_by_label_args(labels);
        let out = self.docker(&args, "list nodes", "by label").await?;
        self.inspect_nodes(&split_lines(&out)).await
    }

    async fn get_node_logs(&self, node: &Node, since: Option<DateTime<Utc>>) -> Result<String, RuntimeError> {
        let args = generate_logs_args(&node.name, since);
        // k3s logs to stderr, so both streams are read
        let output = self.command(&args).output().await?;
        if !output.status.success() {
            return Err(RuntimeError::command_failed(
                "read logs of",
                &node.name,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    async fn exec_in_node(&self, node: &Node, cmd: &[String]) -> Result<String, RuntimeError> {
        let args = generate_exec_args(&node.name, cmd);
        self.docker(&args, "exec in", &node.name).await
    }

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<(), RuntimeError> {
        let args = generate_volume_create_args(name, labels);
        self.docker(&args, "create volume", name).await.map(|_| ())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let args = vec!["volume".to_string(), "rm".to_string(), name.to_string()];
        self.docker(&args, "delete volume", name).await.map(|_| ())
    }

    async fn get_volumes_by_label(&self, labels: &HashMap<String, String>) -> Result<Vec<String>, RuntimeError> {
        let args = generate_volume_list_args(labels);
        let out = self.docker(&args, "list volumes", "by label").await?;
        Ok(split_lines(&out))
    }
}
