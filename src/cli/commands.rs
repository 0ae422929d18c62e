//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use thiserror::Error;
use tracing::{info, warn};

use super::ClusterCreateArgs;
use crate::cluster::{get_cluster, list_clusters, ClusterError, ClusterOrchestrator, ClusterState};
use crate::config::{
    load_cluster_config_file, parse_duration, ClusterConfig, ClusterConfigError, ConfigError,
    EnvVarWithFilters, LabelWithFilters, PortWithFilters, VolumeWithFilters,
};
use crate::runtime::{Runtime, RuntimeError};
use crate::types::{
    labels, Cluster, ClusterDeleteOpts, ClusterStartOpts, Intent, Node, NodeCreateOpts, NodeSpecError,
    Role,
};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cluster config error: {0}")]
    ClusterConfig(#[from] ClusterConfigError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    NodeSpec(#[from] NodeSpecError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("A cluster named '{0}' already exists")]
    ClusterExists(String),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Argument parsing (pure)
// ============================================================================

/// Split `SPEC@FILTER[;FILTER...]` into the spec and its node filters
pub fn split_node_filters(value: &str) -> (String, Vec<String>) {
    match value.split_once('@') {
        Some((spec, filters)) => (
            spec.to_string(),
            filters
                .split(';')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        None => (value.to_string(), Vec::new()),
    }
}

/// Parse `[HOST_IP:]PORT`
pub fn parse_api_port(value: &str) -> CommandResult<(Option<String>, u16)> {
    let (host_ip, port) = match value.rsplit_once(':') {
        Some((ip, port)) => (Some(ip.to_string()), port),
        None => (None, value),
    };
    let port: u16 = port
        .parse()
        .map_err(|_| CommandError::InvalidArgument(format!("API port '{}' is not a port number", value)))?;
    if port == 0 {
        return Err(CommandError::InvalidArgument("API port must not be 0".to_string()));
    }
    Ok((host_ip, port))
}

/// Overlay command line flags on a (possibly file-loaded) config
pub fn apply_create_args(mut config: ClusterConfig, args: &ClusterCreateArgs) -> CommandResult<ClusterConfig> {
    if let Some(name) = &args.name {
        config.name = name.clone();
    }
    if let Some(servers) = args.servers {
        config.servers = servers;
    }
    if let Some(agents) = args.agents {
        config.agents = agents;
    }
    if args.image.is_some() {
        config.image = args.image.clone();
    }
    if args.network.is_some() {
        config.network = args.network.clone();
    }
    if args.subnet.is_some() {
        config.subnet = args.subnet.clone();
    }
    if args.token.is_some() {
        config.token = args.token.clone();
    }
    if let Some(api_port) = &args.api_port {
        let (host_ip, port) = parse_api_port(api_port)?;
        if host_ip.is_some() {
            config.kube_api.host_ip = host_ip;
        }
        config.kube_api.host_port = Some(port);
    }

    for value in &args.ports {
        let (port, node_filters) = split_node_filters(value);
        config.ports.push(PortWithFilters { port, node_filters });
    }
    for value in &args.volumes {
        let (volume, node_filters) = split_node_filters(value);
        config.volumes.push(VolumeWithFilters { volume, node_filters });
    }
    for value in &args.labels {
        let (label, node_filters) = split_node_filters(value);
        config.labels.push(LabelWithFilters { label, node_filters });
    }
    for value in &args.env {
        let (env_var, node_filters) = split_node_filters(value);
        config.env.push(EnvVarWithFilters { env_var, node_filters });
    }

    if args.timeout.is_some() {
        config.options.timeout = args.timeout.clone();
    }
    config.options.disable_loadbalancer |= args.no_lb;
    config.options.disable_image_volume |= args.no_image_volume;
    if args.no_wait {
        config.options.wait = false;
    }

    config.validate()?;
    Ok(config)
}

/// Names of the nodes created by `node add`
pub fn replica_names(name: &str, replicas: usize) -> Vec<String> {
    if replicas <= 1 {
        vec![name.to_string()]
    } else {
        (0..replicas).map(|i| format!("{}-{}", name, i)).collect()
    }
}

fn parse_timeout(timeout: Option<&str>) -> CommandResult<Option<std::time::Duration>> {
    Ok(timeout.map(parse_duration).transpose()?)
}

// ============================================================================
// I/O wrapper: config file
// ============================================================================

/// Build the cluster config from `--config` (if any) and the flags
pub fn build_cluster_config(args: &ClusterCreateArgs) -> CommandResult<ClusterConfig> {
    let base = match &args.config {
        Some(path) => load_cluster_config_file(path)?,
        None => {
            let name = args.name.clone().ok_or_else(|| {
                CommandError::InvalidArgument("a cluster name or --config is required".to_string())
            })?;
            ClusterConfig::new(name)
        }
    };
    apply_create_args(base, args)
}

// ============================================================================
// Cluster commands
// ============================================================================

/// Create a cluster; a failed create is rolled back.
///
/// The rollback only removes what the failed run created itself.
pub async fn cluster_create_cmd<R: Runtime>(
    orchestrator: &ClusterOrchestrator<R>,
    config: ClusterConfig,
) -> CommandResult<Cluster> {
    match get_cluster(orchestrator.runtime(), &config.name).await {
        Ok(_) => return Err(CommandError::ClusterExists(config.name)),
        Err(ClusterError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }

    let (mut cluster, opts) = config.into_cluster()?;

    if let Err(e) = orchestrator.cluster_create(&mut cluster, &opts).await {
        // rejected before anything was created
        if matches!(e, ClusterError::Invalid(_)) {
            return Err(e.into());
        }
        warn!("Failed to create cluster '{}', rolling back", cluster.name);
        if let Err(rollback) = orchestrator
            .cluster_delete(&cluster, &ClusterDeleteOpts::default())
            .await
        {
            warn!("Rollback of cluster '{}' incomplete: {}", cluster.name, rollback);
        }
        return Err(e.into());
    }

    info!("Cluster '{}' created", cluster.name);
    Ok(cluster)
}

pub async fn cluster_start_cmd<R: Runtime>(
    orchestrator: &ClusterOrchestrator<R>,
    names: &[String],
    wait: bool,
    timeout: Option<&str>,
) -> CommandResult<()> {
    let opts = ClusterStartOpts {
        wait_for_server: wait,
        timeout: parse_timeout(timeout)?,
        intent: Intent::ClusterStart,
        ..Default::default()
    };
    for name in names {
        let mut cluster = get_cluster(orchestrator.runtime(), name).await?;
        orchestrator.cluster_start(&mut cluster, &opts).await?;
        info!("Started cluster '{}'", name);
    }
    Ok(())
}

pub async fn cluster_stop_cmd<R: Runtime>(orchestrator: &ClusterOrchestrator<R>, names: &[String]) -> CommandResult<()> {
    for name in names {
        let mut cluster = get_cluster(orchestrator.runtime(), name).await?;
        orchestrator.cluster_stop(&mut cluster).await?;
        info!("Stopped cluster '{}'", name);
    }
    Ok(())
}

/// Delete clusters; a missing cluster is only a warning
pub async fn cluster_delete_cmd<R: Runtime>(
    orchestrator: &ClusterOrchestrator<R>,
    names: &[String],
) -> CommandResult<()> {
    for name in names {
        let cluster = match get_cluster(orchestrator.runtime(), name).await {
            Ok(cluster) => cluster,
            Err(ClusterError::NotFound(_)) => {
                warn!("No cluster named '{}'", name);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        orchestrator
            .cluster_delete(&cluster, &ClusterDeleteOpts::default())
            .await?;
    }
    Ok(())
}

pub async fn cluster_list_cmd<R: Runtime + ?Sized>(runtime: &R) -> CommandResult<Vec<ClusterState>> {
    let clusters = list_clusters(runtime).await?;
    Ok(clusters.iter().map(ClusterState::from).collect())
}

// ============================================================================
// Node commands
// ============================================================================

pub async fn node_list_cmd<R: Runtime + ?Sized>(runtime: &R, cluster: Option<&str>) -> CommandResult<Vec<Node>> {
    let selector = match cluster {
        Some(name) => labels::cluster_selector(name),
        None => labels::app_selector(),
    };
    let mut nodes = runtime.get_nodes_by_label(&selector).await?;
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(nodes)
}

/// Arguments of `node add`, decoupled from clap
#[derive(Debug, Clone)]
pub struct NodeAddRequest {
    pub name: String,
    pub cluster: String,
    pub role: String,
    pub image: Option<String>,
    pub replicas: usize,
    pub wait: bool,
    pub timeout: Option<String>,
}

/// Add nodes one after another; each server addition replaces the load balancer
pub async fn node_add_cmd<R: Runtime>(
    orchestrator: &ClusterOrchestrator<R>,
    request: &NodeAddRequest,
) -> CommandResult<Vec<Node>> {
    let role: Role = request.role.parse()?;
    let opts = NodeCreateOpts {
        wait: request.wait,
        timeout: parse_timeout(request.timeout.as_deref())?,
        ..Default::default()
    };

    let mut added = Vec::new();
    for name in replica_names(&request.name, request.replicas) {
        let node = Node::new(name, role, request.image.clone().unwrap_or_default());
        added.push(
            orchestrator
                .node_add_to_cluster(node, &request.cluster, &opts)
                .await?,
        );
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;

    fn create_args(name: &str) -> ClusterCreateArgs {
        ClusterCreateArgs {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_split_node_filters() {
        assert_eq!(
            split_node_filters("8080:80@loadbalancer"),
            ("8080:80".to_string(), vec!["loadbalancer".to_string()])
        );
        assert_eq!(
            split_node_filters("/tmp:/data@agent:0;server:*"),
            (
                "/tmp:/data".to_string(),
                vec!["agent:0".to_string(), "server:*".to_string()]
            )
        );
        assert_eq!(split_node_filters("FOO=bar"), ("FOO=bar".to_string(), vec![]));
    }

    #[test]
    fn test_parse_api_port() {
        assert_eq!(parse_api_port("6550").unwrap(), (None, 6550));
        assert_eq!(
            parse_api_port("127.0.0.1:6550").unwrap(),
            (Some("127.0.0.1".to_string()), 6550)
        );
        assert!(parse_api_port("0").is_err());
        assert!(parse_api_port("127.0.0.1:http").is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let mut base = ClusterConfig::new("from-file");
        base.servers = 1;
        base.agents = 4;

        let args = ClusterCreateArgs {
            name: Some("dev".to_string()),
            servers: Some(3),
            api_port: Some("6550".to_string()),
            ports: vec!["8080:80@loadbalancer".to_string()],
            env: vec!["FOO=bar@agent:*".to_string()],
            no_lb: true,
            no_wait: true,
            ..Default::default()
        };
        let config = apply_create_args(base, &args).unwrap();
        assert_eq!(config.name, "dev");
        assert_eq!(config.servers, 3);
        assert_eq!(config.agents, 4);
        assert_eq!(config.kube_api.host_port, Some(6550));
        assert_eq!(config.ports[0].node_filters, vec!["loadbalancer"]);
        assert_eq!(config.env[0].env_var, "FOO=bar");
        assert!(config.options.disable_loadbalancer);
        assert!(!config.options.wait);
    }

    #[test]
    fn test_build_config_requires_name() {
        let err = build_cluster_config(&ClusterCreateArgs::default()).unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument(_)));
    }

    #[test]
    fn test_replica_names() {
        assert_eq!(replica_names("extra", 1), vec!["extra"]);
        assert_eq!(replica_names("extra", 3), vec!["extra-0", "extra-1", "extra-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_list_delete() {
        let orchestrator = ClusterOrchestrator::new(MockRuntime::new());
        let config = build_cluster_config(&ClusterCreateArgs {
            agents: Some(1),
            ..create_args("dev")
        })
        .unwrap();

        let cluster = cluster_create_cmd(&orchestrator, config).await.unwrap();
        assert_eq!(cluster.nodes.len(), 3);

        let states = cluster_list_cmd(orchestrator.runtime()).await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].name, "dev");
        assert_eq!(states[0].servers, 1);
        assert_eq!(states[0].agents, 1);
        assert!(states[0].has_loadbalancer);

        let nodes = node_list_cmd(orchestrator.runtime(), Some("dev")).await.unwrap();
        assert_eq!(nodes.len(), 3);

        cluster_delete_cmd(&orchestrator, &["dev".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert!(orchestrator.runtime().node_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_create_is_rolled_back() {
        let runtime = MockRuntime::new();
        runtime.fail("create_node", "k3d-dev-agent-0");
        let orchestrator = ClusterOrchestrator::new(runtime);
        let config = build_cluster_config(&ClusterCreateArgs {
            agents: Some(1),
            ..create_args("dev")
        })
        .unwrap();

        assert!(cluster_create_cmd(&orchestrator, config).await.is_err());
        let runtime = orchestrator.runtime();
        assert!(runtime.node_names().is_empty());
        assert!(!runtime.has_network("k3d-dev"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_add_replicas() {
        let orchestrator = ClusterOrchestrator::new(MockRuntime::new());
        let config = build_cluster_config(&create_args("dev")).unwrap();
        cluster_create_cmd(&orchestrator, config).await.unwrap();

        let added = node_add_cmd(
            &orchestrator,
            &NodeAddRequest {
                name: "k3d-dev-extra".to_string(),
                cluster: "dev".to_string(),
                role: "agent".to_string(),
                image: None,
                replicas: 2,
                wait: true,
                timeout: Some("30s".to_string()),
            },
        )
        .await
        .unwrap();
        assert_eq!(added.len(), 2);
        assert_eq!(added[1].name, "k3d-dev-extra-1");

        let err = node_add_cmd(
            &orchestrator,
            &NodeAddRequest {
                name: "x".to_string(),
                cluster: "dev".to_string(),
                role: "captain".to_string(),
                image: None,
                replicas: 1,
                wait: false,
                timeout: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::NodeSpec(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_refuses_existing_cluster() {
        let orchestrator = ClusterOrchestrator::new(MockRuntime::new());
        let config = build_cluster_config(&ClusterCreateArgs {
            agents: Some(1),
            ..create_args("dev")
        })
        .unwrap();
        cluster_create_cmd(&orchestrator, config.clone()).await.unwrap();
        let before = orchestrator.runtime().node_names();

        let err = cluster_create_cmd(&orchestrator, config).await.unwrap_err();
        assert!(matches!(err, CommandError::ClusterExists(ref name) if name == "dev"));

        let runtime = orchestrator.runtime();
        assert_eq!(runtime.node_names(), before);
        assert_eq!(runtime.volume_names(), vec!["k3d-dev-images"]);
        assert!(runtime.has_network("k3d-dev"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_spares_foreign_containers() {
        let runtime = MockRuntime::new();
        // same container name, but not labelled as part of a cluster
        runtime.add_node(Node::new("k3d-dev-agent-0", Role::Agent, "k3s"));
        let orchestrator = ClusterOrchestrator::new(runtime);
        let config = build_cluster_config(&ClusterCreateArgs {
            agents: Some(1),
            ..create_args("dev")
        })
        .unwrap();

        assert!(cluster_create_cmd(&orchestrator, config).await.is_err());
        let runtime = orchestrator.runtime();
        assert_eq!(runtime.node_names(), vec!["k3d-dev-agent-0"]);
        assert!(runtime.volume_names().is_empty());
        assert!(!runtime.has_network("k3d-dev"));
    }
}
