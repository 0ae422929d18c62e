//! Cluster creation

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use futures::future::try_join_all;
use rand::distr::{Alphanumeric, SampleString};
use tracing::{debug, info, warn};

use super::{
    until_cancelled, validate_cluster, with_timeout, ClusterError, ClusterOrchestrator, SERVER_CREATE_DELAY,
};
use crate::loadbalancer;
use crate::network;
use crate::runtime::Runtime;
use crate::types::{
    labels, Cluster, ClusterCreateOpts, ClusterStartOpts, Intent, Node, NodeIP, Role,
    WaitOptions, DEFAULT_API_PORT, DEFAULT_K3S_IMAGE, IMAGE_VOLUME_MOUNT_PATH,
};

const TOKEN_LENGTH: usize = 20;

/// Random join secret shared by all nodes of a cluster
pub fn generate_token() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), TOKEN_LENGTH)
}

/// Name of the volume shared by servers and agents for image imports
pub fn image_volume_name(cluster: &str) -> String {
    format!("k3d-{}-images", cluster)
}

/// Labels carried by every object of the cluster
pub fn cluster_labels(cluster: &Cluster) -> Vec<(&'static str, String)> {
    let mut out = vec![
        (labels::LABEL_CLUSTER, cluster.name.clone()),
        (labels::LABEL_NETWORK, cluster.network.name.clone()),
        (labels::LABEL_NETWORK_ID, cluster.network.id.clone()),
        (
            labels::LABEL_NETWORK_EXTERNAL,
            cluster.network.external.to_string(),
        ),
        (labels::LABEL_TOKEN, cluster.token.clone()),
    ];
    if let Some(prefix) = cluster.network.ipam.ip_prefix {
        out.push((labels::LABEL_NETWORK_IPRANGE, prefix.to_string()));
    }
    if let Some(volume) = &cluster.image_volume {
        out.push((labels::LABEL_IMAGE_VOLUME, volume.clone()));
    }
    out
}

/// Fill in everything a node needs to join the cluster: labels, env, join
/// URL, image volume mount, k3s arguments and, for managed networks, a
/// static IP.
///
/// All IPs are assigned here, before any node is created concurrently.
pub fn prepare_nodes(cluster: &mut Cluster, opts: &ClusterCreateOpts) -> Result<(), ClusterError> {
    let identity = cluster_labels(cluster);
    let init_name = cluster.init_node().map(|n| n.name.clone());
    let mut server_names: Vec<String> = cluster
        .nodes_with_role(Role::Server)
        .map(|n| n.name.clone())
        .collect();
    server_names.sort();
    let agent_target = init_name.clone().or_else(|| server_names.first().cloned());

    let Cluster {
        nodes,
        network,
        token,
        image_volume,
        kube_api,
        ..
    } = cluster;
    let assign_ips = network.ipam.managed && !network.is_host();

    for node in nodes.iter_mut() {
        for (key, value) in labels::default_runtime_labels()
            .into_iter()
            .chain(opts.global_labels.clone())
        {
            node.runtime_labels.entry(key).or_insert(value);
        }
        for (key, value) in &identity {
            node.runtime_labels.insert(key.to_string(), value.clone());
        }
        node.runtime_labels
            .insert(labels::LABEL_ROLE.to_string(), node.role.to_string());

        if node.networks.is_empty() {
            node.networks.push(network.name.clone());
        }
        node.restart = true;

        if matches!(node.role, Role::Server | Role::Agent) {
            if node.image.is_empty() {
                node.image = DEFAULT_K3S_IMAGE.to_string();
            }
            for env in &opts.global_env {
                let key = env.split('=').next().unwrap_or(env);
                if node.env_value(key).is_none() {
                    node.env.push(env.clone());
                }
            }
            node.set_env("K3S_TOKEN", token.as_str());

            let subcommand = node.role.as_str();
            if node.args.first().map(String::as_str) != Some(subcommand) {
                node.args.insert(0, subcommand.to_string());
            }

            if let Some(volume) = image_volume.as_ref() {
                let mount = format!("{}:{}", volume, IMAGE_VOLUME_MOUNT_PATH);
                if !node.volumes.contains(&mount) {
                    node.volumes.push(mount);
                }
            }
        }

        match node.role {
            Role::Server if node.server_opts.is_init => {
                if !node.has_arg("--cluster-init") {
                    node.args.push("--cluster-init".to_string());
                }
                node.runtime_labels
                    .insert(labels::LABEL_SERVER_IS_INIT.to_string(), "true".to_string());
            }
            Role::Server => {
                if let Some(init) = &init_name {
                    node.set_env("K3S_URL", &server_url(init));
                }
            }
            Role::Agent => {
                if let Some(target) = &agent_target {
                    node.set_env("K3S_URL", &server_url(target));
                }
            }
            _ => {}
        }

        if node.role == Role::Server {
            node.runtime_labels
                .insert(labels::LABEL_SERVER_API_HOST.to_string(), kube_api.host.clone());
            node.runtime_labels.insert(
                labels::LABEL_SERVER_API_HOST_IP.to_string(),
                kube_api.host_ip.clone(),
            );
            node.runtime_labels.insert(
                labels::LABEL_SERVER_API_PORT.to_string(),
                kube_api.host_port.to_string(),
            );
        }

        if assign_ips && !node.ip.is_static {
            let ip = network::allocate_ip(network)?;
            node.ip = NodeIP {
                ip: Some(ip),
                is_static: true,
            };
        } else if let (Some(ip), true) = (node.ip.ip, node.ip.is_static) {
            network.ipam.mark_used(ip);
        }
        if node.ip.is_static {
            node.runtime_labels
                .insert(labels::LABEL_NODE_STATIC_IP.to_string(), "true".to_string());
        }
    }

    Ok(())
}

fn server_url(server: &str) -> String {
    format!("https://{}:{}", server, DEFAULT_API_PORT)
}

/// Objects a create run made itself, shared by its concurrent phases
#[derive(Debug, Default)]
struct Created {
    network: Mutex<bool>,
    volume: Mutex<Option<String>>,
    nodes: Mutex<HashSet<String>>,
}

impl Created {
    fn network(&self) {
        if let Ok(mut network) = self.network.lock() {
            *network = true;
        }
    }

    fn volume(&self, name: &str) {
        if let Ok(mut volume) = self.volume.lock() {
            *volume = Some(name.to_string());
        }
    }

    fn node(&self, name: &str) {
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.insert(name.to_string());
        }
    }

    /// Narrow `cluster` to what this run created
    fn restrict(self, cluster: &mut Cluster) {
        let nodes = self.nodes.into_inner().unwrap_or_default();
        let volume = self.volume.into_inner().unwrap_or_default();
        let network = self.network.into_inner().unwrap_or_default();

        cluster.nodes.retain(|n| nodes.contains(&n.name));
        cluster.volumes.retain(|v| volume.as_ref() == Some(v));
        if cluster.image_volume != volume {
            cluster.image_volume = None;
        }
        if !network {
            cluster.network.external = true;
        }
    }
}

impl<R: Runtime> ClusterOrchestrator<R> {
    /// Create and start every node of `cluster`.
    ///
    /// On error `cluster` describes exactly what this run created (nodes,
    /// network, image volume) and can be passed to
    /// [`ClusterOrchestrator::cluster_delete`]. Containers, networks and
    /// volumes that existed before are left out of it.
    pub async fn cluster_create(
        &self,
        cluster: &mut Cluster,
        opts: &ClusterCreateOpts,
    ) -> Result<(), ClusterError> {
        let created = Created::default();
        let result = until_cancelled(
            &self.cancel,
            with_timeout(opts.timeout, self.create_inner(cluster, opts, &created)),
        )
        .await;
        if result.is_err() {
            created.restrict(cluster);
        }
        result
    }

    async fn create_inner(
        &self,
        cluster: &mut Cluster,
        opts: &ClusterCreateOpts,
        created: &Created,
    ) -> Result<(), ClusterError> {
        if cluster.network.is_host() && cluster.server_load_balancer.is_some() {
            warn!("Host network mode: no load balancer will be created");
            cluster.server_load_balancer = None;
            cluster.nodes.retain(|n| n.role != Role::LoadBalancer);
        }
        validate_cluster(cluster)?;
        info!("Creating cluster '{}'", cluster.name);

        let network_labels = labels::default_runtime_labels();
        let (net, existed) =
            network::create_network_if_not_present(&self.runtime, &cluster.network, &network_labels).await?;
        if existed {
            info!("Network '{}' already exists, it will not be deleted with the cluster", net.name);
        } else {
            created.network();
        }
        cluster.network = net;

        if cluster.token.is_empty() {
            cluster.token = generate_token();
            debug!("Generated cluster token");
        }

        if !opts.disable_image_volume && !cluster.network.is_host() {
            let name = image_volume_name(&cluster.name);
            if self.runtime.get_volumes_by_label(&HashMap::new()).await?.contains(&name) {
                info!("Re-using existing image volume '{}'", name);
            } else {
                let mut volume_labels = labels::default_runtime_labels();
                volume_labels.extend(labels::cluster_selector(&cluster.name));
                self.runtime.create_volume(&name, &volume_labels).await?;
                created.volume(&name);
                info!("Created image volume '{}'", name);
            }
            if !cluster.volumes.contains(&name) {
                cluster.volumes.push(name.clone());
            }
            cluster.image_volume = Some(name);
        }

        if cluster.server_load_balancer.is_some() && cluster.load_balancer().is_none() {
            let lb = loadbalancer::new_loadbalancer_node(cluster);
            cluster.nodes.push(lb);
        }

        prepare_nodes(cluster, opts)?;

        if let Some(init) = cluster.init_node() {
            info!("Creating initializing server node '{}'", init.name);
            self.create_tracked(init, created, true, &opts.wait).await?;
        }

        let has_init = cluster.init_node().is_some();
        let mut servers: Vec<&Node> = cluster
            .nodes_with_role(Role::Server)
            .filter(|n| !n.server_opts.is_init)
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        for (i, server) in servers.into_iter().enumerate() {
            if i > 0 || has_init {
                tokio::time::sleep(SERVER_CREATE_DELAY).await;
            }
            info!("Creating server node '{}'", server.name);
            self.create_tracked(server, created, opts.wait_for_server, &opts.wait)
                .await?;
        }

        let workers = cluster
            .nodes
            .iter()
            .filter(|n| !matches!(n.role, Role::Server | Role::LoadBalancer));
        try_join_all(workers.map(|node| {
            info!("Creating node '{}'", node.name);
            self.create_tracked(node, created, opts.wait_for_server, &opts.wait)
        }))
        .await?;

        if cluster.load_balancer().is_some() {
            loadbalancer::attach_config(cluster)?;
            if let Some(lb) = cluster.load_balancer() {
                info!("Creating load balancer '{}'", lb.name);
                self.create_tracked(lb, created, opts.wait_for_server, &opts.wait)
                    .await?;
            }
        }

        self.post_start(cluster, &ClusterStartOpts::after_create(opts))
            .await?;

        info!("Cluster '{}' created successfully", cluster.name);
        Ok(())
    }

    async fn create_tracked(
        &self,
        node: &Node,
        created: &Created,
        wait: bool,
        wait_opts: &WaitOptions,
    ) -> Result<(), ClusterError> {
        self.runtime
            .create_node(node)
            .await
            .map_err(|e| ClusterError::node("create", node, e))?;
        created.node(&node.name);
        self.start_node_and_wait(node, Intent::ClusterCreate, wait, wait_opts)
            .await
    }

    pub(crate) async fn create_node_and_wait(
        &self,
        node: &Node,
        intent: Intent,
        wait: bool,
        wait_opts: &WaitOptions,
    ) -> Result<(), ClusterError> {
        self.runtime
            .create_node(node)
            .await
            .map_err(|e| ClusterError::node("create", node, e))?;
        self.start_node_and_wait(node, intent, wait, wait_opts).await
    }
}
