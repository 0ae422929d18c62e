//! Cluster start and post-start actions

use std::time::Duration;

use chrono::Utc;
use futures::future::{try_join, try_join_all};
use tracing::{debug, info, warn};

use super::{until_cancelled, wait, with_timeout, ClusterError, ClusterOrchestrator};
use crate::runtime::Runtime;
use crate::types::{Cluster, ClusterStartOpts, HostAlias, Intent, Node, Role, WaitOptions};

/// Hostname every node resolves to the network gateway
pub const HOST_GATEWAY_ALIAS: &str = "host.k3d.internal";

/// CoreDNS may not be deployed yet right after the servers came up
const COREDNS_PATCH_ATTEMPTS: u32 = 10;
const COREDNS_PATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// `/etc/hosts` style lines
pub fn hosts_entries(aliases: &[HostAlias]) -> Vec<String> {
    aliases
        .iter()
        .filter(|a| !a.hostnames.is_empty())
        .map(|a| format!("{} {}", a.ip, a.hostnames.join(" ")))
        .collect()
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Command appending `entries` to `/etc/hosts` inside a node
pub fn hosts_inject_command(entries: &[String]) -> Vec<String> {
    let quoted: Vec<String> = entries.iter().map(|e| shell_quote(e)).collect();
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("printf '%s\\n' {} >> /etc/hosts", quoted.join(" ")),
    ]
}

/// kubectl call replacing the `NodeHosts` entry of the CoreDNS ConfigMap
pub fn coredns_patch_command(entries: &[String]) -> Vec<String> {
    let mut hosts = entries.join("\n");
    hosts.push('\n');
    let patch = serde_json::json!({ "data": { "NodeHosts": hosts } }).to_string();
    [
        "kubectl",
        "--namespace",
        "kube-system",
        "patch",
        "configmap",
        "coredns",
        "--type",
        "merge",
        "--patch",
    ]
    .into_iter()
    .map(str::to_string)
    .chain(std::iter::once(patch))
    .collect()
}

impl<R: Runtime> ClusterOrchestrator<R> {
    /// Start the stopped nodes of `cluster`: init server first, then the
    /// other servers one by one, then agents and auxiliary nodes
    /// concurrently, then the post-start actions.
    pub async fn cluster_start(
        &self,
        cluster: &mut Cluster,
        opts: &ClusterStartOpts,
    ) -> Result<(), ClusterError> {
        until_cancelled(&self.cancel, with_timeout(opts.timeout, self.start_inner(cluster, opts))).await
    }

    async fn start_inner(&self, cluster: &mut Cluster, opts: &ClusterStartOpts) -> Result<(), ClusterError> {
        info!("Starting cluster '{}'", cluster.name);

        if cluster.server_count() == 2 {
            warn!(
                "Cluster '{}' has 2 servers: etcd has no majority if one of them fails, use 1 or 3 servers",
                cluster.name
            );
        }

        let pending = |node: &&Node| {
            if node.state.running {
                debug!("Node '{}' is already running", node.name);
            }
            !node.state.running
        };

        if let Some(init) = cluster.init_node().filter(pending) {
            info!("Starting initializing server node '{}'", init.name);
            self.start_node_and_wait(init, opts.intent, true, &opts.wait)
                .await?;
        }

        let mut servers: Vec<&Node> = cluster
            .nodes_with_role(Role::Server)
            .filter(|n| !n.server_opts.is_init)
            .filter(pending)
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        for server in servers {
            info!("Starting server node '{}'", server.name);
            self.start_node_and_wait(server, opts.intent, opts.wait_for_server, &opts.wait)
                .await?;
        }

        let agents = cluster
            .nodes_with_role(Role::Agent)
            .filter(pending)
            .map(|n| self.start_node_and_wait(n, opts.intent, opts.wait_for_server, &opts.wait));
        try_join_all(agents).await?;

        let auxiliary = cluster
            .nodes
            .iter()
            .filter(|n| !matches!(n.role, Role::Server | Role::Agent))
            .filter(pending)
            .map(|n| self.start_node_and_wait(n, opts.intent, opts.wait_for_server, &opts.wait));
        try_join_all(auxiliary).await?;

        for node in cluster.nodes.iter_mut() {
            node.state.running = true;
        }

        self.post_start(cluster, opts).await?;
        info!("Started cluster '{}'", cluster.name);
        Ok(())
    }

    pub(crate) async fn start_node_and_wait(
        &self,
        node: &Node,
        intent: Intent,
        wait: bool,
        wait_opts: &WaitOptions,
    ) -> Result<(), ClusterError> {
        let since = Utc::now();
        self.runtime
            .start_node(node)
            .await
            .map_err(|e| ClusterError::node("start", node, e))?;

        if wait {
            let marker = wait::ready_log_message(node.role, intent);
            wait::wait_for_log_message(&self.runtime, node, marker, Some(since), wait_opts, &self.cancel)
                .await
                .map_err(|source| ClusterError::NotReady {
                    node: node.name.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Inject host aliases into every k3s node and patch CoreDNS so pods
    /// resolve them as well as the other cluster members
    pub(crate) async fn post_start(&self, cluster: &Cluster, opts: &ClusterStartOpts) -> Result<(), ClusterError> {
        let mut aliases = opts.host_aliases.clone();
        if !cluster.network.is_host() {
            if let Some(gateway) = cluster.network.ipam.effective_gateway() {
                aliases.push(HostAlias {
                    ip: gateway,
                    hostnames: vec![HOST_GATEWAY_ALIAS.to_string()],
                });
            }
        }
        let entries = hosts_entries(&aliases);
        let entries = &entries;

        let inject = cluster
            .nodes
            .iter()
            .filter(|n| matches!(n.role, Role::Server | Role::Agent))
            .filter(|_| !entries.is_empty())
            .map(|node| {
                let cmd = hosts_inject_command(entries);
                async move {
                    debug!("Injecting {} host alias(es) into '{}'", entries.len(), node.name);
                    self.runtime
                        .exec_in_node(node, &cmd)
                        .await
                        .map(|_| ())
                        .map_err(|e| ClusterError::node("inject host aliases into", node, e))
                }
            });

        try_join(try_join_all(inject), self.patch_coredns(cluster, entries, opts)).await?;
        Ok(())
    }

    async fn patch_coredns(
        &self,
        cluster: &Cluster,
        alias_entries: &[String],
        opts: &ClusterStartOpts,
    ) -> Result<(), ClusterError> {
        if opts.disable_coredns_patch || cluster.network.is_host() {
            debug!("Skipping CoreDNS patch");
            return Ok(());
        }
        let mut servers: Vec<&Node> = cluster.nodes_with_role(Role::Server).collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        let Some(server) = servers.first() else {
            return Ok(());
        };

        let mut entries = alias_entries.to_vec();
        if let Some(network) = self.runtime.get_network(&cluster.network.name).await? {
            entries.extend(
                network
                    .members
                    .iter()
                    .filter_map(|m| m.ip.map(|ip| format!("{} {}", ip, m.name))),
            );
        }
        if entries.is_empty() {
            return Ok(());
        }

        let cmd = coredns_patch_command(&entries);
        for attempt in 1..=COREDNS_PATCH_ATTEMPTS {
            match self.runtime.exec_in_node(server, &cmd).await {
                Ok(_) => {
                    debug!("Patched CoreDNS NodeHosts via '{}'", server.name);
                    return Ok(());
                }
                Err(e) if attempt < COREDNS_PATCH_ATTEMPTS => {
                    debug!("CoreDNS patch attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(COREDNS_PATCH_RETRY_DELAY).await;
                }
                Err(e) => {
                    warn!("Failed to patch CoreDNS, host aliases are not resolvable from pods: {}", e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::create::prepare_nodes;
    use crate::cluster::test_cluster;
    use crate::loadbalancer::new_loadbalancer_node;
    use crate::runtime::mock::MockRuntime;
    use crate::types::{ClusterCreateOpts, LoadbalancerSettings};
    use tokio_util::sync::CancellationToken;

    /// A created-but-stopped cluster, seeded into the mock
    fn stopped_cluster(runtime: &MockRuntime, servers: usize, agents: usize) -> Cluster {
        let mut cluster = test_cluster(servers, agents);
        cluster.server_load_balancer = Some(LoadbalancerSettings::default());
        cluster.nodes.push(new_loadbalancer_node(&cluster));
        cluster.token = "t".to_string();
        prepare_nodes(&mut cluster, &ClusterCreateOpts::default()).unwrap();
        for node in &cluster.nodes {
            runtime.add_node(node.clone());
        }
        cluster
    }

    #[test]
    fn test_hosts_entries() {
        let aliases = vec![
            HostAlias {
                ip: "10.0.0.1".parse().unwrap(),
                hostnames: vec!["a".to_string(), "b".to_string()],
            },
            HostAlias {
                ip: "10.0.0.2".parse().unwrap(),
                hostnames: vec![],
            },
        ];
        assert_eq!(hosts_entries(&aliases), vec!["10.0.0.1 a b"]);
    }

    #[test]
    fn test_hosts_inject_command_quotes() {
        let cmd = hosts_inject_command(&["1.2.3.4 it's".to_string()]);
        assert_eq!(cmd[..2], ["sh", "-c"]);
        assert_eq!(cmd[2], r"printf '%s\n' '1.2.3.4 it'\''s' >> /etc/hosts");
    }

    #[test]
    fn test_coredns_patch_command() {
        let cmd = coredns_patch_command(&["10.0.0.1 host.k3d.internal".to_string()]);
        assert_eq!(cmd[0], "kubectl");
        let patch: serde_json::Value = serde_json::from_str(cmd.last().unwrap()).unwrap();
        assert_eq!(
            patch["data"]["NodeHosts"],
            "10.0.0.1 host.k3d.internal\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_order() {
        let runtime = MockRuntime::new();
        let mut cluster = stopped_cluster(&runtime, 3, 2);
        let orchestrator = ClusterOrchestrator::new(runtime);
        let opts = ClusterStartOpts {
            wait_for_server: true,
            intent: Intent::ClusterStart,
            ..Default::default()
        };

        orchestrator.cluster_start(&mut cluster, &opts).await.unwrap();
        let runtime = orchestrator.runtime();

        let started = runtime.targets("start_node");
        assert_eq!(
            &started[..3],
            &["k3d-dev-server-0", "k3d-dev-server-1", "k3d-dev-server-2"]
        );
        let mut agents = started[3..5].to_vec();
        agents.sort();
        assert_eq!(agents, vec!["k3d-dev-agent-0", "k3d-dev-agent-1"]);
        assert_eq!(started[5], "k3d-dev-serverlb");
        assert!(runtime.log_reads("k3d-dev-server-0") >= 1);
        assert!(cluster.nodes.iter().all(|n| n.state.running));
    }

    #[tokio::test]
    async fn test_start_skips_running_nodes() {
        let runtime = MockRuntime::new();
        let mut cluster = stopped_cluster(&runtime, 1, 1);
        cluster.nodes[0].state.running = true;
        let orchestrator = ClusterOrchestrator::new(runtime);

        orchestrator
            .cluster_start(&mut cluster, &ClusterStartOpts::default())
            .await
            .unwrap();
        assert_eq!(
            orchestrator.runtime().targets("start_node"),
            vec!["k3d-dev-agent-0", "k3d-dev-serverlb"]
        );
    }

    #[tokio::test]
    async fn test_post_start_actions() {
        let runtime = MockRuntime::new();
        let mut cluster = stopped_cluster(&runtime, 1, 2);
        cluster.network.ipam.ip_prefix = Some("172.30.0.0/16".parse().unwrap());
        let orchestrator = ClusterOrchestrator::new(runtime);

        orchestrator
            .cluster_start(&mut cluster, &ClusterStartOpts::default())
            .await
            .unwrap();
        let mut execs = orchestrator.runtime().targets("exec");
        execs.sort();
        // hosts injection on every k3s node plus the CoreDNS patch on the server
        assert_eq!(
            execs,
            vec![
                "k3d-dev-agent-0",
                "k3d-dev-agent-1",
                "k3d-dev-server-0",
                "k3d-dev-server-0"
            ]
        );
    }

    #[tokio::test]
    async fn test_post_start_coredns_disabled() {
        let runtime = MockRuntime::new();
        let mut cluster = stopped_cluster(&runtime, 1, 1);
        cluster.network.ipam.ip_prefix = Some("172.30.0.0/16".parse().unwrap());
        let orchestrator = ClusterOrchestrator::new(runtime);
        let opts = ClusterStartOpts {
            disable_coredns_patch: true,
            ..Default::default()
        };

        orchestrator.cluster_start(&mut cluster, &opts).await.unwrap();
        assert_eq!(orchestrator.runtime().targets("exec").len(), 2);
    }

    #[tokio::test]
    async fn test_start_cancelled() {
        let runtime = MockRuntime::new();
        let mut cluster = stopped_cluster(&runtime, 1, 1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let orchestrator = ClusterOrchestrator::with_cancellation(runtime, cancel);

        let err = orchestrator
            .cluster_start(&mut cluster, &ClusterStartOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Cancelled));
        assert!(orchestrator.runtime().targets("start_node").is_empty());
    }
}
