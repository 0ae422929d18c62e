//! Cluster stop and delete
//!
//! Both walk every node and keep going past failures; the collected
//! failures come back as [`ClusterError::Partial`].

use tracing::{debug, info, warn};

use super::{for_each_best_effort, BestEffortFailures, ClusterError, ClusterOrchestrator};
use crate::runtime::{Runtime, RuntimeError};
use crate::types::{Cluster, ClusterDeleteOpts, Node, Role};

impl<R: Runtime> ClusterOrchestrator<R> {
    /// Stop every node of the cluster
    pub async fn cluster_stop(&self, cluster: &mut Cluster) -> Result<(), ClusterError> {
        info!("Stopping cluster '{}'", cluster.name);

        let failures = for_each_best_effort("stop", &cluster.nodes, |node| {
            debug!("Stopping node '{}'", node.name);
            self.runtime.stop_node(node)
        })
        .await;

        let failed: Vec<&str> = failures.failures.iter().map(|(n, _)| n.as_str()).collect();
        for node in cluster.nodes.iter_mut() {
            if !failed.contains(&node.name.as_str()) {
                node.state.running = false;
            }
        }
        failures.into_result()
    }

    /// Delete nodes, the network (unless external) and the cluster volumes
    pub async fn cluster_delete(&self, cluster: &Cluster, opts: &ClusterDeleteOpts) -> Result<(), ClusterError> {
        info!("Deleting cluster '{}'", cluster.name);

        let mut failures = for_each_best_effort("delete", &cluster.nodes, |node| {
            self.delete_cluster_node(cluster, node, opts)
        })
        .await;

        self.delete_cluster_network(cluster, &mut failures).await;

        for volume in &cluster.volumes {
            debug!("Deleting volume '{}'", volume);
            if let Err(e) = self.runtime.delete_volume(volume).await {
                failures.push(volume.clone(), e);
            }
        }

        if failures.is_empty() {
            info!("Deleted cluster '{}'", cluster.name);
        }
        failures.into_result()
    }

    async fn delete_cluster_node(
        &self,
        cluster: &Cluster,
        node: &Node,
        opts: &ClusterDeleteOpts,
    ) -> Result<(), RuntimeError> {
        if node.role == Role::Registry && !opts.skip_registry_check {
            let live = match self.runtime.get_node(&node.name).await {
                Ok(live) => live,
                Err(RuntimeError::NodeNotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            if live.networks.iter().any(|n| n != &cluster.network.name) {
                info!(
                    "Registry '{}' is still used by other networks, only disconnecting it",
                    node.name
                );
                return self
                    .runtime
                    .disconnect_node_from_network(&live, &cluster.network.name)
                    .await;
            }
        }

        debug!("Deleting node '{}'", node.name);
        match self.runtime.delete_node(node).await {
            Err(RuntimeError::NodeNotFound(_)) => {
                debug!("Node '{}' is already gone", node.name);
                Ok(())
            }
            other => other,
        }
    }

    async fn delete_cluster_network(&self, cluster: &Cluster, failures: &mut BestEffortFailures) {
        let network = &cluster.network;
        if network.external || network.is_host() {
            debug!("Keeping network '{}', it is not managed by this cluster", network.name);
            return;
        }

        match self.runtime.delete_network(&network.name).await {
            Ok(()) => info!("Deleted network '{}'", network.name),
            Err(RuntimeError::NetworkNotFound(_)) => {}
            Err(RuntimeError::NetworkInUse(_)) => {
                if let Err(e) = self.disconnect_registries_and_retry(&network.name).await {
                    warn!(
                        "Network '{}' is still in use and was not deleted: {}",
                        network.name, e
                    );
                }
            }
            Err(e) => failures.push(network.name.clone(), e),
        }
    }

    /// Registries can outlive clusters; detach them so the network can go
    async fn disconnect_registries_and_retry(&self, network: &str) -> Result<(), RuntimeError> {
        let members = self.runtime.get_nodes_in_network(network).await?;
        if members.iter().any(|n| n.role != Role::Registry) {
            return Err(RuntimeError::NetworkInUse(network.to_string()));
        }
        for registry in &members {
            info!("Disconnecting registry '{}' from network '{}'", registry.name, network);
            self.runtime
                .disconnect_node_from_network(registry, network)
                .await?;
        }
        self.runtime.delete_network(network).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::test_cluster;
    use crate::runtime::mock::MockRuntime;
    use crate::types::{labels, ClusterNetwork};

    fn seeded(servers: usize, agents: usize) -> (Cluster, MockRuntime) {
        let runtime = MockRuntime::new();
        let mut cluster = test_cluster(servers, agents);
        for node in cluster.nodes.iter_mut() {
            node.networks = vec!["k3d-dev".to_string()];
            node.state.running = true;
            runtime.add_node(node.clone());
        }
        runtime.add_network(ClusterNetwork::new("k3d-dev"));
        (cluster, runtime)
    }

    fn registry(name: &str, networks: &[&str]) -> Node {
        let mut node = Node::new(name, Role::Registry, "registry:2");
        node.networks = networks.iter().map(|n| n.to_string()).collect();
        node.runtime_labels
            .insert(labels::LABEL_ROLE.to_string(), "registry".to_string());
        node
    }

    #[tokio::test]
    async fn test_delete_reports_single_failure() {
        let (cluster, runtime) = seeded(1, 2);
        runtime.fail("delete_node", "k3d-dev-agent-0");
        let orchestrator = ClusterOrchestrator::new(runtime);

        let err = orchestrator
            .cluster_delete(&cluster, &ClusterDeleteOpts::default())
            .await
            .unwrap_err();

        assert_eq!(
            orchestrator.runtime().targets("delete_node"),
            vec!["k3d-dev-server-0", "k3d-dev-agent-0", "k3d-dev-agent-1"]
        );
        match err {
            ClusterError::Partial(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures.failures[0].0, "k3d-dev-agent-0");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_delete_removes_network_and_volumes() {
        let (mut cluster, runtime) = seeded(1, 1);
        cluster.volumes = vec!["k3d-dev-images".to_string()];
        let orchestrator = ClusterOrchestrator::new(runtime);

        orchestrator
            .cluster_delete(&cluster, &ClusterDeleteOpts::default())
            .await
            .unwrap();

        let runtime = orchestrator.runtime();
        assert!(runtime.node_names().is_empty());
        assert!(!runtime.has_network("k3d-dev"));
        assert_eq!(runtime.targets("delete_volume"), vec!["k3d-dev-images"]);
    }

    #[tokio::test]
    async fn test_delete_keeps_external_network() {
        let (mut cluster, runtime) = seeded(1, 0);
        cluster.network.external = true;
        let orchestrator = ClusterOrchestrator::new(runtime);

        orchestrator
            .cluster_delete(&cluster, &ClusterDeleteOpts::default())
            .await
            .unwrap();
        assert!(orchestrator.runtime().has_network("k3d-dev"));
        assert!(orchestrator.runtime().targets("delete_network").is_empty());
    }

    #[tokio::test]
    async fn test_delete_disconnects_lingering_registry() {
        let (cluster, runtime) = seeded(1, 0);
        // a registry of another cluster shares the network
        runtime.add_node(registry("k3d-shared-registry", &["k3d-dev"]));
        let orchestrator = ClusterOrchestrator::new(runtime);

        orchestrator
            .cluster_delete(&cluster, &ClusterDeleteOpts::default())
            .await
            .unwrap();

        let runtime = orchestrator.runtime();
        assert_eq!(runtime.targets("delete_network"), vec!["k3d-dev", "k3d-dev"]);
        assert_eq!(runtime.targets("disconnect_network"), vec!["k3d-shared-registry"]);
        assert!(!runtime.has_network("k3d-dev"));
        assert!(runtime.stored_node("k3d-shared-registry").is_some());
    }

    #[tokio::test]
    async fn test_network_in_use_by_foreign_node_is_a_warning() {
        let (cluster, runtime) = seeded(1, 0);
        let mut foreign = Node::new("other", Role::None, "busybox");
        foreign.networks = vec!["k3d-dev".to_string()];
        runtime.add_node(foreign);
        let orchestrator = ClusterOrchestrator::new(runtime);

        orchestrator
            .cluster_delete(&cluster, &ClusterDeleteOpts::default())
            .await
            .unwrap();
        assert!(orchestrator.runtime().has_network("k3d-dev"));
    }

    #[tokio::test]
    async fn test_shared_registry_is_only_disconnected() {
        let (mut cluster, runtime) = seeded(1, 0);
        let reg = registry("k3d-registry", &["k3d-dev", "k3d-other"]);
        runtime.add_node(reg.clone());
        cluster.nodes.push(reg);
        let orchestrator = ClusterOrchestrator::new(runtime);

        orchestrator
            .cluster_delete(&cluster, &ClusterDeleteOpts::default())
            .await
            .unwrap();

        let runtime = orchestrator.runtime();
        assert!(!runtime.targets("delete_node").contains(&"k3d-registry".to_string()));
        assert_eq!(
            runtime.stored_node("k3d-registry").unwrap().networks,
            vec!["k3d-other"]
        );
    }

    #[tokio::test]
    async fn test_stop_is_best_effort() {
        let (mut cluster, runtime) = seeded(1, 2);
        runtime.fail("stop_node", "k3d-dev-server-0");
        let orchestrator = ClusterOrchestrator::new(runtime);

        let err = orchestrator.cluster_stop(&mut cluster).await.unwrap_err();
        assert!(matches!(err, ClusterError::Partial(ref f) if f.len() == 1));
        assert_eq!(orchestrator.runtime().targets("stop_node").len(), 3);
        assert!(cluster.nodes[0].state.running);
        assert!(!cluster.nodes[1].state.running);
    }
}
