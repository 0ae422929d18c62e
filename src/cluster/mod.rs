//! # Cluster lifecycle
//!
//! [`ClusterOrchestrator`] drives create, start, stop and delete of a
//! [`Cluster`](crate::types::Cluster) against a [`Runtime`].
//!
//! ## Create ordering
//!
//! ```text
//!   network ─► token ─► image volume ─► node prep (labels, env, static IPs)
//!                                              │
//!        ┌─────────────────────────────────────┘
//!        ▼
//!   init server ──(ready)──► server 1 ─1s─► server 2 ...   (sequential)
//!                                              │
//!                           ┌──────────────────┴──────────────┐
//!                           ▼                                 ▼
//!                     agents (concurrent)           auxiliary (concurrent)
//!                           └──────────────────┬──────────────┘
//!                                              ▼
//!                                     load balancer (last)
//! ```
//!
//! Servers join one at a time, the embedded etcd does not bootstrap
//! concurrently. Concurrent phases use `try_join_all`: the first error
//! drops the remaining futures of the batch.
//!
//! A failed create does not roll back. The cluster value is narrowed to the
//! nodes, network and volume this run created, so the caller can hand it to
//! delete without touching anything that existed before.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::loadbalancer::LoadbalancerError;
use crate::network::NetworkError;
use crate::runtime::{Runtime, RuntimeError};
use crate::types::Node;

pub mod create;
pub mod delete;
pub mod get;
pub mod node_add;
pub mod start;
pub mod validation;
pub mod wait;

pub use get::{cluster_from_nodes, get_cluster, list_clusters, ClusterState};
pub use validation::{validate_cluster, validate_cluster_name};
pub use wait::{ready_log_message, wait_for_log_message, WaitError};

/// Pause between two sequential server creations
pub const SERVER_CREATE_DELAY: Duration = Duration::from_secs(1);

/// Errors of the cluster lifecycle operations
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Invalid cluster: {0}")]
    Invalid(String),

    #[error("Cluster '{0}' not found")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Failed to {op} node '{node}': {source}")]
    Node {
        op: &'static str,
        node: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Node '{node}' did not become ready: {source}")]
    NotReady {
        node: String,
        #[source]
        source: WaitError,
    },

    #[error("Load balancer error: {0}")]
    Loadbalancer(#[from] LoadbalancerError),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Partial(BestEffortFailures),
}

impl ClusterError {
    pub(crate) fn node(op: &'static str, node: &Node, source: RuntimeError) -> Self {
        ClusterError::Node {
            op,
            node: node.name.clone(),
            source,
        }
    }

    /// The operation ran out of time, as opposed to failing outright
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ClusterError::Timeout(_)
                | ClusterError::NotReady {
                    source: WaitError::Timeout { .. },
                    ..
                }
        )
    }
}

/// Failures collected by a best-effort loop over nodes
#[derive(Debug)]
pub struct BestEffortFailures {
    pub op: &'static str,
    pub failures: Vec<(String, RuntimeError)>,
}

impl BestEffortFailures {
    pub fn new(op: &'static str) -> Self {
        Self {
            op,
            failures: Vec::new(),
        }
    }

    pub fn push(&mut self, target: impl Into<String>, error: RuntimeError) {
        let target = target.into();
        warn!("Failed to {} '{}': {}", self.op, target, error);
        self.failures.push((target, error));
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> Result<(), ClusterError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ClusterError::Partial(self))
        }
    }
}

impl fmt::Display for BestEffortFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to {} {} node(s)", self.op, self.failures.len())?;
        for (i, (target, error)) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{} ({})", sep, target, error)?;
        }
        Ok(())
    }
}

/// Run `op` on every node, continuing past failures
pub(crate) async fn for_each_best_effort<'a, I, F, Fut>(
    op: &'static str,
    nodes: I,
    mut f: F,
) -> BestEffortFailures
where
    I: IntoIterator<Item = &'a Node>,
    F: FnMut(&'a Node) -> Fut,
    Fut: Future<Output = Result<(), RuntimeError>>,
{
    let mut failures = BestEffortFailures::new(op);
    for node in nodes {
        if let Err(e) = f(node).await {
            failures.push(node.name.clone(), e);
        }
    }
    failures
}

/// Runs lifecycle operations of clusters against one runtime
pub struct ClusterOrchestrator<R: Runtime> {
    runtime: R,
    cancel: CancellationToken,
}

impl<R: Runtime> ClusterOrchestrator<R> {
    pub fn new(runtime: R) -> Self {
        Self::with_cancellation(runtime, CancellationToken::new())
    }

    /// Create, start and node add fail with [`ClusterError::Cancelled`]
    /// once `cancel` fires; the runtime call in flight is dropped.
    pub fn with_cancellation(runtime: R, cancel: CancellationToken) -> Self {
        Self { runtime, cancel }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Run `fut` under an optional deadline
pub(crate) async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T, ClusterError>
where
    F: Future<Output = Result<T, ClusterError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ClusterError::Timeout(limit))?,
        None => fut.await,
    }
}

/// Run `fut` until it completes or `cancel` fires
pub(crate) async fn until_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ClusterError>
where
    F: Future<Output = Result<T, ClusterError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ClusterError::Cancelled),
        result = fut => result,
    }
}

/// `servers` servers (the first one init when there are several) and
/// `agents` agents named the standard way, in cluster `dev`
#[cfg(test)]
pub(crate) fn test_cluster(servers: usize, agents: usize) -> crate::types::Cluster {
    use crate::types::{node_name, Cluster, Role, DEFAULT_K3S_IMAGE};

    let mut cluster = Cluster::new("dev");
    for i in 0..servers {
        let mut node = Node::new(
            node_name("dev", &format!("server-{}", i)),
            Role::Server,
            DEFAULT_K3S_IMAGE,
        );
        node.server_opts.is_init = servers > 1 && i == 0;
        cluster.nodes.push(node);
    }
    for i in 0..agents {
        cluster.nodes.push(Node::new(
            node_name("dev", &format!("agent-{}", i)),
            Role::Agent,
            DEFAULT_K3S_IMAGE,
        ));
    }
    cluster
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[tokio::test]
    async fn test_best_effort_continues_past_failures() {
        let nodes = vec![
            Node::new("a", Role::Agent, "i"),
            Node::new("b", Role::Agent, "i"),
            Node::new("c", Role::Agent, "i"),
        ];
        let mut seen = Vec::new();
        let failures = for_each_best_effort("stop", &nodes, |node| {
            seen.push(node.name.clone());
            let fail = node.name == "b";
            async move {
                if fail {
                    Err(RuntimeError::NodeNotFound("b".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures.to_string(),
            "failed to stop 1 node(s): b (Node 'b' not found)"
        );
    }

    #[test]
    fn test_empty_failures_are_ok() {
        assert!(BestEffortFailures::new("delete").into_result().is_ok());
    }

    #[tokio::test]
    async fn test_until_cancelled_skips_pending_work() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut polled = false;
        let result = until_cancelled(&cancel, async {
            polled = true;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(ClusterError::Cancelled)));
        assert!(!polled);
    }

    #[tokio::test]
    async fn test_until_cancelled_passes_result_through() {
        let result = until_cancelled(&CancellationToken::new(), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_is_timeout() {
        assert!(ClusterError::Timeout(Duration::from_secs(1)).is_timeout());
        let not_ready = ClusterError::NotReady {
            node: "n".to_string(),
            source: WaitError::Timeout {
                node: "n".to_string(),
                marker: "m".to_string(),
            },
        };
        assert!(not_ready.is_timeout());
        assert!(!ClusterError::NotFound("x".to_string()).is_timeout());
    }
}
