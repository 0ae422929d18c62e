//! Node readiness: poll a node's logs until a role specific marker shows up

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::runtime::{Runtime, RuntimeError};
use crate::types::{Intent, Node, Role, WaitOptions};

/// Readiness wait failures
#[derive(Error, Debug)]
pub enum WaitError {
    #[error("Timed out waiting for node '{node}' to log '{marker}'")]
    Timeout { node: String, marker: String },

    #[error("Cancelled while waiting for node '{0}'")]
    Cancelled(String),

    #[error("Node '{node}' is crash-looping: restarted {restarts} times (limit {limit})")]
    CrashLoop { node: String, restarts: u32, limit: u32 },

    #[error("Runtime error while waiting: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Readiness markers per role and intent. A server booting a fresh cluster is
/// usable once containerd runs; on restart it has to bring up the API server.
const READY_LOG_MESSAGES: &[(Role, Intent, &str)] = &[
    (Role::Server, Intent::ClusterCreate, "Containerd is now running"),
    (Role::Server, Intent::ClusterStart, "Running kube-apiserver"),
    (Role::Server, Intent::Any, "Running kube-apiserver"),
    (Role::Agent, Intent::Any, "Successfully registered node"),
    (Role::LoadBalancer, Intent::Any, "start worker processes"),
    (Role::Registry, Intent::Any, "listening on"),
];

/// Marker to wait for. Unknown intents fall back to [`Intent::Any`]; an
/// empty marker means the role has nothing to wait for.
pub fn ready_log_message(role: Role, intent: Intent) -> &'static str {
    let lookup = |intent: Intent| {
        READY_LOG_MESSAGES
            .iter()
            .find(|(r, i, _)| *r == role && *i == intent)
            .map(|(_, _, msg)| *msg)
    };
    lookup(intent).or_else(|| lookup(Intent::Any)).unwrap_or("")
}

/// Poll `node`'s logs (since `since`) until `marker` appears.
///
/// Fails with [`WaitError::CrashLoop`] once the node restarted more than
/// `opts.backoff_limit` times, with [`WaitError::Cancelled`] when `cancel`
/// fires and with [`WaitError::Timeout`] after `opts.timeout`.
pub async fn wait_for_log_message<R: Runtime + ?Sized>(
    runtime: &R,
    node: &Node,
    marker: &str,
    since: Option<DateTime<Utc>>,
    opts: &WaitOptions,
    cancel: &CancellationToken,
) -> Result<(), WaitError> {
    if cancel.is_cancelled() {
        return Err(WaitError::Cancelled(node.name.clone()));
    }
    if marker.is_empty() {
        return Ok(());
    }

    debug!("Waiting for node '{}' to log '{}'", node.name, marker);

    let wait = async {
        tokio::select! {
            result = poll_logs(runtime, node, marker, since, opts) => result,
            _ = cancel.cancelled() => Err(WaitError::Cancelled(node.name.clone())),
        }
    };

    match opts.timeout {
        Some(limit) => tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| WaitError::Timeout {
                node: node.name.clone(),
                marker: marker.to_string(),
            })?,
        None => wait.await,
    }
}

async fn poll_logs<R: Runtime + ?Sized>(
    runtime: &R,
    node: &Node,
    marker: &str,
    since: Option<DateTime<Utc>>,
    opts: &WaitOptions,
) -> Result<(), WaitError> {
    loop {
        let logs = runtime.get_node_logs(node, since).await?;
        if logs.contains(marker) {
            debug!("Node '{}' is ready", node.name);
            // don't hammer the log API of the next node right away
            tokio::time::sleep(opts.settle_delay).await;
            return Ok(());
        }

        let current = runtime.get_node(&node.name).await?;
        if current.state.restart_count > opts.backoff_limit {
            return Err(WaitError::CrashLoop {
                node: node.name.clone(),
                restarts: current.state.restart_count,
                limit: opts.backoff_limit,
            });
        }

        trace!("Marker not yet in logs of '{}'", node.name);
        tokio::time::sleep(opts.poll_interval).await;
    }
}
