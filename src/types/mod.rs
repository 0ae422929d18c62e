//! Data model shared by the orchestrator, the runtime and the CLI

pub mod cluster;
pub mod labels;
pub mod network;
pub mod node;

pub use cluster::{
    Cluster, ClusterCreateOpts, ClusterDeleteOpts, ClusterStartOpts, HostAlias, Intent, NodeCreateOpts,
    LoadbalancerSettings, WaitOptions, DEFAULT_K3S_IMAGE, DEFAULT_LB_IMAGE, MAX_CLUSTER_NAME_LEN,
};
pub use network::{default_network_name, ClusterNetwork, Ipam, NetworkMember};
pub use node::{
    node_name, HookAction, HookStage, KubeApi, Node, NodeHook, NodeIP, NodeSpecError, NodeState,
    PortBinding, PortMapping, Role, ServerOpts, DEFAULT_API_PORT, IMAGE_VOLUME_MOUNT_PATH,
};
