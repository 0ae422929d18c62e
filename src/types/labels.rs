//! Runtime label keys
//!
//! Container labels are the only persistence format: a cluster is fully
//! reconstructible from the labels on its containers, networks and volumes.
//! The keys below are a wire contract. Adding keys is compatible, renaming or
//! changing the meaning of a key requires bumping [`LABEL_SCHEMA_VERSION`].

use std::collections::HashMap;

/// Version of the label schema written by this crate
pub const LABEL_SCHEMA_VERSION: &str = "5";

/// Marks every object managed by this tool
pub const LABEL_APP: &str = "app";
pub const LABEL_APP_VALUE: &str = "k3d";

/// Label schema version the object was created with
pub const LABEL_VERSION: &str = "k3d.version";

/// Name of the cluster a node/network/volume belongs to
pub const LABEL_CLUSTER: &str = "k3d.cluster";

/// Node role (`server`, `agent`, `loadbalancer`, `registry`)
pub const LABEL_ROLE: &str = "k3d.role";

/// Name of the cluster network
pub const LABEL_NETWORK: &str = "k3d.cluster.network";

/// Network ID as reported by the runtime
pub const LABEL_NETWORK_ID: &str = "k3d.cluster.network.id";

/// `true` when the network is managed by the caller and must not be deleted
pub const LABEL_NETWORK_EXTERNAL: &str = "k3d.cluster.network.external";

/// Subnet (CIDR) of the cluster network
pub const LABEL_NETWORK_IPRANGE: &str = "k3d.cluster.network.iprange";

/// Shared join secret
pub const LABEL_TOKEN: &str = "k3d.cluster.token";

/// Name of the image volume shared by server and agent nodes
pub const LABEL_IMAGE_VOLUME: &str = "k3d.cluster.imageVolume";

/// Host the Kubernetes API is exposed on
pub const LABEL_SERVER_API_HOST: &str = "k3d.server.api.host";

/// Host IP the Kubernetes API is bound to
pub const LABEL_SERVER_API_HOST_IP: &str = "k3d.server.api.hostIP";

/// Host port the Kubernetes API is exposed on
pub const LABEL_SERVER_API_PORT: &str = "k3d.server.api.port";

/// `true` on the server that bootstrapped the clustered datastore
pub const LABEL_SERVER_IS_INIT: &str = "k3d.server.init";

/// `true` when the node's IP was assigned by the IP allocator
pub const LABEL_NODE_STATIC_IP: &str = "k3d.node.staticIP";

/// Labels every node created by this crate carries in addition to the
/// cluster-specific ones
pub fn default_runtime_labels() -> HashMap<String, String> {
    HashMap::from([
        (LABEL_APP.to_string(), LABEL_APP_VALUE.to_string()),
        (LABEL_VERSION.to_string(), LABEL_SCHEMA_VERSION.to_string()),
    ])
}

/// Label selector matching every object of one cluster
pub fn cluster_selector(cluster_name: &str) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_APP.to_string(), LABEL_APP_VALUE.to_string()),
        (LABEL_CLUSTER.to_string(), cluster_name.to_string()),
    ])
}

/// Label selector matching every object managed by this crate
pub fn app_selector() -> HashMap<String, String> {
    HashMap::from([(LABEL_APP.to_string(), LABEL_APP_VALUE.to_string())])
}

/// Parse a boolean label value, treating anything but `true` as false
pub fn is_true(labels: &HashMap<String, String>, key: &str) -> bool {
    labels.get(key).map(|v| v == "true").unwrap_or(false)
}
