//! CLI module for k3d
//!
//! Subcommands:
//! - `k3d cluster create|start|stop|delete|list`
//! - `k3d node add|list`

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "k3d")]
#[command(about = "Run multi-node k3s clusters in Docker")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage clusters
    Cluster(ClusterArgs),

    /// Manage nodes of existing clusters
    Node(NodeArgs),
}

#[derive(Parser, Debug)]
pub struct ClusterArgs {
    #[command(subcommand)]
    pub action: ClusterAction,
}

#[derive(Subcommand, Debug)]
pub enum ClusterAction {
    /// Create a new cluster
    Create(ClusterCreateArgs),

    /// Start stopped clusters
    Start {
        /// Cluster names
        #[arg(required = true)]
        names: Vec<String>,

        /// Do not wait for the servers to be ready
        #[arg(long)]
        no_wait: bool,

        /// Abort after this long, e.g. 90s or 2m
        #[arg(long)]
        timeout: Option<String>,
    },

    /// Stop clusters
    Stop {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Delete clusters with their network and volumes
    #[command(visible_alias = "rm")]
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// List clusters
    #[command(visible_alias = "ls")]
    List {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
}

/// Arguments of `cluster create`. Flags override values from `--config`.
#[derive(Parser, Debug, Default)]
pub struct ClusterCreateArgs {
    /// Cluster name (required unless given in the config file)
    pub name: Option<String>,

    /// Cluster config file (YAML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(short, long)]
    pub servers: Option<usize>,

    #[arg(short, long)]
    pub agents: Option<usize>,

    /// k3s image for servers and agents
    #[arg(short, long)]
    pub image: Option<String>,

    /// Join an existing network instead of creating one
    #[arg(long)]
    pub network: Option<String>,

    /// Subnet of the cluster network: a CIDR or "auto"
    #[arg(long)]
    pub subnet: Option<String>,

    /// Join token (random when omitted)
    #[arg(long)]
    pub token: Option<String>,

    /// Host port of the Kubernetes API, as [HOST_IP:]PORT
    #[arg(long, value_name = "[HOST_IP:]PORT")]
    pub api_port: Option<String>,

    /// Port mapping, e.g. 8080:80@loadbalancer
    #[arg(short, long = "port", value_name = "SPEC@FILTER")]
    pub ports: Vec<String>,

    /// Volume mount, e.g. /data:/data@agent:*
    #[arg(long = "volume", value_name = "SPEC@FILTER")]
    pub volumes: Vec<String>,

    /// Runtime label, e.g. tier=db@server:0
    #[arg(long = "label", value_name = "KEY=VAL@FILTER")]
    pub labels: Vec<String>,

    /// Environment variable, e.g. FOO=bar@all
    #[arg(short, long = "env", value_name = "KEY=VAL@FILTER")]
    pub env: Vec<String>,

    /// Abort after this long, e.g. 90s or 2m
    #[arg(long)]
    pub timeout: Option<String>,

    /// Do not create the server load balancer
    #[arg(long)]
    pub no_lb: bool,

    /// Do not create the image volume
    #[arg(long)]
    pub no_image_volume: bool,

    /// Do not wait for the servers to be ready
    #[arg(long)]
    pub no_wait: bool,
}

#[derive(Parser, Debug)]
pub struct NodeArgs {
    #[command(subcommand)]
    pub action: NodeAction,
}

#[derive(Subcommand, Debug)]
pub enum NodeAction {
    /// Add nodes to an existing cluster
    Add {
        /// Node name; with --replicas a `-<i>` suffix is appended
        name: String,

        /// Cluster to join
        #[arg(short, long, default_value = "k3s-default")]
        cluster: String,

        /// server or agent
        #[arg(long, default_value = "agent")]
        role: String,

        /// Image (defaults to the image of the cluster)
        #[arg(short, long)]
        image: Option<String>,

        #[arg(long, default_value_t = 1)]
        replicas: usize,

        /// Do not wait for the node to be ready
        #[arg(long)]
        no_wait: bool,

        #[arg(long)]
        timeout: Option<String>,
    },

    /// List nodes
    #[command(visible_alias = "ls")]
    List {
        /// Only nodes of this cluster
        #[arg(short, long)]
        cluster: Option<String>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}
