use std::process;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use k3d::cli::{
    build_cluster_config, cluster_create_cmd, cluster_delete_cmd, cluster_list_cmd, cluster_start_cmd,
    cluster_stop_cmd, format_cluster_created, format_cluster_list, format_node_list, format_structured,
    node_add_cmd, node_list_cmd, Cli, ClusterAction, Commands, NodeAction, NodeAddRequest, OutputFormat,
};
use k3d::cluster::ClusterOrchestrator;
use k3d::runtime::DockerRuntime;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Ctrl+C aborts create, start and node add
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, cancelling");
            on_signal.cancel();
        }
    });

    let orchestrator = ClusterOrchestrator::with_cancellation(DockerRuntime::new(), cancel);

    if let Err(e) = run(cli.command, &orchestrator).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(command: Commands, orchestrator: &ClusterOrchestrator<DockerRuntime>) -> anyhow::Result<()> {
    match command {
        Commands::Cluster(args) => match args.action {
            ClusterAction::Create(args) => {
                let config = build_cluster_config(&args).context("invalid cluster configuration")?;
                let cluster = cluster_create_cmd(orchestrator, config).await?;
                print!("{}", format_cluster_created(&cluster));
            }
            ClusterAction::Start {
                names,
                no_wait,
                timeout,
            } => cluster_start_cmd(orchestrator, &names, !no_wait, timeout.as_deref()).await?,
            ClusterAction::Stop { names } => cluster_stop_cmd(orchestrator, &names).await?,
            ClusterAction::Delete { names } => cluster_delete_cmd(orchestrator, &names).await?,
            ClusterAction::List { output } => {
                let clusters = cluster_list_cmd(orchestrator.runtime()).await?;
                print_list(&clusters, output, format_cluster_list)?;
            }
        },
        Commands::Node(args) => match args.action {
            NodeAction::Add {
                name,
                cluster,
                role,
                image,
                replicas,
                no_wait,
                timeout,
            } => {
                let request = NodeAddRequest {
                    name,
                    cluster,
                    role,
                    image,
                    replicas,
                    wait: !no_wait,
                    timeout,
                };
                for node in node_add_cmd(orchestrator, &request).await? {
                    println!("Node '{}' added to cluster '{}'", node.name, request.cluster);
                }
            }
            NodeAction::List { cluster, output } => {
                let nodes = node_list_cmd(orchestrator.runtime(), cluster.as_deref()).await?;
                print_list(&nodes, output, format_node_list)?;
            }
        },
    }
    Ok(())
}

fn print_list<T: serde::Serialize>(items: &[T], output: OutputFormat, table: fn(&[T]) -> String) -> anyhow::Result<()> {
    match format_structured(items, output) {
        Some(rendered) => println!("{}", rendered.map_err(anyhow::Error::msg)?),
        None => print!("{}", table(items)),
    }
    Ok(())
}
