//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use serde::Serialize;

use super::OutputFormat;
use crate::cluster::ClusterState;
use crate::types::{Cluster, Node};

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let render_row = |cells: Vec<String>| {
        let line = cells
            .into_iter()
            .enumerate()
            .map(|(i, cell)| match widths.get(i) {
                Some(width) => format!("{:width$}", cell, width = *width),
                None => cell,
            })
            .collect::<Vec<_>>()
            .join("   ");
        format!("{}\n", line.trim_end())
    };

    let mut output = render_row(headers.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        output.push_str(&render_row(row));
    }
    output
}

/// JSON or YAML rendering of list output; `None` for table output
pub fn format_structured<T: Serialize + ?Sized>(
    value: &T,
    format: OutputFormat,
) -> Option<Result<String, String>> {
    match format {
        OutputFormat::Table => None,
        OutputFormat::Json => Some(serde_json::to_string_pretty(value).map_err(|e| e.to_string())),
        OutputFormat::Yaml => Some(serde_yaml::to_string(value).map_err(|e| e.to_string())),
    }
}

// ============================================================================
// Cluster display
// ============================================================================

/// `running/total`
fn ratio(running: usize, total: usize) -> String {
    format!("{}/{}", running, total)
}

pub fn format_cluster_list(clusters: &[ClusterState]) -> String {
    let headers = &["NAME", "SERVERS", "AGENTS", "LOADBALANCER", "NETWORK"];
    let rows = clusters
        .iter()
        .map(|c| {
            vec![
                c.name.clone(),
                ratio(c.servers_running, c.servers),
                ratio(c.agents_running, c.agents),
                c.has_loadbalancer.to_string(),
                c.network.clone(),
            ]
        })
        .collect();

    format_table(headers, rows)
}

/// Summary printed after a successful create
pub fn format_cluster_created(cluster: &Cluster) -> String {
    let mut output = format!("Cluster '{}' created successfully!\n", cluster.name);
    output.push_str(&format!(
        "  Kubernetes API: https://{}:{}\n",
        cluster.kube_api.host, cluster.kube_api.host_port
    ));
    output.push_str(&format!("  Network:        {}\n", cluster.network.name));
    output.push_str(&format!(
        "  Nodes:          {} server(s), {} agent(s){}\n",
        cluster.server_count(),
        cluster.agent_count(),
        if cluster.load_balancer().is_some() {
            ", 1 load balancer"
        } else {
            ""
        }
    ));
    output
}

// ============================================================================
// Node display
// ============================================================================

pub fn format_node_list(nodes: &[Node]) -> String {
    let headers = &["NAME", "ROLE", "CLUSTER", "STATUS"];
    let rows = nodes
        .iter()
        .map(|n| {
            vec![
                n.name.clone(),
                n.role.to_string(),
                n.cluster_name().unwrap_or("").to_string(),
                if n.state.status.is_empty() {
                    if n.state.running { "running" } else { "stopped" }.to_string()
                } else {
                    n.state.status.clone()
                },
            ]
        })
        .collect();

    format_table(headers, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{labels, Role};

    #[test]
    fn test_format_table_pads_columns() {
        let headers = &["name", "role"];
        let rows = vec![
            vec!["k3d-dev-server-0".to_string(), "server".to_string()],
            vec!["k3d-dev-serverlb".to_string(), "loadbalancer".to_string()],
            vec!["k3d-dev-agent-0".to_string(), String::new()],
        ];

        let output = format_table(headers, rows);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "NAME               ROLE");
        assert_eq!(lines[1], "k3d-dev-server-0   server");
        assert_eq!(lines[2], "k3d-dev-serverlb   loadbalancer");
        assert_eq!(lines[3], "k3d-dev-agent-0");
    }

    #[test]
    fn test_empty_cluster_list() {
        assert_eq!(format_cluster_list(&[]), "No resources found.\n");
        assert_eq!(format_node_list(&[]), "No resources found.\n");
    }

    #[test]
    fn test_format_cluster_list() {
        let clusters = vec![ClusterState {
            name: "dev".to_string(),
            servers: 3,
            servers_running: 3,
            agents: 2,
            agents_running: 1,
            has_loadbalancer: true,
            network: "k3d-dev".to_string(),
            external_network: false,
            image_volume: None,
        }];

        let output = format_cluster_list(&clusters);
        assert!(output.starts_with("NAME"));
        assert!(output.contains("3/3"));
        assert!(output.contains("1/2"));
        assert!(output.contains("k3d-dev"));
    }

    #[test]
    fn test_format_node_list() {
        let mut node = Node::new("k3d-dev-server-0", Role::Server, "k3s");
        node.runtime_labels
            .insert(labels::LABEL_CLUSTER.to_string(), "dev".to_string());
        node.state.running = true;

        let output = format_node_list(&[node]);
        assert!(output.contains("k3d-dev-server-0"));
        assert!(output.contains("server"));
        assert!(output.contains("running"));
    }

    #[test]
    fn test_format_structured() {
        let nodes = vec![Node::new("a", Role::Agent, "k3s")];
        assert!(format_structured(&nodes, OutputFormat::Table).is_none());
        let json = format_structured(&nodes, OutputFormat::Json).unwrap().unwrap();
        assert!(json.contains("\"name\": \"a\""));
        let yaml = format_structured(&nodes, OutputFormat::Yaml).unwrap().unwrap();
        assert!(yaml.contains("name: a"));
    }
}
