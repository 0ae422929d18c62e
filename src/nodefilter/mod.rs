//! Node filter expressions
//!
//! A node filter selects nodes of a cluster by role and index:
//!
//! ```text
//! group[:subset][:suffix]
//!   group  = server | servers | agent | agents | loadbalancer | all
//!   subset = 0,2,3 | 1-2 | -1 | 2- | *
//!   suffix = [a-zA-Z]+   (not interpreted here)
//! ```
//!
//! Resolution is pure. Indices outside of the group are an error, a filter
//! never silently resolves to nothing.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::warn;

use crate::types::{Node, Role};

/// Bucket for filters given without suffix
pub const NO_SUFFIX: &str = "none";

static NODE_FILTER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<group>servers?|agents?|loadbalancer|all)(?::(?P<subset>(?P<list>\d+(?:,\d+)*)|(?P<range>\d*-\d*)|(?P<wildcard>\*)))?(?::(?P<suffix>[[:alpha:]]+))?$",
    )
    .expect("node filter regex is valid")
});

#[derive(Error, Debug, PartialEq)]
pub enum NodeFilterError {
    #[error("Invalid node filter '{0}': expected group[:subset][:suffix] with group one of server, agent, loadbalancer, all")]
    InvalidSyntax(String),

    #[error("Node filter '{filter}' references index {index}, but there are only {len} {group} nodes")]
    IndexOutOfRange {
        filter: String,
        group: String,
        index: usize,
        len: usize,
    },

    #[error("Node filter '{0}' has a range whose start is greater than its end")]
    InvalidRange(String),

    #[error("Node filter '{0}' targets the loadbalancer, but the cluster has none")]
    NoLoadBalancer(String),

    #[error("Node filter '{filter}' uses suffix '{suffix}', allowed are: {allowed}")]
    SuffixNotAllowed {
        filter: String,
        suffix: String,
        allowed: String,
    },
}

/// The node group a filter targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeGroup {
    Servers,
    Agents,
    LoadBalancer,
    All,
}

impl NodeGroup {
    fn as_str(&self) -> &'static str {
        match self {
            NodeGroup::Servers => "server",
            NodeGroup::Agents => "agent",
            NodeGroup::LoadBalancer => "loadbalancer",
            NodeGroup::All => "all",
        }
    }
}

/// Which members of a group a filter selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subset {
    /// `*` or no subset at all
    Wildcard,
    List(Vec<usize>),
    /// Inclusive on both ends; open ends default to the group bounds
    Range {
        start: Option<usize>,
        end: Option<usize>,
    },
}

/// A parsed node filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFilter {
    raw: String,
    pub group: NodeGroup,
    pub subset: Subset,
    pub suffix: Option<String>,
}

impl NodeFilter {
    /// The filter text without its suffix
    pub fn without_suffix(&self) -> &str {
        match &self.suffix {
            Some(suffix) => self
                .raw
                .strip_suffix(suffix.as_str())
                .and_then(|s| s.strip_suffix(':'))
                .unwrap_or(&self.raw),
            None => &self.raw,
        }
    }
}

impl fmt::Display for NodeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for NodeFilter {
    type Err = NodeFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = NODE_FILTER_REGEX
            .captures(s.trim())
            .ok_or_else(|| NodeFilterError::InvalidSyntax(s.to_string()))?;

        let group = match &caps["group"] {
            "server" | "servers" => NodeGroup::Servers,
            "agent" | "agents" => NodeGroup::Agents,
            "loadbalancer" => NodeGroup::LoadBalancer,
            _ => NodeGroup::All,
        };

        let subset = if let Some(list) = caps.name("list") {
            let indices = list
                .as_str()
                .split(',')
                .map(|i| i.parse::<usize>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| NodeFilterError::InvalidSyntax(s.to_string()))?;
            Subset::List(indices)
        } else if let Some(range) = caps.name("range") {
            let (start, end) = range
                .as_str()
                .split_once('-')
                .ok_or_else(|| NodeFilterError::InvalidSyntax(s.to_string()))?;
            let parse = |v: &str| -> Result<Option<usize>, NodeFilterError> {
                if v.is_empty() {
                    Ok(None)
                } else {
                    v.parse()
                        .map(Some)
                        .map_err(|_| NodeFilterError::InvalidSyntax(s.to_string()))
                }
            };
            Subset::Range {
                start: parse(start)?,
                end: parse(end)?,
            }
        } else {
            Subset::Wildcard
        };

        Ok(Self {
            raw: s.trim().to_string(),
            group,
            subset,
            suffix: caps.name("suffix").map(|m| m.as_str().to_string()),
        })
    }
}

/// Resolve a subset against a group of the given length into group indices
fn resolve_subset(filter: &NodeFilter, len: usize) -> Result<Vec<usize>, NodeFilterError> {
    let out_of_range = |index: usize| NodeFilterError::IndexOutOfRange {
        filter: filter.raw.clone(),
        group: filter.group.as_str().to_string(),
        index,
        len,
    };

    match &filter.subset {
        Subset::Wildcard => Ok((0..len).collect()),
        Subset::List(indices) => {
            if let Some(&bad) = indices.iter().find(|&&i| i >= len) {
                return Err(out_of_range(bad));
            }
            Ok(indices.clone())
        }
        Subset::Range { start, end } => {
            let start = start.unwrap_or(0);
            if start >= len {
                return Err(out_of_range(start));
            }
            let end = match end {
                Some(end) => *end,
                None => len - 1,
            };
            if start > end {
                return Err(NodeFilterError::InvalidRange(filter.raw.clone()));
            }
            if end >= len {
                return Err(out_of_range(end));
            }
            Ok((start..=end).collect())
        }
    }
}

/// Resolve filters against a node list into indices of `nodes`.
///
/// The result is deduplicated and keeps first-seen order.
pub fn filter_node_indices(nodes: &[Node], filters: &[&str]) -> Result<Vec<usize>, NodeFilterError> {
    let parsed = filters
        .iter()
        .filter(|f| !f.trim().is_empty())
        .map(|f| f.parse::<NodeFilter>())
        .collect::<Result<Vec<_>, _>>()?;

    if parsed.is_empty() {
        warn!("No node filter specified, selecting all nodes");
        return Ok((0..nodes.len()).collect());
    }

    let servers: Vec<usize> = indices_with_role(nodes, Role::Server);
    let agents: Vec<usize> = indices_with_role(nodes, Role::Agent);
    let loadbalancer = nodes.iter().position(|n| n.role == Role::LoadBalancer);

    if parsed.iter().any(|f| f.group == NodeGroup::All) {
        if parsed.len() > 1 {
            warn!(
                "Node filter 'all' given together with other filters ({}), the others are redundant",
                filters.join(", ")
            );
        }
        return Ok((0..nodes.len()).collect());
    }

    let mut selected: Vec<usize> = Vec::new();
    let mut push = |idx: usize| {
        if !selected.contains(&idx) {
            selected.push(idx);
        }
    };

    for filter in &parsed {
        let group = match filter.group {
            NodeGroup::LoadBalancer => {
                let lb = loadbalancer.ok_or_else(|| NodeFilterError::NoLoadBalancer(filter.raw.clone()))?;
                push(lb);
                continue;
            }
            NodeGroup::Servers => &servers,
            NodeGroup::Agents => &agents,
            NodeGroup::All => unreachable!("'all' short-circuits above"),
        };

        for idx in resolve_subset(filter, group.len())? {
            push(group[idx]);
        }
    }

    Ok(selected)
}

/// Resolve filters against a node list
pub fn filter_nodes<'a>(nodes: &'a [Node], filters: &[&str]) -> Result<Vec<&'a Node>, NodeFilterError> {
    Ok(filter_node_indices(nodes, filters)?
        .into_iter()
        .map(|i| &nodes[i])
        .collect())
}

/// Bucket filters by suffix and resolve each bucket into node indices.
///
/// Filters without suffix land in [`NO_SUFFIX`]. When `allowed_suffixes` is
/// non-empty, any other suffix is an error. Blank filters are skipped like
/// in [`filter_node_indices`].
pub fn filter_node_indices_with_suffix(
    nodes: &[Node],
    filters: &[&str],
    allowed_suffixes: &[&str],
) -> Result<BTreeMap<String, Vec<usize>>, NodeFilterError> {
    let mut result: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    result.insert(NO_SUFFIX.to_string(), Vec::new());
    for suffix in allowed_suffixes {
        result.insert(suffix.to_string(), Vec::new());
    }

    for raw in filters.iter().filter(|f| !f.trim().is_empty()) {
        let filter: NodeFilter = raw.parse()?;
        let suffix = match &filter.suffix {
            Some(suffix) => {
                if !allowed_suffixes.is_empty() && !allowed_suffixes.contains(&suffix.as_str()) {
                    return Err(NodeFilterError::SuffixNotAllowed {
                        filter: raw.to_string(),
                        suffix: suffix.clone(),
                        allowed: allowed_suffixes.join(", "),
                    });
                }
                suffix.clone()
            }
            None => NO_SUFFIX.to_string(),
        };

        let resolved = filter_node_indices(nodes, &[filter.without_suffix()])?;
        let bucket = result.entry(suffix).or_default();
        for idx in resolved {
            if !bucket.contains(&idx) {
                bucket.push(idx);
            }
        }
    }

    Ok(result)
}

/// Suffix-aware variant of [`filter_nodes`]
pub fn filter_nodes_with_suffix<'a>(
    nodes: &'a [Node],
    filters: &[&str],
    allowed_suffixes: &[&str],
) -> Result<BTreeMap<String, Vec<&'a Node>>, NodeFilterError> {
    Ok(filter_node_indices_with_suffix(nodes, filters, allowed_suffixes)?
        .into_iter()
        .map(|(suffix, indices)| (suffix, indices.into_iter().map(|i| &nodes[i]).collect()))
        .collect())
}

fn indices_with_role(nodes: &[Node], role: Role) -> Vec<usize> {
    nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.role == role)
        .map(|(i, _)| i)
        .collect()
}
