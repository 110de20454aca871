//! Cluster Membership Management
//!
//! Local cache of the known nodes, which one is master and how each peer
//! answered its last health check. Membership is never replicated; every
//! node discovers and verifies its peers on its own.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Reachability of a node as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Never checked
    Unknown,
    /// Answered the last health check
    Reachable,
    /// Failed the last health check
    Unreachable,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Unknown => write!(f, "UNKNOWN"),
            NodeStatus::Reachable => write!(f, "REACHABLE"),
            NodeStatus::Unreachable => write!(f, "UNREACHABLE"),
        }
    }
}

/// State of a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Gateway address (host:port)
    pub address: String,
    /// Whether this node is believed to be master
    pub is_master: bool,
    /// Last completed health check
    pub last_health_check: Option<DateTime<Utc>>,
    /// Result of the last health check
    pub status: NodeStatus,
    /// Addresses the host part resolved to
    #[serde(skip)]
    pub ips: Vec<IpAddr>,
}

impl ClusterNode {
    /// Create a new node entry
    pub fn new(address: String) -> Self {
        Self {
            address,
            is_master: false,
            last_health_check: None,
            status: NodeStatus::Unknown,
            ips: Vec::new(),
        }
    }
}

/// Cluster membership tracker
pub struct ClusterMembership {
    /// This node's advertised address
    self_address: String,
    /// All known nodes, including self, keyed by address
    nodes: RwLock<HashMap<String, ClusterNode>>,
}

impl ClusterMembership {
    /// Create a new cluster membership tracker
    pub fn new(self_address: String) -> Self {
        let mut nodes = HashMap::new();
        let mut self_node = ClusterNode::new(self_address.clone());
        self_node.status = NodeStatus::Reachable;
        nodes.insert(self_address.clone(), self_node);

        Self {
            self_address,
            nodes: RwLock::new(nodes),
        }
    }

    /// This node's advertised address
    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    /// Add a peer node, resolving its host for admission checks
    pub async fn add_peer(&self, address: String) {
        if address == self.self_address {
            tracing::debug!("Skipping peer {} (that's us)", address);
            return;
        }

        let ips = resolve(&address).await;
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .entry(address.clone())
            .or_insert_with(|| ClusterNode::new(address));
        node.ips = ips;
    }

    /// Get a node's state
    pub async fn get_node(&self, address: &str) -> Option<ClusterNode> {
        self.nodes.read().await.get(address).cloned()
    }

    /// All peer nodes (excluding self), sorted by address
    pub async fn peers(&self) -> Vec<ClusterNode> {
        let nodes = self.nodes.read().await;
        let mut peers: Vec<_> = nodes
            .values()
            .filter(|n| n.address != self.self_address)
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    /// Peer addresses (excluding self), sorted
    pub async fn peer_addresses(&self) -> Vec<String> {
        self.peers().await.into_iter().map(|n| n.address).collect()
    }

    /// Mark `address` as master, or clear the master with `None`
    pub async fn set_master(&self, address: Option<&str>) {
        let mut nodes = self.nodes.write().await;
        for node in nodes.values_mut() {
            node.is_master = false;
        }
        if let Some(address) = address {
            nodes
                .entry(address.to_string())
                .or_insert_with(|| ClusterNode::new(address.to_string()))
                .is_master = true;
        }
    }

    /// Current master, if known
    pub async fn master(&self) -> Option<ClusterNode> {
        let nodes = self.nodes.read().await;
        nodes.values().find(|n| n.is_master).cloned()
    }

    /// Address of the current master, if known
    pub async fn master_address(&self) -> Option<String> {
        self.master().await.map(|n| n.address)
    }

    /// Whether this node is the master
    pub async fn is_self_master(&self) -> bool {
        self.master_address().await.as_deref() == Some(self.self_address.as_str())
    }

    /// Record the outcome of a health check
    pub async fn record_health(&self, address: &str, reachable: bool) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(address) {
            node.last_health_check = Some(Utc::now());
            node.status = if reachable {
                NodeStatus::Reachable
            } else {
                NodeStatus::Unreachable
            };
        } else {
            tracing::warn!("record_health: node '{}' not in cluster membership", address);
        }
    }

    /// Re-resolve peers whose host did not resolve at startup
    pub async fn refresh_unresolved(&self) {
        let unresolved: Vec<String> = {
            let nodes = self.nodes.read().await;
            nodes
                .values()
                .filter(|n| n.address != self.self_address && n.ips.is_empty())
                .map(|n| n.address.clone())
                .collect()
        };

        for address in unresolved {
            let ips = resolve(&address).await;
            if ips.is_empty() {
                continue;
            }
            if let Some(node) = self.nodes.write().await.get_mut(&address) {
                node.ips = ips;
            }
        }
    }

    /// Whether `ip` belongs to a known peer
    pub async fn is_peer_ip(&self, ip: IpAddr) -> bool {
        let ip = canonical_ip(ip);
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|n| n.address != self.self_address)
            .any(|n| n.ips.iter().any(|peer| canonical_ip(*peer) == ip))
    }

    /// Get cluster summary
    pub async fn summary(&self) -> ClusterSummary {
        let nodes = self.nodes.read().await;
        let mut summary = ClusterSummary {
            total_nodes: nodes.len(),
            reachable_nodes: 0,
            unreachable_nodes: 0,
            master: None,
        };

        for node in nodes.values() {
            match node.status {
                NodeStatus::Reachable => summary.reachable_nodes += 1,
                NodeStatus::Unreachable => summary.unreachable_nodes += 1,
                NodeStatus::Unknown => {}
            }
            if node.is_master {
                summary.master = Some(node.address.clone());
            }
        }

        summary
    }
}

/// Cluster summary information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub total_nodes: usize,
    pub reachable_nodes: usize,
    pub unreachable_nodes: usize,
    pub master: Option<String>,
}

/// Collapse IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) to IPv4
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

async fn resolve(address: &str) -> Vec<IpAddr> {
    match tokio::net::lookup_host(address).await {
        Ok(addrs) => {
            let mut ips: Vec<IpAddr> = addrs.map(|a| canonical_ip(a.ip())).collect();
            ips.dedup();
            ips
        }
        Err(e) => {
            tracing::warn!("Could not resolve peer {}: {}", address, e);
            Vec::new()
        }
    }
}
