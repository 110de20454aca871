//! State Management Module
//!
//! Local view of the cluster: known nodes, the current master and peer health.

mod membership;

pub use membership::{canonical_ip, ClusterMembership, ClusterNode, ClusterSummary, NodeStatus};
