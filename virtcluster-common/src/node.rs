//! Per-node identity derived from the cluster description

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Role a node plays in the cluster
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Control,
    Worker(usize),
}

impl NodeRole {
    pub fn is_control(&self) -> bool {
        matches!(self, NodeRole::Control)
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Control => write!(f, "control"),
            NodeRole::Worker(index) => write!(f, "worker-{:02}", index),
        }
    }
}

/// Everything needed to provision one node. Recomputed on every run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSpec {
    pub index: usize,
    pub role: NodeRole,
    pub name: String,
    pub ip: Ipv4Addr,
    /// Overlay volume name inside the pool
    pub image_name: String,
    /// Boot configuration directory name inside the pool
    pub config_dir: String,
    pub mac: String,
}

impl NodeSpec {
    pub fn new(prefix: &str, index: usize, role: NodeRole, name: &str, ip: Ipv4Addr) -> Self {
        Self {
            index,
            role,
            name: name.to_string(),
            ip,
            image_name: format!("{}.img", name),
            config_dir: format!("{}_config_{}", prefix, role),
            mac: format!("52:54:00:00:{:02x}:{:02x}", (index + 1) >> 8, (index + 1) & 0xff),
        }
    }
}
