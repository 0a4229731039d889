//! Common types shared between virtcluster-core and virtcluster-cli

pub mod node;
pub mod teardown;

pub use node::{NodeRole, NodeSpec};
pub use teardown::{TeardownFailure, TeardownReport};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Release channel of the base disk image
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageChannel {
    Stable,
    Beta,
    #[default]
    Alpha,
}

impl ImageChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Beta => "beta",
            Self::Alpha => "alpha",
        }
    }
}

impl std::fmt::Display for ImageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ImageChannel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "stable" => Ok(Self::Stable),
            "beta" => Ok(Self::Beta),
            "alpha" => Ok(Self::Alpha),
            other => Err(Error::InvalidConfig(format!(
                "Unknown image channel '{}' (expected stable, beta or alpha)",
                other
            ))),
        }
    }
}

/// Where node logs are shipped when node logging is enabled
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoggingDestination {
    #[default]
    Elasticsearch,
    Gcp,
}

impl LoggingDestination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Elasticsearch => "elasticsearch",
            Self::Gcp => "gcp",
        }
    }
}

impl std::fmt::Display for LoggingDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoggingDestination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "elasticsearch" => Ok(Self::Elasticsearch),
            "gcp" => Ok(Self::Gcp),
            other => Err(Error::InvalidConfig(format!(
                "Unknown logging destination '{}' (expected elasticsearch or gcp)",
                other
            ))),
        }
    }
}

/// Optional add-ons installed into the pool
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureFlags {
    pub cluster_dns: bool,
    pub node_monitoring: bool,
    pub node_logging: bool,
    pub logging_destination: LoggingDestination,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            cluster_dns: true,
            node_monitoring: true,
            node_logging: false,
            logging_destination: LoggingDestination::Elasticsearch,
        }
    }
}

/// Static description of the cluster, built once and never mutated
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterConfig {
    pub instance_prefix: String,
    pub control_name: String,
    pub control_ip: Ipv4Addr,
    pub worker_names: Vec<String>,
    pub worker_ips: Vec<Ipv4Addr>,
    pub worker_count: usize,
    pub features: FeatureFlags,
    pub image_channel: ImageChannel,
}

impl ClusterConfig {
    /// Build a validated cluster description
    pub fn new(
        instance_prefix: impl Into<String>,
        control_name: impl Into<String>,
        control_ip: Ipv4Addr,
        workers: Vec<(String, Ipv4Addr)>,
    ) -> Result<Self> {
        let (worker_names, worker_ips): (Vec<_>, Vec<_>) = workers.into_iter().unzip();
        let config = Self {
            instance_prefix: instance_prefix.into(),
            control_name: control_name.into(),
            control_ip,
            worker_count: worker_names.len(),
            worker_names,
            worker_ips,
            features: FeatureFlags::default(),
            image_channel: ImageChannel::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    pub fn with_image_channel(mut self, channel: ImageChannel) -> Self {
        self.image_channel = channel;
        self
    }

    /// Check the list invariants and node naming
    pub fn validate(&self) -> Result<()> {
        if self.instance_prefix.is_empty() {
            return Err(Error::InvalidConfig("Instance prefix cannot be empty".to_string()));
        }

        if self.worker_names.len() != self.worker_ips.len() {
            return Err(Error::InvalidConfig(format!(
                "{} worker names but {} worker IPs",
                self.worker_names.len(),
                self.worker_ips.len()
            )));
        }

        if self.worker_count != self.worker_names.len() {
            return Err(Error::InvalidConfig(format!(
                "Worker count is {} but {} workers are listed",
                self.worker_count,
                self.worker_names.len()
            )));
        }

        let mut seen = HashSet::new();
        for name in self.worker_names.iter().chain(std::iter::once(&self.control_name)) {
            if name.trim().is_empty() {
                return Err(Error::InvalidConfig("Node names cannot be empty".to_string()));
            }
            if !seen.insert(name.as_str()) {
                return Err(Error::InvalidConfig(format!("Duplicate node name: {}", name)));
            }
        }

        Ok(())
    }

    /// Total number of nodes including the control node
    pub fn node_count(&self) -> usize {
        self.worker_count + 1
    }

    /// Worker IPs joined with commas, as handed to every node
    pub fn worker_ip_list(&self) -> String {
        self.worker_ips
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Derive the spec of the node at `index`.
    ///
    /// Indices below the worker count map to workers, the index equal to the
    /// worker count maps to the control node.
    pub fn node_spec(&self, index: usize) -> Option<NodeSpec> {
        if index < self.worker_count {
            Some(NodeSpec::new(
                &self.instance_prefix,
                index,
                NodeRole::Worker(index),
                &self.worker_names[index],
                self.worker_ips[index],
            ))
        } else if index == self.worker_count {
            Some(NodeSpec::new(
                &self.instance_prefix,
                index,
                NodeRole::Control,
                &self.control_name,
                self.control_ip,
            ))
        } else {
            None
        }
    }

    /// All nodes in provisioning order: workers ascending, control last
    pub fn node_specs(&self) -> Vec<NodeSpec> {
        (0..self.node_count())
            .filter_map(|index| self.node_spec(index))
            .collect()
    }

    /// Whether a domain name belongs to this cluster
    pub fn owns_domain(&self, name: &str) -> bool {
        name.starts_with(&self.instance_prefix)
            || name == self.control_name
            || self.worker_names.iter().any(|w| w == name)
    }

    /// Whether a pool entry is one of this cluster's per-node config
    /// directories, including those of nodes no longer configured
    pub fn owns_config_dir(&self, name: &str) -> bool {
        name.strip_prefix(&self.instance_prefix)
            .is_some_and(|rest| rest.starts_with("_config_"))
    }

    /// Whether a volume name is one of this cluster's node overlays
    pub fn owns_volume(&self, name: &str) -> bool {
        name.starts_with(&self.instance_prefix)
            || self.node_specs().iter().any(|n| n.image_name == name)
    }
}

/// Error taxonomy shared by the library and the CLI
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Prerequisite missing: {0}")]
    PrerequisiteMissing(String),

    #[error("Failed to fetch {resource}: {reason}")]
    ResourceFetchFailed { resource: String, reason: String },

    #[error("Provisioning failed for {target}: {reason}")]
    ProvisioningFailed { target: String, reason: String },

    #[error("Cluster not ready: {ready}/{expected} nodes ready after {attempts} attempts")]
    ReadinessTimeout {
        ready: usize,
        expected: usize,
        attempts: u32,
    },

    #[error("Teardown incomplete: {0}")]
    TeardownPartialFailure(String),

    #[error("Release artifact not found: {0}")]
    ReleaseArtifactMissing(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("System error: {0}")]
    System(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit status for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::PrerequisiteMissing(_) => 2,
            Error::ReleaseArtifactMissing(_) => 3,
            Error::ReadinessTimeout { .. } => 4,
            Error::ResourceFetchFailed { .. } => 5,
            Error::ProvisioningFailed { .. } => 6,
            Error::InvalidConfig(_) => 7,
            Error::TeardownPartialFailure(_)
            | Error::Template(_)
            | Error::System(_)
            | Error::Io(_) => 1,
        }
    }

    pub fn provisioning(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::ProvisioningFailed {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn fetch(resource: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::ResourceFetchFailed {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
