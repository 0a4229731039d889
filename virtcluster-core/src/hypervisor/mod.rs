//! Hypervisor access
//!
//! Every managed resource goes through [`HypervisorClient`]. The production
//! implementation drives the `virsh` command line; tests substitute an
//! in-memory fake.

mod virsh;

pub use virsh::VirshClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Errors raised by hypervisor calls
#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Failed to run hypervisor command: {0}")]
    Spawn(#[from] std::io::Error),
}

impl HypervisorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, HypervisorError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, HypervisorError::AlreadyExists { .. })
    }
}

impl From<HypervisorError> for virtcluster_common::Error {
    fn from(err: HypervisorError) -> Self {
        virtcluster_common::Error::System(err.to_string())
    }
}

pub type HypervisorResult<T> = std::result::Result<T, HypervisorError>;

/// Disk format of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeFormat {
    Qcow2,
    Raw,
}

impl VolumeFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeFormat::Qcow2 => "qcow2",
            VolumeFormat::Raw => "raw",
        }
    }
}

/// Volume to create inside a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub capacity_bytes: u64,
    pub format: VolumeFormat,
    /// Backing volume name and format for copy-on-write overlays
    pub backing: Option<(String, VolumeFormat)>,
}

impl VolumeSpec {
    /// Copy-on-write qcow2 overlay on top of `backing`
    pub fn overlay(name: impl Into<String>, capacity_bytes: u64, backing: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity_bytes,
            format: VolumeFormat::Qcow2,
            backing: Some((backing.into(), VolumeFormat::Qcow2)),
        }
    }
}

/// Volume listed in a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub path: PathBuf,
}

/// Domain known to the hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    /// Runtime id, `None` when the domain is not running
    pub id: Option<u32>,
    pub name: String,
    pub state: String,
}

/// Operations the orchestrator needs from the hypervisor.
///
/// Calls are issued sequentially. Networks and domains are transient:
/// created from a description document and gone once destroyed.
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Verify the hypervisor tooling is installed and reachable
    async fn check_available(&self) -> HypervisorResult<()>;

    async fn pool_exists(&self, pool: &str) -> HypervisorResult<bool>;

    /// Create and start a directory-backed pool
    async fn pool_create(&self, pool: &str, target: &Path) -> HypervisorResult<()>;

    async fn pool_destroy(&self, pool: &str) -> HypervisorResult<()>;

    /// Rescan the pool directory so out-of-band files become volumes
    async fn pool_refresh(&self, pool: &str) -> HypervisorResult<()>;

    async fn volume_list(&self, pool: &str) -> HypervisorResult<Vec<VolumeInfo>>;

    async fn volume_create(&self, pool: &str, volume: &VolumeSpec) -> HypervisorResult<()>;

    async fn volume_delete(&self, pool: &str, name: &str) -> HypervisorResult<()>;

    /// Create a transient network from its XML description
    async fn network_create(&self, description: &str) -> HypervisorResult<()>;

    async fn network_destroy(&self, name: &str) -> HypervisorResult<()>;

    /// Create and start a transient domain from its XML description
    async fn domain_create(&self, description: &str) -> HypervisorResult<()>;

    async fn domain_destroy(&self, name: &str) -> HypervisorResult<()>;

    /// All domains, running or not
    async fn domain_list(&self) -> HypervisorResult<Vec<DomainInfo>>;
}
