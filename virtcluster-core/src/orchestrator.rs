//! Cluster lifecycle orchestration
//!
//! `up` builds the cluster strictly in order: pool, base image, shared
//! directories, networks, nodes (workers ascending, control last), then the
//! readiness gate. Setup fails fast without rollback. `down` and `purge`
//! are best-effort and report what they could not remove.

use crate::config::VirtclusterConfig;
use crate::discovery::{DiscoverySource, EtcdDiscovery};
use crate::domain::{DomainProvisioner, ProvisionContext};
use crate::hypervisor::{DomainInfo, HypervisorClient, VirshClient};
use crate::image::{HttpImageFeed, ImageSource};
use crate::kubeconfig::Kubeconfig;
use crate::network::NetworkManager;
use crate::readiness::{ClusterStatusSource, KubeApiStatus, ReadinessOutcome, ReadinessPoller};
use crate::ssh::{self, RemoteRunner, SshRunner};
use crate::storage::{BaseImageOutcome, StoragePoolManager};
use crate::template;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};
use virtcluster_common::{ClusterConfig, Error, Result, TeardownReport};

/// Server release tarball searched for in the release directories
pub const RELEASE_TARBALL: &str = "kubernetes-server-linux-amd64.tar.gz";

/// Services restarted on every node after a push
const RESTART_COMMAND: &str = "sudo systemctl restart kubelet.service kube-proxy.service";

/// Lifecycle position of the cluster within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Idle,
    PoolReady,
    NetworkReady,
    NodesProvisioned,
    ClusterReady,
}

/// Where pushed binaries come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMode {
    /// Server release tarball, searched for when no path is given
    Release { artifact: Option<PathBuf> },
    /// Directory of locally built binaries
    Local { bin_dir: PathBuf },
}

/// Result of a successful `up`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpOutcome {
    pub readiness: ReadinessOutcome,
    pub api_endpoint: String,
    pub ssh_user: String,
    pub control_ip: Ipv4Addr,
    pub kubeconfig: PathBuf,
    pub base_image: BaseImageOutcome,
}

/// Result of a `push`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushOutcome {
    pub source: PathBuf,
    pub installed: usize,
    /// Present when node services were restarted
    pub readiness: Option<ReadinessOutcome>,
}

/// Snapshot reported by `status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub pool_exists: bool,
    pub domains: Vec<DomainInfo>,
    /// `None` when the cluster API could not be queried
    pub ready: Option<usize>,
    pub expected: usize,
    pub api_endpoint: String,
}

/// External collaborators of the orchestrator
pub struct Collaborators {
    pub hypervisor: Arc<dyn HypervisorClient>,
    pub images: Arc<dyn ImageSource>,
    pub discovery: Arc<dyn DiscoverySource>,
    pub status: Arc<dyn ClusterStatusSource>,
    pub remote: Arc<dyn RemoteRunner>,
}

impl Collaborators {
    /// virsh, HTTP feeds and ssh as configured
    pub fn production(config: &VirtclusterConfig, cluster: &ClusterConfig) -> Result<Self> {
        Ok(Self {
            hypervisor: Arc::new(VirshClient::new(&config.libvirt.uri)),
            images: Arc::new(HttpImageFeed::new(Duration::from_secs(config.image.timeout_secs))?),
            discovery: Arc::new(EtcdDiscovery::new(
                &config.discovery.url,
                Duration::from_secs(config.discovery.timeout_secs),
            )?),
            status: Arc::new(KubeApiStatus::new(
                config.api_endpoint(cluster.control_ip),
                Duration::from_secs(5),
            )?),
            remote: Arc::new(SshRunner::new(&config.ssh)),
        })
    }
}

/// Top-level cluster state machine
pub struct ClusterOrchestrator {
    config: Arc<VirtclusterConfig>,
    cluster: Arc<ClusterConfig>,
    hypervisor: Arc<dyn HypervisorClient>,
    images: Arc<dyn ImageSource>,
    discovery: Arc<dyn DiscoverySource>,
    status: Arc<dyn ClusterStatusSource>,
    remote: Arc<dyn RemoteRunner>,
    poller: ReadinessPoller,
    state: ClusterState,
}

impl ClusterOrchestrator {
    pub fn new(config: Arc<VirtclusterConfig>, collaborators: Collaborators) -> Result<Self> {
        let cluster = Arc::new(config.cluster_config()?);

        Ok(Self {
            poller: ReadinessPoller::from(&config.readiness),
            config,
            cluster,
            hypervisor: collaborators.hypervisor,
            images: collaborators.images,
            discovery: collaborators.discovery,
            status: collaborators.status,
            remote: collaborators.remote,
            state: ClusterState::Idle,
        })
    }

    /// Orchestrator wired to the production collaborators
    pub fn from_config(config: Arc<VirtclusterConfig>) -> Result<Self> {
        let cluster = config.cluster_config()?;
        let collaborators = Collaborators::production(&config, &cluster)?;
        Self::new(config, collaborators)
    }

    pub fn with_poller(mut self, poller: ReadinessPoller) -> Self {
        self.poller = poller;
        self
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    pub fn config(&self) -> &VirtclusterConfig {
        &self.config
    }

    fn storage(&self) -> StoragePoolManager {
        StoragePoolManager::new(
            self.hypervisor.clone(),
            self.images.clone(),
            self.config.clone(),
            self.cluster.clone(),
        )
    }

    fn network(&self) -> NetworkManager {
        NetworkManager::new(self.hypervisor.clone(), self.config.clone())
    }

    fn provisioner(&self) -> DomainProvisioner {
        DomainProvisioner::new(self.hypervisor.clone(), self.config.clone())
    }

    pub fn api_endpoint(&self) -> String {
        self.config.api_endpoint(self.cluster.control_ip)
    }

    /// Number of ready nodes `up` waits for.
    ///
    /// Only workers count unless the control node is explicitly included.
    pub fn readiness_target(&self) -> usize {
        if self.config.readiness.include_control_node {
            self.cluster.node_count()
        } else {
            self.cluster.worker_count
        }
    }

    /// Checks that run before anything is mutated. Returns the SSH keys to
    /// authorize on the nodes.
    async fn check_prerequisites(&self) -> Result<Vec<String>> {
        self.hypervisor
            .check_available()
            .await
            .map_err(|e| Error::PrerequisiteMissing(format!("hypervisor: {}", e)))?;

        ssh::authorized_keys(&self.config.ssh)
    }

    /// Bring the whole cluster up
    pub async fn up(&mut self) -> Result<UpOutcome> {
        info!(
            workers = self.cluster.worker_count,
            control = %self.cluster.control_name,
            "Starting cluster"
        );

        let ssh_keys = self.check_prerequisites().await?;

        let storage = self.storage();
        storage.ensure_pool().await?;
        self.state = ClusterState::PoolReady;

        let base_image = storage.ensure_base_image(self.cluster.image_channel).await?;

        let vars = template::cluster_context(&self.config, &self.cluster);
        storage.prepare_shared_dirs().await?;
        storage.install_addons(&self.cluster.features, &vars).await?;

        match self.find_release_artifact(None) {
            Ok(tarball) => {
                self.install_release(&storage, &tarball).await?;
            }
            Err(Error::ReleaseArtifactMissing(msg)) => {
                warn!("{}; nodes start without server binaries until `push`", msg);
            }
            Err(e) => return Err(e),
        }

        self.network().ensure_networks(&vars).await?;
        self.state = ClusterState::NetworkReady;

        let discovery_token = self.discovery.new_token(self.cluster.node_count()).await?;
        let ctx = ProvisionContext {
            discovery_token,
            ssh_keys,
            vars,
        };

        let provisioner = self.provisioner();
        for node in self.cluster.node_specs() {
            provisioner.provision_node(&node, &ctx).await?;
        }
        self.state = ClusterState::NodesProvisioned;

        let api_endpoint = self.api_endpoint();
        Kubeconfig::for_endpoint(&api_endpoint)
            .write(&self.config.paths.kubeconfig)
            .await?;

        let readiness = self
            .poller
            .wait_ready(self.status.as_ref(), self.readiness_target())
            .await;
        if readiness.is_ready() {
            self.state = ClusterState::ClusterReady;
        }

        Ok(UpOutcome {
            readiness,
            api_endpoint,
            ssh_user: self.config.ssh.user.clone(),
            control_ip: self.cluster.control_ip,
            kubeconfig: self.config.paths.kubeconfig.clone(),
            base_image,
        })
    }

    /// Tear the cluster down, keeping the base image
    pub async fn down(&mut self) -> TeardownReport {
        self.teardown(true).await
    }

    /// Tear the cluster down and discard the pool with its base image
    pub async fn purge(&mut self) -> TeardownReport {
        self.teardown(false).await
    }

    async fn teardown(&mut self, keep_base: bool) -> TeardownReport {
        info!(keep_base, "Tearing down cluster");
        let mut report = TeardownReport::new();

        match self.hypervisor.domain_list().await {
            Ok(domains) => {
                let provisioner = self.provisioner();
                for domain in domains.iter().filter(|d| self.cluster.owns_domain(&d.name)) {
                    if domain.id.is_none() {
                        continue;
                    }
                    let resource = format!("domain/{}", domain.name);
                    match provisioner.destroy_node(&domain.name).await {
                        Ok(true) => report.record_removed(resource),
                        Ok(false) => {}
                        Err(e) => {
                            warn!("Failed to destroy domain {}: {}", domain.name, e);
                            report.record_failure(resource, e);
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Cannot list domains: {}", e);
                report.record_failure("domains", e);
            }
        }

        report.merge(self.storage().destroy_pool(keep_base).await);
        report.merge(self.network().destroy_networks().await);

        self.state = ClusterState::Idle;
        report
    }

    /// Install new binaries into the shared directory of a running cluster
    pub async fn push(&mut self, mode: &PushMode, restart_services: bool) -> Result<PushOutcome> {
        let storage = self.storage();

        let pool_exists = self
            .hypervisor
            .pool_exists(storage.pool_name())
            .await
            .map_err(|e| Error::provisioning(format!("pool {}", storage.pool_name()), e))?;
        if !pool_exists {
            return Err(Error::PrerequisiteMissing(format!(
                "storage pool {} does not exist, run `up` first",
                storage.pool_name()
            )));
        }

        storage.prepare_shared_dirs().await?;

        let (source, installed) = match mode {
            PushMode::Release { artifact } => {
                let tarball = self.find_release_artifact(artifact.as_deref())?;
                let installed = self.install_release(&storage, &tarball).await?;
                (tarball, installed)
            }
            PushMode::Local { bin_dir } => {
                let installed = storage.install_binaries(bin_dir).await?;
                (bin_dir.clone(), installed)
            }
        };

        storage.refresh().await?;

        let readiness = if restart_services {
            self.restart_services().await?;
            let outcome = self
                .poller
                .wait_ready(self.status.as_ref(), self.readiness_target())
                .await;
            if outcome.is_ready() {
                self.state = ClusterState::ClusterReady;
            }
            Some(outcome)
        } else {
            None
        };

        Ok(PushOutcome {
            source,
            installed,
            readiness,
        })
    }

    async fn restart_services(&self) -> Result<()> {
        for node in self.cluster.node_specs() {
            info!(node = %node.name, "Restarting node services");
            self.remote.run(node.ip, RESTART_COMMAND).await?;
        }
        Ok(())
    }

    /// Cluster-owned domains and the current ready count
    pub async fn status(&self) -> Result<ClusterStatus> {
        let pool_exists = self
            .hypervisor
            .pool_exists(&self.config.libvirt.pool_name)
            .await?;

        let domains = self
            .hypervisor
            .domain_list()
            .await?
            .into_iter()
            .filter(|d| self.cluster.owns_domain(&d.name))
            .collect();

        let ready = match self.status.ready_count().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!("Cluster API unavailable: {}", e);
                None
            }
        };

        Ok(ClusterStatus {
            pool_exists,
            domains,
            ready,
            expected: self.readiness_target(),
            api_endpoint: self.api_endpoint(),
        })
    }

    /// Locate the server tarball, at `explicit` or in the release directories
    pub fn find_release_artifact(&self, explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return if path.is_file() {
                Ok(path.to_path_buf())
            } else {
                Err(Error::ReleaseArtifactMissing(path.display().to_string()))
            };
        }

        self.config
            .paths
            .release_dirs
            .iter()
            .map(|dir| dir.join(RELEASE_TARBALL))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                let searched = self
                    .config
                    .paths
                    .release_dirs
                    .iter()
                    .map(|d| d.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                Error::ReleaseArtifactMissing(format!("{} not found in [{}]", RELEASE_TARBALL, searched))
            })
    }

    /// Unpack the server tarball and install its binaries
    async fn install_release(&self, storage: &StoragePoolManager, tarball: &Path) -> Result<usize> {
        info!("Installing binaries from {}", tarball.display());
        let scratch = tempfile::tempdir()?;

        let output = Command::new("tar")
            .arg("-xzf")
            .arg(tarball)
            .arg("-C")
            .arg(scratch.path())
            .output()
            .await
            .map_err(|e| Error::PrerequisiteMissing(format!("tar: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::System(format!(
                "Failed to extract {}: {}",
                tarball.display(),
                stderr.trim()
            )));
        }

        storage
            .install_binaries(&scratch.path().join("kubernetes").join("server").join("bin"))
            .await
    }
}
