//! Common test utilities: in-memory hypervisor and fake collaborators

#![allow(dead_code)]

use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use virtcluster_common::{Error, Result};
use virtcluster_core::config::PathsConfig;
use virtcluster_core::discovery::DiscoverySource;
use virtcluster_core::hypervisor::{
    DomainInfo, HypervisorClient, HypervisorError, HypervisorResult, VolumeInfo, VolumeSpec,
};
use virtcluster_core::image::{FetchOutcome, ImageSource};
use virtcluster_core::orchestrator::Collaborators;
use virtcluster_core::readiness::{ClusterStatusSource, ReadinessPoller};
use virtcluster_core::ssh::RemoteRunner;
use virtcluster_core::{ClusterOrchestrator, VirtclusterConfig};

/// Calls that change hypervisor state
const MUTATING: &[&str] = &[
    "pool_create",
    "pool_destroy",
    "pool_refresh",
    "volume_create",
    "volume_delete",
    "network_create",
    "network_destroy",
    "domain_create",
    "domain_destroy",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeVolume {
    pub name: String,
    pub backing: Option<String>,
    pub capacity_bytes: u64,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub unavailable: bool,
    pub pools: BTreeMap<String, PathBuf>,
    pub volumes: BTreeMap<String, Vec<FakeVolume>>,
    pub networks: BTreeSet<String>,
    pub domains: Vec<String>,
    pub calls: Vec<String>,
    pub failures: HashMap<String, String>,
}

/// Hypervisor kept entirely in memory
#[derive(Debug, Default)]
pub struct FakeHypervisor {
    state: Mutex<FakeState>,
}

fn description_name(description: &str) -> String {
    let re = Regex::new(r"<name>(.*?)</name>").unwrap();
    re.captures(description)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

impl FakeHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unavailable() -> Arc<Self> {
        let fake = Self::default();
        fake.state.lock().unwrap().unavailable = true;
        Arc::new(fake)
    }

    /// Make `op` on `name` fail with a generic command error
    pub fn fail(&self, op: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(format!("{} {}", op, name), "injected failure".to_string());
    }

    /// Simulate an operator removing a domain behind our back
    pub fn remove_domain(&self, name: &str) {
        self.state.lock().unwrap().domains.retain(|d| d != name);
    }

    pub fn add_network(&self, name: &str) {
        self.state.lock().unwrap().networks.insert(name.to_string());
    }

    pub fn add_domain(&self, name: &str) {
        self.state.lock().unwrap().domains.push(name.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| MUTATING.iter().any(|op| c.split(' ').next() == Some(*op)))
            .collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }

    /// Domain names in creation order
    pub fn created_domains(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| c.strip_prefix("domain_create "))
            .map(str::to_string)
            .collect()
    }

    pub fn domains(&self) -> Vec<String> {
        self.state.lock().unwrap().domains.clone()
    }

    pub fn networks(&self) -> Vec<String> {
        self.state.lock().unwrap().networks.iter().cloned().collect()
    }

    pub fn pools(&self) -> Vec<String> {
        self.state.lock().unwrap().pools.keys().cloned().collect()
    }

    pub fn volume_names(&self, pool: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .volumes
            .get(pool)
            .map(|v| v.iter().map(|v| v.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn volume(&self, pool: &str, name: &str) -> Option<FakeVolume> {
        self.state
            .lock()
            .unwrap()
            .volumes
            .get(pool)
            .and_then(|v| v.iter().find(|v| v.name == name).cloned())
    }

    fn record(&self, op: &str, name: &str) -> HypervisorResult<()> {
        let mut state = self.state.lock().unwrap();
        let call = format!("{} {}", op, name);
        state.calls.push(call.clone());

        match state.failures.get(&call) {
            Some(stderr) => Err(HypervisorError::CommandFailed {
                command: call,
                stderr: stderr.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl HypervisorClient for FakeHypervisor {
    async fn check_available(&self) -> HypervisorResult<()> {
        self.record("check_available", "")?;
        if self.state.lock().unwrap().unavailable {
            return Err(HypervisorError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "virsh: command not found",
            )));
        }
        Ok(())
    }

    async fn pool_exists(&self, pool: &str) -> HypervisorResult<bool> {
        self.record("pool_exists", pool)?;
        Ok(self.state.lock().unwrap().pools.contains_key(pool))
    }

    async fn pool_create(&self, pool: &str, target: &Path) -> HypervisorResult<()> {
        self.record("pool_create", pool)?;
        let mut state = self.state.lock().unwrap();
        if state.pools.contains_key(pool) {
            return Err(HypervisorError::AlreadyExists {
                kind: "pool",
                name: pool.to_string(),
            });
        }
        state.pools.insert(pool.to_string(), target.to_path_buf());
        state.volumes.entry(pool.to_string()).or_default();
        Ok(())
    }

    async fn pool_destroy(&self, pool: &str) -> HypervisorResult<()> {
        self.record("pool_destroy", pool)?;
        let mut state = self.state.lock().unwrap();
        if state.pools.remove(pool).is_none() {
            return Err(HypervisorError::NotFound {
                kind: "pool",
                name: pool.to_string(),
            });
        }
        state.volumes.remove(pool);
        Ok(())
    }

    async fn pool_refresh(&self, pool: &str) -> HypervisorResult<()> {
        self.record("pool_refresh", pool)?;
        let mut state = self.state.lock().unwrap();
        let Some(path) = state.pools.get(pool).cloned() else {
            return Err(HypervisorError::NotFound {
                kind: "pool",
                name: pool.to_string(),
            });
        };

        // Register files dropped into the pool directory
        let files: Vec<String> = std::fs::read_dir(&path)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.path().is_file())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();

        let volumes = state.volumes.entry(pool.to_string()).or_default();
        for file in files {
            if !volumes.iter().any(|v| v.name == file) {
                volumes.push(FakeVolume {
                    name: file,
                    backing: None,
                    capacity_bytes: 0,
                });
            }
        }
        Ok(())
    }

    async fn volume_list(&self, pool: &str) -> HypervisorResult<Vec<VolumeInfo>> {
        self.record("volume_list", pool)?;
        let state = self.state.lock().unwrap();
        let path = state.pools.get(pool).cloned().ok_or(HypervisorError::NotFound {
            kind: "pool",
            name: pool.to_string(),
        })?;

        Ok(state
            .volumes
            .get(pool)
            .map(|volumes| {
                volumes
                    .iter()
                    .map(|v| VolumeInfo {
                        name: v.name.clone(),
                        path: path.join(&v.name),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn volume_create(&self, pool: &str, volume: &VolumeSpec) -> HypervisorResult<()> {
        self.record("volume_create", &volume.name)?;
        let mut state = self.state.lock().unwrap();
        let volumes = state.volumes.get_mut(pool).ok_or(HypervisorError::NotFound {
            kind: "pool",
            name: pool.to_string(),
        })?;

        if volumes.iter().any(|v| v.name == volume.name) {
            return Err(HypervisorError::AlreadyExists {
                kind: "volume",
                name: volume.name.clone(),
            });
        }

        volumes.push(FakeVolume {
            name: volume.name.clone(),
            backing: volume.backing.as_ref().map(|(name, _)| name.clone()),
            capacity_bytes: volume.capacity_bytes,
        });
        Ok(())
    }

    async fn volume_delete(&self, pool: &str, name: &str) -> HypervisorResult<()> {
        self.record("volume_delete", name)?;
        let mut state = self.state.lock().unwrap();
        let path = state.pools.get(pool).cloned();
        let volumes = state.volumes.entry(pool.to_string()).or_default();

        let before = volumes.len();
        volumes.retain(|v| v.name != name);
        if volumes.len() == before {
            return Err(HypervisorError::NotFound {
                kind: "volume",
                name: name.to_string(),
            });
        }

        if let Some(path) = path {
            let _ = std::fs::remove_file(path.join(name));
        }
        Ok(())
    }

    async fn network_create(&self, description: &str) -> HypervisorResult<()> {
        let name = description_name(description);
        self.record("network_create", &name)?;
        if !self.state.lock().unwrap().networks.insert(name.clone()) {
            return Err(HypervisorError::AlreadyExists {
                kind: "network",
                name,
            });
        }
        Ok(())
    }

    async fn network_destroy(&self, name: &str) -> HypervisorResult<()> {
        self.record("network_destroy", name)?;
        if !self.state.lock().unwrap().networks.remove(name) {
            return Err(HypervisorError::NotFound {
                kind: "network",
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn domain_create(&self, description: &str) -> HypervisorResult<()> {
        let name = description_name(description);
        self.record("domain_create", &name)?;
        let mut state = self.state.lock().unwrap();
        if state.domains.contains(&name) {
            return Err(HypervisorError::AlreadyExists {
                kind: "domain",
                name,
            });
        }
        state.domains.push(name);
        Ok(())
    }

    async fn domain_destroy(&self, name: &str) -> HypervisorResult<()> {
        self.record("domain_destroy", name)?;
        let mut state = self.state.lock().unwrap();
        let before = state.domains.len();
        state.domains.retain(|d| d != name);
        if state.domains.len() == before {
            return Err(HypervisorError::NotFound {
                kind: "domain",
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn domain_list(&self) -> HypervisorResult<Vec<DomainInfo>> {
        self.record("domain_list", "")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .domains
            .iter()
            .enumerate()
            .map(|(i, name)| DomainInfo {
                id: Some(i as u32 + 1),
                name: name.clone(),
                state: "running".to_string(),
            })
            .collect())
    }
}

/// Image feed writing a fixed payload; `remote_newer` decides whether a
/// cached copy gets replaced
#[derive(Debug)]
pub struct FakeImages {
    pub remote_newer: Mutex<bool>,
    pub downloads: Mutex<u32>,
    pub fail: bool,
}

impl FakeImages {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            remote_newer: Mutex::new(false),
            downloads: Mutex::new(0),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            remote_newer: Mutex::new(false),
            downloads: Mutex::new(0),
            fail: true,
        })
    }

    pub fn downloads(&self) -> u32 {
        *self.downloads.lock().unwrap()
    }

    pub fn set_remote_newer(&self, newer: bool) {
        *self.remote_newer.lock().unwrap() = newer;
    }
}

#[async_trait]
impl ImageSource for FakeImages {
    async fn fetch(&self, url: &str, cache_path: &Path) -> Result<FetchOutcome> {
        if self.fail {
            return Err(Error::fetch(url, "connection refused"));
        }
        if cache_path.exists() && !*self.remote_newer.lock().unwrap() {
            return Ok(FetchOutcome::NotModified);
        }

        std::fs::create_dir_all(cache_path.parent().unwrap())?;
        std::fs::write(cache_path, b"compressed image")?;
        *self.downloads.lock().unwrap() += 1;
        Ok(FetchOutcome::Downloaded { bytes: 16 })
    }

    async fn decompress(&self, archive: &Path, dest: &Path) -> Result<()> {
        std::fs::copy(archive, dest)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeDiscovery {
    pub sizes: Mutex<Vec<usize>>,
}

#[async_trait]
impl DiscoverySource for FakeDiscovery {
    async fn new_token(&self, size: usize) -> Result<String> {
        self.sizes.lock().unwrap().push(size);
        Ok("https://discovery.example/abc123".to_string())
    }
}

/// Status source answering a settable ready count, `None` fails the query
#[derive(Debug, Default)]
pub struct FakeStatus {
    pub ready: Mutex<Option<usize>>,
    pub queries: Mutex<u32>,
}

impl FakeStatus {
    pub fn ready(count: usize) -> Arc<Self> {
        Arc::new(Self {
            ready: Mutex::new(Some(count)),
            queries: Mutex::new(0),
        })
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queries(&self) -> u32 {
        *self.queries.lock().unwrap()
    }
}

#[async_trait]
impl ClusterStatusSource for FakeStatus {
    async fn ready_count(&self) -> Result<usize> {
        *self.queries.lock().unwrap() += 1;
        self.ready
            .lock()
            .unwrap()
            .ok_or_else(|| Error::fetch("nodes", "connection refused"))
    }
}

#[derive(Debug, Default)]
pub struct FakeRemote {
    pub commands: Mutex<Vec<(Ipv4Addr, String)>>,
}

#[async_trait]
impl RemoteRunner for FakeRemote {
    async fn run(&self, host: Ipv4Addr, command: &str) -> Result<String> {
        self.commands.lock().unwrap().push((host, command.to_string()));
        Ok(String::new())
    }
}

/// Everything one orchestrator test needs
pub struct Harness {
    pub root: TempDir,
    pub config: Arc<VirtclusterConfig>,
    pub hypervisor: Arc<FakeHypervisor>,
    pub images: Arc<FakeImages>,
    pub discovery: Arc<FakeDiscovery>,
    pub status: Arc<FakeStatus>,
    pub remote: Arc<FakeRemote>,
}

/// Two workers `w0@10.0.0.2`, `w1@10.0.0.3` and control `c0@10.0.0.1`
pub fn test_config(root: &Path) -> VirtclusterConfig {
    let mut config = VirtclusterConfig::default();
    config.paths = PathsConfig::rooted_at(root.to_path_buf());

    config.cluster.master_name = Some("c0".to_string());
    config.cluster.master_ip = "10.0.0.1".parse().unwrap();
    config.cluster.worker_names = vec!["w0".to_string(), "w1".to_string()];
    config.cluster.worker_ips = vec!["10.0.0.2".parse().unwrap(), "10.0.0.3".parse().unwrap()];

    let key = root.join("id_test.pub");
    std::fs::write(&key, "ssh-ed25519 AAAATEST tester@host\n").unwrap();
    config.ssh.public_keys = vec![key];

    config.readiness.interval_ms = 1;
    config.readiness.max_attempts = 3;
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    /// Harness with a customized configuration
    pub fn with<F: FnOnce(&mut VirtclusterConfig)>(customize: F) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(root.path());
        customize(&mut config);

        Self {
            root,
            config: Arc::new(config),
            hypervisor: FakeHypervisor::new(),
            images: FakeImages::new(),
            discovery: Arc::new(FakeDiscovery::default()),
            status: FakeStatus::ready(2),
            remote: Arc::new(FakeRemote::default()),
        }
    }

    pub fn orchestrator(&self) -> ClusterOrchestrator {
        let collaborators = Collaborators {
            hypervisor: self.hypervisor.clone(),
            images: self.images.clone(),
            discovery: self.discovery.clone(),
            status: self.status.clone(),
            remote: self.remote.clone(),
        };

        ClusterOrchestrator::new(self.config.clone(), collaborators)
            .unwrap()
            .with_poller(ReadinessPoller::from(&self.config.readiness))
    }

    pub fn pool_path(&self) -> PathBuf {
        self.config.paths.pool_path.clone()
    }
}
