//! Configuration management for virtcluster
//!
//! Settings are layered from:
//! 1. Environment variables (highest priority)
//! 2. Configuration file (TOML format)
//! 3. Default values (lowest priority)
//!
//! The result is immutable once loaded and shared by reference with every
//! component.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use virtcluster_common::{ClusterConfig, FeatureFlags, ImageChannel, LoggingDestination};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtclusterConfig {
    /// Cluster topology and add-ons
    pub cluster: ClusterSettings,
    /// Local filesystem layout
    pub paths: PathsConfig,
    /// Libvirt connection and object names
    pub libvirt: LibvirtConfig,
    /// Base image feed
    pub image: ImageConfig,
    /// Discovery token service
    pub discovery: DiscoveryConfig,
    /// Readiness polling
    pub readiness: ReadinessConfig,
    /// Node access
    pub ssh: SshConfig,
    /// Logging
    pub logging: LogSettings,
}

/// Cluster topology
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Prefix carried by every domain and volume the cluster owns
    pub instance_prefix: String,
    /// Number of worker nodes
    pub num_workers: usize,
    /// Control node name, `{instance_prefix}-master` when unset
    pub master_name: Option<String>,
    pub master_ip: Ipv4Addr,
    /// Explicit worker names, derived from the prefix when empty
    pub worker_names: Vec<String>,
    /// Explicit worker IPs, derived from `worker_ip_base` when empty
    pub worker_ips: Vec<Ipv4Addr>,
    /// First three octets (with trailing dot) of derived worker IPs
    pub worker_ip_base: String,
    pub enable_cluster_dns: bool,
    pub enable_node_monitoring: bool,
    pub enable_node_logging: bool,
    pub logging_destination: LoggingDestination,
    pub image_channel: ImageChannel,
    /// Cluster service address range
    pub service_cluster_ip_range: String,
    /// Overlay network for pods
    pub pod_network_cidr: String,
    pub dns_server_ip: Ipv4Addr,
    pub dns_domain: String,
    pub dns_replicas: u32,
}

/// Local filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Base directory for virtcluster data
    pub root_dir: PathBuf,
    /// Backing directory of the storage pool
    pub pool_path: PathBuf,
    /// Where downloaded compressed images are cached
    pub image_cache_dir: PathBuf,
    /// Optional directory whose files override the built-in templates
    pub templates_dir: Option<PathBuf>,
    /// Source directory of add-on manifests
    pub addons_dir: PathBuf,
    /// Directories searched for the server release tarball
    pub release_dirs: Vec<PathBuf>,
    /// Where the cluster kubeconfig is written
    pub kubeconfig: PathBuf,
}

/// Libvirt object names and node sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibvirtConfig {
    /// Connection URI passed to virsh
    pub uri: String,
    pub pool_name: String,
    pub base_image_name: String,
    /// Name of the pool subdirectory shared with every node
    pub shared_dir_name: String,
    pub global_network: String,
    /// Host address of the NATed global network
    pub global_gateway: Ipv4Addr,
    pub global_netmask: Ipv4Addr,
    pub pods_network: String,
    pub node_disk_gb: u64,
    pub node_memory_mb: u64,
    pub node_vcpus: u32,
}

/// Base image feed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Image URL, `{channel}` is replaced with the release channel
    pub url_pattern: String,
    pub timeout_secs: u64,
}

/// Discovery token service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub url: String,
    pub timeout_secs: u64,
}

/// Readiness polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub interval_ms: u64,
    pub max_attempts: u32,
    /// Count the control node towards the readiness target
    pub include_control_node: bool,
    /// Port of the cluster API on the control node
    pub api_port: u16,
}

/// Node access with the fixed default identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    /// Public keys installed on every node, `~/.ssh/id_*.pub` when empty
    pub public_keys: Vec<PathBuf>,
    pub private_key: Option<PathBuf>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Directory for rolling log files, console only when unset
    pub log_dir: Option<PathBuf>,
    /// JSON console output
    pub json: bool,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            instance_prefix: "kubernetes".to_string(),
            num_workers: 3,
            master_name: None,
            master_ip: Ipv4Addr::new(192, 168, 10, 1),
            worker_names: vec![],
            worker_ips: vec![],
            worker_ip_base: "192.168.10.".to_string(),
            enable_cluster_dns: true,
            enable_node_monitoring: true,
            enable_node_logging: false,
            logging_destination: LoggingDestination::Elasticsearch,
            image_channel: ImageChannel::Alpha,
            service_cluster_ip_range: "10.11.0.0/16".to_string(),
            pod_network_cidr: "10.10.0.0/16".to_string(),
            dns_server_ip: Ipv4Addr::new(10, 11, 0, 254),
            dns_domain: "cluster.local".to_string(),
            dns_replicas: 1,
        }
    }
}

impl PathsConfig {
    /// Default layout under `root_dir`
    pub fn rooted_at(root_dir: PathBuf) -> Self {
        Self {
            pool_path: root_dir.join("libvirt_storage_pool"),
            image_cache_dir: root_dir.clone(),
            templates_dir: None,
            addons_dir: root_dir.join("addons"),
            release_dirs: vec![root_dir.join("_output/release-tars")],
            kubeconfig: root_dir.join("kubeconfig"),
            root_dir,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self::rooted_at(PathBuf::from("/var/lib/virtcluster"))
    }
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            pool_name: "kubernetes".to_string(),
            base_image_name: "coreos_base.img".to_string(),
            shared_dir_name: "kubernetes".to_string(),
            global_network: "kubernetes_global".to_string(),
            global_gateway: Ipv4Addr::new(192, 168, 10, 254),
            global_netmask: Ipv4Addr::new(255, 255, 255, 0),
            pods_network: "kubernetes_pods".to_string(),
            node_disk_gb: 10,
            node_memory_mb: 1024,
            node_vcpus: 2,
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            url_pattern:
                "https://{channel}.release.core-os.net/amd64-usr/current/coreos_production_qemu_image.img.bz2"
                    .to_string(),
            timeout_secs: 3600,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            url: "https://discovery.etcd.io/new".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            max_attempts: 50,
            include_control_node: false,
            api_port: 8080,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "core".to_string(),
            public_keys: vec![],
            private_key: None,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            json: false,
        }
    }
}

impl VirtclusterConfig {
    /// Load configuration from the first config file found plus the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration, reading `path` when given instead of searching.
    ///
    /// An explicit path must exist and parse; a searched file that fails to
    /// parse is also an error.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => match Self::find_config_file() {
                Some(found) => Self::load_from_file(&found)?,
                None => Self::default(),
            },
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            std::env::var("VIRTCLUSTER_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from("/etc/virtcluster/config.toml")),
            Some(PathBuf::from("./virtcluster.toml")),
        ];

        paths.into_iter().flatten().find(|p| p.exists())
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Paths
        if let Some(root) = lookup("VIRTCLUSTER_ROOT") {
            let templates_dir = self.paths.templates_dir.take();
            self.paths = PathsConfig::rooted_at(PathBuf::from(root));
            self.paths.templates_dir = templates_dir;
        }
        if let Some(path) = lookup("VIRTCLUSTER_POOL_PATH") {
            self.paths.pool_path = PathBuf::from(path);
        }

        // Cluster topology
        if let Some(prefix) = lookup("INSTANCE_PREFIX") {
            self.cluster.instance_prefix = prefix;
        }
        if let Some(count) = lookup("NUM_WORKERS") {
            self.cluster.num_workers = parse_value("NUM_WORKERS", &count)?;
        }
        if let Some(name) = lookup("MASTER_NAME") {
            self.cluster.master_name = Some(name);
        }
        if let Some(ip) = lookup("MASTER_IP") {
            self.cluster.master_ip = parse_value("MASTER_IP", &ip)?;
        }
        if let Some(names) = lookup("WORKER_NAMES") {
            self.cluster.worker_names = split_list(&names);
        }
        if let Some(ips) = lookup("WORKER_IPS") {
            self.cluster.worker_ips = split_list(&ips)
                .iter()
                .map(|ip| parse_value("WORKER_IPS", ip))
                .collect::<Result<_, _>>()?;
        }

        // Add-ons
        if let Some(flag) = lookup("ENABLE_CLUSTER_DNS") {
            self.cluster.enable_cluster_dns = parse_flag("ENABLE_CLUSTER_DNS", &flag)?;
        }
        if let Some(flag) = lookup("ENABLE_NODE_MONITORING") {
            self.cluster.enable_node_monitoring = parse_flag("ENABLE_NODE_MONITORING", &flag)?;
        }
        if let Some(flag) = lookup("ENABLE_NODE_LOGGING") {
            self.cluster.enable_node_logging = parse_flag("ENABLE_NODE_LOGGING", &flag)?;
        }
        if let Some(dest) = lookup("LOGGING_DESTINATION") {
            self.cluster.logging_destination = dest
                .parse()
                .map_err(|e: virtcluster_common::Error| ConfigError::Validation(e.to_string()))?;
        }
        if let Some(channel) = lookup("IMAGE_CHANNEL") {
            self.cluster.image_channel = channel
                .parse()
                .map_err(|e: virtcluster_common::Error| ConfigError::Validation(e.to_string()))?;
        }

        // Libvirt
        if let Some(uri) = lookup("LIBVIRT_DEFAULT_URI") {
            self.libvirt.uri = uri;
        }

        // Logging
        if let Some(level) = lookup("VIRTCLUSTER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(dir) = lookup("VIRTCLUSTER_LOG_DIR") {
            self.logging.log_dir = Some(PathBuf::from(dir));
        }

        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.num_workers == 0 && self.cluster.worker_names.is_empty() {
            return Err(ConfigError::Validation(
                "At least one worker node is required".to_string(),
            ));
        }

        if !self.image.url_pattern.contains("{channel}") {
            return Err(ConfigError::Validation(
                "Image URL pattern must contain {channel} placeholder".to_string(),
            ));
        }

        if self.readiness.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "Readiness max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.libvirt.node_disk_gb == 0 {
            return Err(ConfigError::Validation("Node disk size cannot be 0".to_string()));
        }

        self.cluster_config()?;
        Ok(())
    }

    /// Build the immutable cluster description
    pub fn cluster_config(&self) -> Result<ClusterConfig, ConfigError> {
        let settings = &self.cluster;
        let prefix = settings.instance_prefix.as_str();

        let count = if settings.worker_names.is_empty() {
            settings.num_workers
        } else {
            settings.worker_names.len()
        };

        let names: Vec<String> = if settings.worker_names.is_empty() {
            (0..count).map(|i| format!("{}-minion-{}", prefix, i + 1)).collect()
        } else {
            settings.worker_names.clone()
        };

        let ips: Vec<Ipv4Addr> = if settings.worker_ips.is_empty() {
            (0..count)
                .map(|i| {
                    let candidate = format!("{}{}", settings.worker_ip_base, i + 2);
                    parse_value("worker_ip_base", &candidate)
                })
                .collect::<Result<_, _>>()?
        } else {
            settings.worker_ips.clone()
        };

        if names.len() != ips.len() {
            return Err(ConfigError::Validation(format!(
                "{} worker names but {} worker IPs",
                names.len(),
                ips.len()
            )));
        }

        let master_name = settings
            .master_name
            .clone()
            .unwrap_or_else(|| format!("{}-master", prefix));

        let features = FeatureFlags {
            cluster_dns: settings.enable_cluster_dns,
            node_monitoring: settings.enable_node_monitoring,
            node_logging: settings.enable_node_logging,
            logging_destination: settings.logging_destination,
        };

        let cluster = ClusterConfig::new(
            prefix,
            master_name,
            settings.master_ip,
            names.into_iter().zip(ips).collect(),
        )
        .map_err(|e| ConfigError::Validation(e.to_string()))?;

        Ok(cluster
            .with_features(features)
            .with_image_channel(settings.image_channel))
    }

    /// Directory inside the pool shared with every node
    pub fn shared_dir(&self) -> PathBuf {
        self.paths.pool_path.join(&self.libvirt.shared_dir_name)
    }

    /// URL of the compressed image for a channel
    pub fn image_url(&self, channel: ImageChannel) -> String {
        self.image.url_pattern.replace("{channel}", channel.as_str())
    }

    /// Local cache path of the compressed image for a channel
    pub fn image_cache_path(&self, channel: ImageChannel) -> PathBuf {
        let url = self.image_url(channel);
        let file_name = url::Url::parse(&url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "base_image.img.bz2".to_string());

        self.paths
            .image_cache_dir
            .join(format!("{}-{}", channel, file_name))
    }

    /// Endpoint of the cluster API on the control node
    pub fn api_endpoint(&self, control_ip: Ipv4Addr) -> String {
        format!("http://{}:{}", control_ip, self.readiness.api_port)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::Validation(format!("{}: invalid value '{}': {}", key, value, e)))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err(ConfigError::Validation(format!(
            "{}: expected true or false, got '{}'",
            key, other
        ))),
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file {0:?}: {1}")]
    FileRead(PathBuf, String),
    /// Failed to parse configuration
    #[error("Failed to parse config: {0}")]
    Parse(String),
    /// Configuration validation failed
    #[error("Config validation failed: {0}")]
    Validation(String),
}

impl From<ConfigError> for virtcluster_common::Error {
    fn from(err: ConfigError) -> Self {
        virtcluster_common::Error::InvalidConfig(err.to_string())
    }
}
