//! Storage pool management
//!
//! One directory-backed pool holds the shared base image, every node's
//! copy-on-write overlay, the per-node boot configuration directories and
//! the `kubernetes/` directory shared read-only with every node.

use crate::config::VirtclusterConfig;
use crate::hypervisor::{HypervisorClient, HypervisorError, VolumeInfo};
use crate::image::{FetchOutcome, ImageSource};
use crate::template::{self, TemplateContext, TemplateRenderer};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use virtcluster_common::{
    ClusterConfig, Error, FeatureFlags, ImageChannel, LoggingDestination, Result, TeardownReport,
};

/// Subdirectories of the shared directory
pub const SHARED_SUBDIRS: [&str; 3] = ["bin", "manifests", "addons"];

/// What `ensure_base_image` did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseImageOutcome {
    /// Cached and registered copies are current
    Unchanged,
    /// A newer image was downloaded and installed
    Downloaded,
    /// The cached image was installed without downloading
    InstalledFromCache,
}

/// Storage pool manager
pub struct StoragePoolManager {
    hypervisor: Arc<dyn HypervisorClient>,
    images: Arc<dyn ImageSource>,
    renderer: TemplateRenderer,
    config: Arc<VirtclusterConfig>,
    cluster: Arc<ClusterConfig>,
}

impl StoragePoolManager {
    pub fn new(
        hypervisor: Arc<dyn HypervisorClient>,
        images: Arc<dyn ImageSource>,
        config: Arc<VirtclusterConfig>,
        cluster: Arc<ClusterConfig>,
    ) -> Self {
        Self {
            hypervisor,
            images,
            renderer: TemplateRenderer::new(config.paths.templates_dir.clone()),
            config,
            cluster,
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.config.libvirt.pool_name
    }

    pub fn pool_path(&self) -> &Path {
        &self.config.paths.pool_path
    }

    fn base_image_name(&self) -> &str {
        &self.config.libvirt.base_image_name
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.config.shared_dir()
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.shared_dir().join("bin")
    }

    fn pool_error(&self, err: HypervisorError) -> Error {
        Error::provisioning(format!("pool {}", self.pool_name()), err)
    }

    /// Create the pool directory and pool unless the pool already exists.
    ///
    /// Returns whether the pool was created.
    pub async fn ensure_pool(&self) -> Result<bool> {
        let pool = self.pool_name();

        if self
            .hypervisor
            .pool_exists(pool)
            .await
            .map_err(|e| self.pool_error(e))?
        {
            debug!(pool = %pool, "Storage pool already exists");
            return Ok(false);
        }

        tokio::fs::create_dir_all(self.pool_path()).await?;
        self.hypervisor
            .pool_create(pool, self.pool_path())
            .await
            .map_err(|e| self.pool_error(e))?;

        crate::log_resource!("created", "pool", pool);
        Ok(true)
    }

    /// Make the pool's base volume match the channel's newest image
    pub async fn ensure_base_image(&self, channel: ImageChannel) -> Result<BaseImageOutcome> {
        let url = self.config.image_url(channel);
        let cache = self.config.image_cache_path(channel);

        let fetched = self.images.fetch(&url, &cache).await?;
        let base_present = self.base_volume_present().await?;

        let outcome = match fetched {
            FetchOutcome::Downloaded { .. } => BaseImageOutcome::Downloaded,
            FetchOutcome::NotModified if base_present && !self.cache_newer_than_base(&cache) => {
                info!("Base image {} is current", self.base_image_name());
                return Ok(BaseImageOutcome::Unchanged);
            }
            FetchOutcome::NotModified if cache.exists() => BaseImageOutcome::InstalledFromCache,
            FetchOutcome::NotModified => {
                return Err(Error::fetch(
                    url,
                    "remote image reported unchanged but no cached copy exists",
                ));
            }
        };

        self.install_base_image(&cache, base_present).await?;
        Ok(outcome)
    }

    async fn base_volume_present(&self) -> Result<bool> {
        let volumes = self
            .hypervisor
            .volume_list(self.pool_name())
            .await
            .map_err(|e| self.pool_error(e))?;

        Ok(volumes.iter().any(|v| v.name == self.base_image_name()))
    }

    /// An earlier install that failed after downloading leaves the cache
    /// newer than the installed base image
    fn cache_newer_than_base(&self, cache: &Path) -> bool {
        let base = self.pool_path().join(self.base_image_name());
        match (modified(cache), modified(&base)) {
            (Some(cache), Some(base)) => cache > base,
            (Some(_), None) => true,
            _ => false,
        }
    }

    async fn install_base_image(&self, archive: &Path, replace_registered: bool) -> Result<()> {
        let base = self.base_image_name();
        let staging = archive.with_file_name(format!("{}.unpack", base));

        info!("Decompressing {}", archive.display());
        self.images.decompress(archive, &staging).await?;

        if replace_registered {
            if let Err(e) = self.hypervisor.volume_delete(self.pool_name(), base).await {
                warn!("Failed to delete stale base volume {}: {}", base, e);
            }
        }

        let target = self.pool_path().join(base);
        move_file(&staging, &target).await?;
        // Stamp the base image with the archive's time
        if let Some(time) = modified(archive) {
            std::fs::File::options()
                .write(true)
                .open(&target)?
                .set_modified(time)?;
        }
        self.refresh().await?;

        crate::log_resource!("installed", "volume", base);
        Ok(())
    }

    /// Make the hypervisor rescan the pool directory
    pub async fn refresh(&self) -> Result<()> {
        self.hypervisor
            .pool_refresh(self.pool_name())
            .await
            .map_err(|e| self.pool_error(e))
    }

    /// Create the shared `bin`, `manifests` and `addons` directories
    pub async fn prepare_shared_dirs(&self) -> Result<()> {
        for sub in SHARED_SUBDIRS {
            tokio::fs::create_dir_all(self.shared_dir().join(sub)).await?;
        }
        Ok(())
    }

    /// Place the enabled add-ons into the shared directory.
    ///
    /// Missing add-on sources are skipped with a warning.
    pub async fn install_addons(&self, flags: &FeatureFlags, ctx: &TemplateContext) -> Result<()> {
        let shared = self.shared_dir();
        let addons_src = &self.config.paths.addons_dir;

        if flags.cluster_dns {
            for name in [template::SKYDNS_RC, template::SKYDNS_SVC] {
                let manifest = self.renderer.render(name, ctx)?;
                tokio::fs::write(shared.join("addons").join(name), manifest).await?;
            }
            info!("Installed cluster DNS add-on");
        }

        if flags.node_monitoring {
            let src = addons_src.join("cluster-monitoring");
            if src.is_dir() {
                copy_dir_recursive(&src, &shared.join("addons").join("cluster-monitoring"))?;
                info!("Installed node monitoring add-on");
            } else {
                warn!("Monitoring add-on not found at {}, skipping", src.display());
            }
        }

        if flags.node_logging {
            let file = match flags.logging_destination {
                LoggingDestination::Elasticsearch => "fluentd-es.yaml",
                LoggingDestination::Gcp => "fluentd-gcp.yaml",
            };
            let src = addons_src.join(file);
            if src.is_file() {
                tokio::fs::copy(&src, shared.join("manifests").join(file)).await?;
                info!("Installed node logging manifest {}", file);
            } else {
                warn!("Logging manifest not found at {}, skipping", src.display());
            }
        }

        Ok(())
    }

    /// Copy every regular file of `src` into the shared `bin` directory
    pub async fn install_binaries(&self, src: &Path) -> Result<usize> {
        if !src.is_dir() {
            return Err(Error::ReleaseArtifactMissing(format!(
                "binary directory {} does not exist",
                src.display()
            )));
        }

        let bin = self.bin_dir();
        tokio::fs::create_dir_all(&bin).await?;

        let mut installed = 0;
        let mut entries = tokio::fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                tokio::fs::copy(entry.path(), bin.join(entry.file_name())).await?;
                installed += 1;
            }
        }

        info!("Installed {} binaries into {}", installed, bin.display());
        Ok(installed)
    }

    /// Best-effort removal of everything the cluster keeps in the pool.
    ///
    /// With `keep_base` the base volume and the pool itself survive.
    pub async fn destroy_pool(&self, keep_base: bool) -> TeardownReport {
        let pool = self.pool_name();
        let mut report = TeardownReport::new();

        match self.hypervisor.pool_exists(pool).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(pool = %pool, "Storage pool absent, nothing to destroy");
                return report;
            }
            Err(e) => {
                warn!("Cannot query storage pool {}: {}", pool, e);
                report.record_failure(format!("pool/{}", pool), e);
                return report;
            }
        }

        clear_dir(&self.bin_dir(), &mut report);

        for name in self.config_dirs() {
            let dir = self.pool_path().join(&name);
            let resource = format!("config/{}", name);
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => report.record_removed(resource),
                Err(e) => {
                    warn!("Failed to remove {}: {}", dir.display(), e);
                    report.record_failure(resource, e);
                }
            }
        }

        let volumes = match self.hypervisor.volume_list(pool).await {
            Ok(volumes) => volumes,
            Err(e) => {
                warn!("Cannot list volumes of {}: {}", pool, e);
                report.record_failure(format!("pool/{}", pool), e);
                Vec::new()
            }
        };

        // Directory pools list subdirectories as volumes; those are handled above
        let base = self.base_image_name();
        let is_directory = |name: &str| {
            name == self.config.libvirt.shared_dir_name || self.cluster.owns_config_dir(name)
        };

        for volume in volumes.iter().filter(|v| v.name != base) {
            if self.cluster.owns_volume(&volume.name) && !is_directory(&volume.name) {
                self.delete_volume(volume, &mut report).await;
            }
        }

        if keep_base {
            return report;
        }

        if let Some(volume) = volumes.iter().find(|v| v.name == base) {
            self.delete_volume(volume, &mut report).await;
        }

        match self.hypervisor.pool_destroy(pool).await {
            Ok(()) => report.record_removed(format!("pool/{}", pool)),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!("Failed to destroy pool {}: {}", pool, e);
                report.record_failure(format!("pool/{}", pool), e);
            }
        }

        let path = self.pool_path();
        if path.exists() {
            let resource = format!("directory/{}", path.display());
            match std::fs::remove_dir_all(path) {
                Ok(()) => report.record_removed(resource),
                Err(e) => {
                    warn!("Failed to remove {}: {}", path.display(), e);
                    report.record_failure(resource, e);
                }
            }
        }

        report
    }

    /// Every per-node config directory in the pool, sorted by name
    fn config_dirs(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.pool_path()) else {
            return Vec::new();
        };

        let mut dirs: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| self.cluster.owns_config_dir(name))
            .collect();
        dirs.sort();
        dirs
    }

    async fn delete_volume(&self, volume: &VolumeInfo, report: &mut TeardownReport) {
        let resource = format!("volume/{}", volume.name);
        match self.hypervisor.volume_delete(self.pool_name(), &volume.name).await {
            Ok(()) => {
                crate::log_resource!("deleted", "volume", volume.name);
                report.record_removed(resource);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!("Failed to delete volume {}: {}", volume.name, e);
                report.record_failure(resource, e);
            }
        }
    }
}

fn modified(path: &Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Remove the contents of `dir`, keeping the directory itself
fn clear_dir(dir: &Path, report: &mut TeardownReport) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };

        let resource = format!("file/{}", path.display());
        match result {
            Ok(()) => report.record_removed(resource),
            Err(e) => {
                warn!("Failed to remove {}: {}", path.display(), e);
                report.record_failure(resource, e);
            }
        }
    }
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Rename, falling back to copy and delete across filesystems
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}
