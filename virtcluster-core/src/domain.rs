//! Per-node domain provisioning

use crate::config::VirtclusterConfig;
use crate::hypervisor::{HypervisorClient, HypervisorError, VolumeSpec};
use crate::ssh;
use crate::template::{self, TemplateContext, TemplateRenderer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use virtcluster_common::{Error, NodeSpec, Result};

/// Inputs shared by every node of one `up` run
#[derive(Debug, Clone)]
pub struct ProvisionContext {
    pub discovery_token: String,
    pub ssh_keys: Vec<String>,
    /// Cluster-wide template variables
    pub vars: TemplateContext,
}

/// Creates and destroys a single node's domain
pub struct DomainProvisioner {
    hypervisor: Arc<dyn HypervisorClient>,
    renderer: TemplateRenderer,
    config: Arc<VirtclusterConfig>,
}

impl DomainProvisioner {
    pub fn new(hypervisor: Arc<dyn HypervisorClient>, config: Arc<VirtclusterConfig>) -> Self {
        Self {
            hypervisor,
            renderer: TemplateRenderer::new(config.paths.templates_dir.clone()),
            config,
        }
    }

    /// Host path of a node's boot configuration directory
    pub fn config_path(&self, node: &NodeSpec) -> PathBuf {
        self.config.paths.pool_path.join(&node.config_dir)
    }

    /// Template variables for one node
    pub fn node_context(&self, node: &NodeSpec, ctx: &ProvisionContext) -> TemplateContext {
        let libvirt = &self.config.libvirt;
        let mut vars = ctx.vars.clone();

        vars.set("NODE_NAME", &node.name)
            .set("NODE_ROLE", node.role)
            .set("NODE_IP", node.ip)
            .set("NODE_INDEX", node.index)
            .set("IS_CONTROL", node.role.is_control())
            .set("MAC", &node.mac)
            .set("IMAGE_NAME", &node.image_name)
            .set("IMAGE_PATH", self.config.paths.pool_path.join(&node.image_name).display())
            .set("CONFIG_PATH", self.config_path(node).display())
            .set("MEMORY_MB", libvirt.node_memory_mb)
            .set("VCPUS", libvirt.node_vcpus)
            .set("DISCOVERY_TOKEN", &ctx.discovery_token)
            .set("SSH_KEYS", ssh::keys_yaml(&ctx.ssh_keys))
            .set("CONTROL_KUBELET_COMMAND", self.control_kubelet_command());

        vars
    }

    /// The control node registers with the cluster only when it is part of
    /// the readiness target
    fn control_kubelet_command(&self) -> &'static str {
        if self.config.readiness.include_control_node {
            "start"
        } else {
            "stop"
        }
    }

    /// Boot configuration template for a node's role
    pub fn user_data_template(node: &NodeSpec) -> &'static str {
        if node.role.is_control() {
            template::USER_DATA_CONTROL
        } else {
            template::USER_DATA_WORKER
        }
    }

    /// Create the overlay volume, boot configuration and domain of `node`.
    ///
    /// Nothing is rolled back on failure.
    pub async fn provision_node(&self, node: &NodeSpec, ctx: &ProvisionContext) -> Result<()> {
        let libvirt = &self.config.libvirt;
        let pool = libvirt.pool_name.as_str();
        let failed = |reason: &dyn std::fmt::Display| Error::provisioning(&node.name, reason);

        info!(node = %node.name, role = %node.role, ip = %node.ip, "Provisioning node");

        let overlay = VolumeSpec::overlay(
            &node.image_name,
            libvirt.node_disk_gb << 30,
            &libvirt.base_image_name,
        );
        self.hypervisor
            .volume_create(pool, &overlay)
            .await
            .map_err(|e| failed(&e))?;
        debug!(node = %node.name, "Created overlay volume {}", node.image_name);

        let vars = self.node_context(node, ctx);
        let latest = self.config_path(node).join("openstack").join("latest");
        tokio::fs::create_dir_all(&latest)
            .await
            .map_err(|e| failed(&e))?;

        let user_data = self
            .renderer
            .render(Self::user_data_template(node), &vars)
            .map_err(|e| failed(&e))?;
        tokio::fs::write(latest.join("user_data"), user_data)
            .await
            .map_err(|e| failed(&e))?;

        self.hypervisor
            .pool_refresh(pool)
            .await
            .map_err(|e| failed(&e))?;

        let description = self
            .renderer
            .render(template::DOMAIN, &vars)
            .map_err(|e| failed(&e))?;
        self.hypervisor
            .domain_create(&description)
            .await
            .map_err(|e| failed(&e))?;

        crate::log_resource!("created", "domain", node.name);
        Ok(())
    }

    /// Destroy one domain. Returns false when it was already gone.
    pub async fn destroy_node(&self, name: &str) -> std::result::Result<bool, HypervisorError> {
        match self.hypervisor.domain_destroy(name).await {
            Ok(()) => {
                crate::log_resource!("destroyed", "domain", name);
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                debug!("Domain {} already absent", name);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
