//! Cluster virtual networks

use crate::config::VirtclusterConfig;
use crate::hypervisor::HypervisorClient;
use crate::template::{self, TemplateContext, TemplateRenderer};
use std::sync::Arc;
use tracing::{debug, warn};
use virtcluster_common::{Error, Result, TeardownReport};

/// Creates and destroys the global (NAT) and pod networks
pub struct NetworkManager {
    hypervisor: Arc<dyn HypervisorClient>,
    renderer: TemplateRenderer,
    config: Arc<VirtclusterConfig>,
}

impl NetworkManager {
    pub fn new(hypervisor: Arc<dyn HypervisorClient>, config: Arc<VirtclusterConfig>) -> Self {
        Self {
            hypervisor,
            renderer: TemplateRenderer::new(config.paths.templates_dir.clone()),
            config,
        }
    }

    /// Network names with their description templates, in creation order
    fn networks(&self) -> [(&str, &'static str); 2] {
        [
            (self.config.libvirt.global_network.as_str(), template::NETWORK_GLOBAL),
            (self.config.libvirt.pods_network.as_str(), template::NETWORK_PODS),
        ]
    }

    /// Create both networks. An existing network is a provisioning error.
    pub async fn ensure_networks(&self, ctx: &TemplateContext) -> Result<()> {
        for (name, template_name) in self.networks() {
            let description = self.renderer.render(template_name, ctx)?;
            self.hypervisor
                .network_create(&description)
                .await
                .map_err(|e| Error::provisioning(format!("network {}", name), e))?;

            crate::log_resource!("created", "network", name);
        }
        Ok(())
    }

    /// Destroy both networks, each independently of the other
    pub async fn destroy_networks(&self) -> TeardownReport {
        let mut report = TeardownReport::new();

        for (name, _) in self.networks() {
            let resource = format!("network/{}", name);
            match self.hypervisor.network_destroy(name).await {
                Ok(()) => {
                    crate::log_resource!("destroyed", "network", name);
                    report.record_removed(resource);
                }
                Err(e) if e.is_not_found() => {
                    debug!("Network {} already absent", name);
                }
                Err(e) => {
                    warn!("Failed to destroy network {}: {}", name, e);
                    report.record_failure(resource, e);
                }
            }
        }

        report
    }
}
