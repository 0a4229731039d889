//! Sandboxed `${NAME}` substitution for boot configuration, machine and
//! network descriptions, and add-on manifests.
//!
//! Templates are plain text. Only `${NAME}` placeholders are expanded, with
//! `NAME` matching `[A-Za-z_][A-Za-z0-9_]*`; substituted values are never
//! re-scanned. A placeholder without a value is an error.

use crate::config::VirtclusterConfig;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::debug;
use virtcluster_common::{ClusterConfig, Error, Result};

pub const USER_DATA_WORKER: &str = "user_data_worker.yml";
pub const USER_DATA_CONTROL: &str = "user_data_control.yml";
pub const DOMAIN: &str = "coreos.xml";
pub const NETWORK_GLOBAL: &str = "network_global.xml";
pub const NETWORK_PODS: &str = "network_pods.xml";
pub const SKYDNS_RC: &str = "skydns-rc.yaml";
pub const SKYDNS_SVC: &str = "skydns-svc.yaml";

const BUILTIN: &[(&str, &str)] = &[
    (USER_DATA_WORKER, include_str!("../templates/user_data_worker.yml")),
    (USER_DATA_CONTROL, include_str!("../templates/user_data_control.yml")),
    (DOMAIN, include_str!("../templates/coreos.xml")),
    (NETWORK_GLOBAL, include_str!("../templates/network_global.xml")),
    (NETWORK_PODS, include_str!("../templates/network_pods.xml")),
    (SKYDNS_RC, include_str!("../templates/skydns-rc.yaml")),
    (SKYDNS_SVC, include_str!("../templates/skydns-svc.yaml")),
];

/// `${NAME}` placeholder
static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap()
});

/// Variables available to a template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    vars: BTreeMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl ToString) -> &mut Self {
        self.vars.insert(name.into(), value.to_string());
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

/// Variables shared by every template of a cluster
pub fn cluster_context(config: &VirtclusterConfig, cluster: &ClusterConfig) -> TemplateContext {
    let flags = &cluster.features;
    let settings = &config.cluster;

    TemplateContext::new()
        .with("INSTANCE_PREFIX", &cluster.instance_prefix)
        .with("CONTROL_NAME", &cluster.control_name)
        .with("CONTROL_IP", cluster.control_ip)
        .with("WORKER_IPS", cluster.worker_ip_list())
        .with("WORKER_COUNT", cluster.worker_count)
        .with("API_PORT", config.readiness.api_port)
        .with("SERVICE_CLUSTER_IP_RANGE", &settings.service_cluster_ip_range)
        .with("POD_NETWORK_CIDR", &settings.pod_network_cidr)
        .with("ENABLE_CLUSTER_DNS", flags.cluster_dns)
        .with("DNS_SERVER_IP", settings.dns_server_ip)
        .with("DNS_DOMAIN", &settings.dns_domain)
        .with("DNS_REPLICAS", settings.dns_replicas)
        .with("ENABLE_NODE_MONITORING", flags.node_monitoring)
        .with("ENABLE_NODE_LOGGING", flags.node_logging)
        .with("LOGGING_DESTINATION", flags.logging_destination)
        .with("GLOBAL_NETWORK", &config.libvirt.global_network)
        .with("GLOBAL_GATEWAY", config.libvirt.global_gateway)
        .with("GLOBAL_NETMASK", config.libvirt.global_netmask)
        .with("PODS_NETWORK", &config.libvirt.pods_network)
        .with("POOL_PATH", config.paths.pool_path.display())
        .with("SHARED_DIR", config.shared_dir().display())
}

/// Expand every placeholder of `template` from `ctx`
pub fn render(template: &str, ctx: &TemplateContext) -> Result<String> {
    let mut output = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER_REGEX.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };

        let value = ctx.get(name.as_str()).ok_or_else(|| {
            Error::Template(format!("No value for placeholder ${{{}}}", name.as_str()))
        })?;

        output.push_str(&template[last..whole.start()]);
        output.push_str(value);
        last = whole.end();
    }

    output.push_str(&template[last..]);
    Ok(output)
}

/// Resolves templates by file name, preferring an override directory
#[derive(Debug, Clone, Default)]
pub struct TemplateRenderer {
    templates_dir: Option<PathBuf>,
}

impl TemplateRenderer {
    pub fn new(templates_dir: Option<PathBuf>) -> Self {
        Self { templates_dir }
    }

    /// Raw template text
    pub fn load(&self, name: &str) -> Result<String> {
        if let Some(ref dir) = self.templates_dir {
            let path = dir.join(name);
            if path.is_file() {
                debug!("Using template override {}", path.display());
                return Ok(std::fs::read_to_string(&path)?);
            }
        }

        BUILTIN
            .iter()
            .find(|(builtin, _)| *builtin == name)
            .map(|(_, text)| text.to_string())
            .ok_or_else(|| Error::Template(format!("Unknown template: {}", name)))
    }

    pub fn render(&self, name: &str, ctx: &TemplateContext) -> Result<String> {
        let template = self.load(name)?;
        render(&template, ctx).map_err(|e| match e {
            Error::Template(msg) => Error::Template(format!("{}: {}", name, msg)),
            other => other,
        })
    }
}
