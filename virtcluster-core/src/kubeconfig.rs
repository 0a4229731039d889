//! Access kubeconfig for the cluster

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;
use virtcluster_common::Result;

pub const CONTEXT_NAME: &str = "virtcluster";
pub const USER_NAME: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub users: Vec<NamedUser>,
    pub contexts: Vec<NamedContext>,
    pub current_context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    pub server: String,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamedUser {
    pub name: String,
    pub user: serde_yaml::Mapping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextEntry {
    pub cluster: String,
    pub user: String,
}

impl Kubeconfig {
    /// Kubeconfig pointing at the cluster API as the default user
    pub fn for_endpoint(server: &str) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: CONTEXT_NAME.to_string(),
                cluster: ClusterEntry {
                    server: server.to_string(),
                    insecure_skip_tls_verify: true,
                },
            }],
            users: vec![NamedUser {
                name: USER_NAME.to_string(),
                user: serde_yaml::Mapping::new(),
            }],
            contexts: vec![NamedContext {
                name: CONTEXT_NAME.to_string(),
                context: ContextEntry {
                    cluster: CONTEXT_NAME.to_string(),
                    user: USER_NAME.to_string(),
                },
            }],
            current_context: CONTEXT_NAME.to_string(),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| virtcluster_common::Error::System(format!("Failed to serialize kubeconfig: {}", e)))
    }

    /// Write to `path`, creating parent directories
    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.to_yaml()?).await?;
        info!("Wrote kubeconfig to {}", path.display());
        Ok(())
    }
}
