//! Remote commands on cluster nodes as the fixed default identity

use crate::config::SshConfig;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};
use virtcluster_common::{Error, Result};

/// Runs a shell command on a node
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    async fn run(&self, host: Ipv4Addr, command: &str) -> Result<String>;
}

/// `ssh user@host command` with host key checking disabled
#[derive(Debug, Clone)]
pub struct SshRunner {
    user: String,
    private_key: Option<PathBuf>,
}

impl SshRunner {
    pub fn new(config: &SshConfig) -> Self {
        Self {
            user: config.user.clone(),
            private_key: config.private_key.clone(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Arguments for `ssh`, without the remote command.
    ///
    /// `batch` disables password prompts for non-interactive use.
    pub fn ssh_args(&self, host: Ipv4Addr, batch: bool) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];

        if batch {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }

        if let Some(ref key) = self.private_key {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }

        args.push(format!("{}@{}", self.user, host));
        args
    }
}

#[async_trait]
impl RemoteRunner for SshRunner {
    async fn run(&self, host: Ipv4Addr, command: &str) -> Result<String> {
        debug!("ssh {}@{} {}", self.user, host, command);

        let output = Command::new("ssh")
            .args(self.ssh_args(host, true))
            .arg(command)
            .output()
            .await
            .map_err(|e| Error::PrerequisiteMissing(format!("ssh: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::System(format!(
                "SSH command on {} failed: {}",
                host,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Public keys to authorize on every node.
///
/// Uses the configured key files, or every `~/.ssh/id_*.pub` when none are
/// configured. Unreadable configured files are errors.
pub fn authorized_keys(config: &SshConfig) -> Result<Vec<String>> {
    if !config.public_keys.is_empty() {
        return config
            .public_keys
            .iter()
            .map(|path| read_key(path))
            .collect();
    }

    let Some(home) = std::env::var_os("HOME") else {
        warn!("HOME is not set, no SSH keys will be authorized");
        return Ok(vec![]);
    };

    let keys = default_keys(&Path::new(&home).join(".ssh"))?;
    if keys.is_empty() {
        warn!("No SSH public keys found in ~/.ssh, nodes will not accept logins");
    }
    Ok(keys)
}

fn default_keys(dir: &Path) -> Result<Vec<String>> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(vec![]);
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("id_") && n.ends_with(".pub"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    paths.iter().map(|path| read_key(path)).collect()
}

fn read_key(path: &Path) -> Result<String> {
    let key = std::fs::read_to_string(path)
        .map_err(|e| Error::InvalidConfig(format!("Cannot read SSH key {}: {}", path.display(), e)))?;
    Ok(key.trim().to_string())
}

/// Keys as a YAML sequence indented for `ssh_authorized_keys`
pub fn keys_yaml(keys: &[String]) -> String {
    if keys.is_empty() {
        return "  []".to_string();
    }

    keys.iter()
        .map(|key| format!("  - {}", key))
        .collect::<Vec<_>>()
        .join("\n")
}
