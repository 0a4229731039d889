//! `virsh` backed hypervisor client

use super::{DomainInfo, HypervisorClient, HypervisorError, HypervisorResult, VolumeInfo, VolumeSpec};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error};

/// Hypervisor client shelling out to `virsh -c <uri>`
#[derive(Debug, Clone)]
pub struct VirshClient {
    uri: String,
}

impl VirshClient {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Run one virsh subcommand and return its stdout.
    ///
    /// `kind` and `name` identify the object for error classification.
    async fn run(&self, args: &[&str], kind: &'static str, name: &str) -> HypervisorResult<String> {
        debug!(uri = %self.uri, "virsh {}", args.join(" "));

        let output = Command::new("virsh")
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .output()
            .await?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let err = classify_failure(args.first().copied().unwrap_or("virsh"), &stderr, kind, name);
        if !err.is_not_found() {
            error!("virsh {} failed: {}", args.join(" "), stderr);
        }
        Err(err)
    }

    /// Write a description document to a scratch file and run `command` on it
    async fn run_with_description(
        &self,
        command: &str,
        description: &str,
        kind: &'static str,
    ) -> HypervisorResult<()> {
        let name = description_name(description).unwrap_or_default();

        let mut file = tempfile::Builder::new()
            .prefix("virtcluster-")
            .suffix(".xml")
            .tempfile()?;
        file.write_all(description.as_bytes())?;
        file.flush()?;

        let path = file.path().to_string_lossy().into_owned();
        self.run(&[command, &path], kind, &name).await?;
        Ok(())
    }
}

#[async_trait]
impl HypervisorClient for VirshClient {
    async fn check_available(&self) -> HypervisorResult<()> {
        let output = Command::new("virsh").arg("--version").output().await?;
        if !output.status.success() {
            return Err(HypervisorError::CommandFailed {
                command: "virsh --version".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // Confirms the connection URI is usable
        self.run(&["uri"], "connection", &self.uri).await?;
        Ok(())
    }

    async fn pool_exists(&self, pool: &str) -> HypervisorResult<bool> {
        match self.run(&["pool-info", pool], "pool", pool).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn pool_create(&self, pool: &str, target: &Path) -> HypervisorResult<()> {
        let target = target.to_string_lossy();
        self.run(&["pool-create-as", pool, "dir", "--target", &target], "pool", pool)
            .await?;
        Ok(())
    }

    async fn pool_destroy(&self, pool: &str) -> HypervisorResult<()> {
        self.run(&["pool-destroy", pool], "pool", pool).await?;
        Ok(())
    }

    async fn pool_refresh(&self, pool: &str) -> HypervisorResult<()> {
        self.run(&["pool-refresh", pool], "pool", pool).await?;
        Ok(())
    }

    async fn volume_list(&self, pool: &str) -> HypervisorResult<Vec<VolumeInfo>> {
        let stdout = self.run(&["vol-list", "--pool", pool], "pool", pool).await?;
        Ok(parse_volume_list(&stdout))
    }

    async fn volume_create(&self, pool: &str, volume: &VolumeSpec) -> HypervisorResult<()> {
        let capacity = volume.capacity_bytes.to_string();
        let mut args = vec![
            "vol-create-as",
            pool,
            volume.name.as_str(),
            capacity.as_str(),
            "--format",
            volume.format.as_str(),
        ];

        if let Some((ref backing, format)) = volume.backing {
            args.extend(["--backing-vol", backing.as_str()]);
            args.extend(["--backing-vol-format", format.as_str()]);
        }

        self.run(&args, "volume", &volume.name).await?;
        Ok(())
    }

    async fn volume_delete(&self, pool: &str, name: &str) -> HypervisorResult<()> {
        self.run(&["vol-delete", name, "--pool", pool], "volume", name)
            .await?;
        Ok(())
    }

    async fn network_create(&self, description: &str) -> HypervisorResult<()> {
        self.run_with_description("net-create", description, "network")
            .await
    }

    async fn network_destroy(&self, name: &str) -> HypervisorResult<()> {
        self.run(&["net-destroy", name], "network", name).await?;
        Ok(())
    }

    async fn domain_create(&self, description: &str) -> HypervisorResult<()> {
        self.run_with_description("create", description, "domain")
            .await
    }

    async fn domain_destroy(&self, name: &str) -> HypervisorResult<()> {
        self.run(&["destroy", name], "domain", name).await?;
        Ok(())
    }

    async fn domain_list(&self) -> HypervisorResult<Vec<DomainInfo>> {
        let stdout = self.run(&["list", "--all"], "domain", "").await?;
        Ok(parse_domain_list(&stdout))
    }
}

fn classify_failure(command: &str, stderr: &str, kind: &'static str, name: &str) -> HypervisorError {
    let lower = stderr.to_lowercase();

    if lower.contains("not found") || lower.contains("no storage pool with matching")
        || lower.contains("no domain with matching")
        || lower.contains("no network with matching")
        || lower.contains("no storage vol with matching")
    {
        HypervisorError::NotFound {
            kind,
            name: name.to_string(),
        }
    } else if lower.contains("already exists") {
        HypervisorError::AlreadyExists {
            kind,
            name: name.to_string(),
        }
    } else {
        HypervisorError::CommandFailed {
            command: format!("virsh {}", command),
            stderr: stderr.to_string(),
        }
    }
}

/// Rows after the dashed separator of a virsh table
fn table_rows(output: &str) -> impl Iterator<Item = &str> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
}

fn parse_volume_list(output: &str) -> Vec<VolumeInfo> {
    table_rows(output)
        .filter_map(|line| {
            let (name, path) = line.split_once(char::is_whitespace)?;
            Some(VolumeInfo {
                name: name.to_string(),
                path: PathBuf::from(path.trim()),
            })
        })
        .collect()
}

fn parse_domain_list(output: &str) -> Vec<DomainInfo> {
    table_rows(output)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?.parse().ok();
            let name = parts.next()?.to_string();
            let state = parts.collect::<Vec<_>>().join(" ");
            Some(DomainInfo { id, name, state })
        })
        .collect()
}

/// Value of the first `<name>` element of a description document
fn description_name(description: &str) -> Option<String> {
    let start = description.find("<name>")? + "<name>".len();
    let end = description[start..].find("</name>")? + start;
    Some(description[start..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_volume_list() {
        let output = " Name                 Path\n\
                      ------------------------------------------------------------\n \
                      coreos_base.img      /var/lib/virtcluster/pool/coreos_base.img\n \
                      w0.img               /var/lib/virtcluster/pool/w0.img\n\n";

        let volumes = parse_volume_list(output);
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].name, "coreos_base.img");
        assert_eq!(volumes[1].path, PathBuf::from("/var/lib/virtcluster/pool/w0.img"));
    }

    #[test]
    fn test_parse_domain_list() {
        let output = " Id   Name     State\n\
                      -------------------------\n \
                      3    w0       running\n \
                      -    old-vm   shut off\n";

        let domains = parse_domain_list(output);
        assert_eq!(domains.len(), 2);
        assert_eq!(domains[0].id, Some(3));
        assert_eq!(domains[1].id, None);
        assert_eq!(domains[1].name, "old-vm");
        assert_eq!(domains[1].state, "shut off");
    }

    #[test]
    fn test_empty_tables() {
        assert!(parse_domain_list(" Id   Name   State\n----------------\n\n").is_empty());
        assert!(parse_volume_list("").is_empty());
    }

    #[test]
    fn test_classify_failure() {
        let err = classify_failure(
            "pool-info",
            "error: failed to get pool 'kubernetes'\nerror: Storage pool not found: no storage pool with matching name 'kubernetes'",
            "pool",
            "kubernetes",
        );
        assert!(err.is_not_found());

        let err = classify_failure(
            "net-create",
            "error: operation failed: network 'kubernetes_global' already exists",
            "network",
            "kubernetes_global",
        );
        assert!(err.is_already_exists());

        let err = classify_failure("create", "error: internal error", "domain", "w0");
        assert!(matches!(err, HypervisorError::CommandFailed { .. }));
    }

    #[test]
    fn test_description_name() {
        let xml = "<network>\n  <name>kubernetes_pods</name>\n  <bridge name='virbr_kub_pods'/>\n</network>";
        assert_eq!(description_name(xml), Some("kubernetes_pods".to_string()));
        assert_eq!(description_name("<domain/>"), None);
    }
}
