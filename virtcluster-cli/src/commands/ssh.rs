use anyhow::{anyhow, bail, Result};
use tokio::process::Command;
use tracing::debug;
use virtcluster_common::{ClusterConfig, Error, NodeSpec};
use virtcluster_core::ssh::SshRunner;
use virtcluster_core::VirtclusterConfig;

/// Resolve a node by name, role (`control`, `worker-01`) or worker index
fn select_node(cluster: &ClusterConfig, selector: Option<&str>) -> Result<NodeSpec> {
    let specs = cluster.node_specs();

    let Some(selector) = selector else {
        return cluster
            .node_spec(cluster.worker_count)
            .ok_or_else(|| anyhow!("Cluster has no control node"));
    };

    if let Ok(index) = selector.parse::<usize>() {
        if index < cluster.worker_count {
            return cluster
                .node_spec(index)
                .ok_or_else(|| anyhow!("No worker {}", index));
        }
        bail!("Worker index {} out of range (0..{})", index, cluster.worker_count);
    }

    specs
        .into_iter()
        .find(|node| node.name == selector || node.role.to_string() == selector)
        .ok_or_else(|| anyhow!("Unknown node '{}'", selector))
}

pub async fn handle_ssh(
    config: &VirtclusterConfig,
    selector: Option<&str>,
    command: &[String],
) -> Result<()> {
    let cluster = config.cluster_config().map_err(Error::from)?;
    let node = select_node(&cluster, selector)?;

    let runner = SshRunner::new(&config.ssh);
    let mut args = runner.ssh_args(node.ip, !command.is_empty());
    args.extend(command.iter().cloned());

    debug!(node = %node.name, "ssh {}", args.join(" "));
    let status = Command::new("ssh")
        .args(&args)
        .status()
        .await
        .map_err(|e| Error::PrerequisiteMissing(format!("ssh: {}", e)))?;

    if !status.success() {
        bail!("ssh to {} exited with {}", node.name, status);
    }
    Ok(())
}
