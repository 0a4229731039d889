use crate::output::{self, OutputFormat};
use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;
use tabled::Tabled;
use virtcluster_common::{Error, TeardownReport};
use virtcluster_core::hypervisor::DomainInfo;
use virtcluster_core::orchestrator::PushMode;
use virtcluster_core::{ClusterOrchestrator, ReadinessOutcome};

#[derive(Debug, Serialize, Tabled)]
struct DomainRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "STATE")]
    state: String,
}

impl From<&DomainInfo> for DomainRow {
    fn from(domain: &DomainInfo) -> Self {
        Self {
            name: domain.name.clone(),
            id: domain.id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
            state: domain.state.clone(),
        }
    }
}

/// Push source from the `--release`/`--local` flags
pub fn push_mode(release: Option<PathBuf>, local: Option<PathBuf>) -> PushMode {
    match local {
        Some(bin_dir) => PushMode::Local { bin_dir },
        None => PushMode::Release { artifact: release },
    }
}

fn print_readiness(readiness: &ReadinessOutcome) {
    match readiness {
        ReadinessOutcome::Ready { ready, attempts } => output::print_success(&format!(
            "Cluster ready: {} nodes after {} checks",
            ready, attempts
        )),
        ReadinessOutcome::TimedOut {
            ready,
            expected,
            attempts,
        } => output::print_warning(&format!(
            "Cluster not ready after {} checks: {}/{} nodes ready",
            attempts, ready, expected
        )),
    }
}

pub async fn handle_up(orchestrator: &mut ClusterOrchestrator, format: OutputFormat) -> Result<()> {
    let outcome = orchestrator.up().await?;

    if format.is_human() {
        print_readiness(&outcome.readiness);
        output::print_info(&format!("API endpoint: {}", outcome.api_endpoint));
        output::print_info(&format!("kubeconfig: {}", outcome.kubeconfig.display()));
        output::print_info(&format!(
            "Control node: ssh {}@{}",
            outcome.ssh_user, outcome.control_ip
        ));
    } else {
        output::print_single(&outcome, format)?;
    }

    outcome.readiness.into_result()?;
    Ok(())
}

/// Leftovers are reported as warnings. Only `strict` turns them into an
/// error.
pub async fn handle_down(
    orchestrator: &mut ClusterOrchestrator,
    purge: bool,
    strict: bool,
    format: OutputFormat,
) -> Result<()> {
    let report = if purge {
        orchestrator.purge().await
    } else {
        orchestrator.down().await
    };

    if format.is_human() {
        print_teardown(&report);
    } else {
        output::print_single(&report, format)?;
    }

    teardown_result(report, strict)
}

fn teardown_result(report: TeardownReport, strict: bool) -> Result<()> {
    if strict {
        report.into_result()?;
    }
    Ok(())
}

fn print_teardown(report: &TeardownReport) {
    for resource in &report.removed {
        output::print_removed(resource);
    }
    for failure in &report.failures {
        output::print_warning(&format!(
            "Could not remove {}: {}",
            failure.resource, failure.reason
        ));
    }

    if report.is_clean() {
        output::print_success("Cluster destroyed");
    } else {
        output::print_warning(&format!(
            "Teardown finished with {} leftover resources",
            report.failures.len()
        ));
    }
}

pub async fn handle_push(
    orchestrator: &mut ClusterOrchestrator,
    mode: &PushMode,
    restart_services: bool,
    format: OutputFormat,
) -> Result<()> {
    let outcome = orchestrator.push(mode, restart_services).await?;

    if format.is_human() {
        output::print_success(&format!(
            "Installed {} binaries from {}",
            outcome.installed,
            outcome.source.display()
        ));
        if let Some(ref readiness) = outcome.readiness {
            print_readiness(readiness);
        }
    } else {
        output::print_single(&outcome, format)?;
    }

    if let Some(readiness) = outcome.readiness {
        readiness.into_result()?;
    }
    Ok(())
}

pub async fn handle_status(orchestrator: &ClusterOrchestrator, format: OutputFormat) -> Result<()> {
    let status = orchestrator.status().await?;

    if !format.is_human() {
        return output::print_single(&status, format);
    }

    if status.pool_exists {
        output::print_info(&format!(
            "Storage pool {} exists",
            orchestrator.config().libvirt.pool_name
        ));
    } else {
        output::print_warning("No storage pool, cluster is down");
    }

    let rows: Vec<DomainRow> = status.domains.iter().map(DomainRow::from).collect();
    output::print_table(rows, "No cluster domains");

    println!(
        "Ready nodes: {}  (API {})",
        output::format_readiness(status.ready, status.expected),
        status.api_endpoint
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_mode_prefers_local() {
        let mode = push_mode(None, Some(PathBuf::from("_output/bin")));
        assert_eq!(
            mode,
            PushMode::Local {
                bin_dir: PathBuf::from("_output/bin")
            }
        );
        assert_eq!(push_mode(None, None), PushMode::Release { artifact: None });
    }

    #[test]
    fn test_strict_teardown_reports_leftovers() {
        let mut report = TeardownReport::new();
        report.record_removed("domain/w0");
        report.record_failure("network/kubernetes_global", "device busy");

        assert!(teardown_result(report.clone(), false).is_ok());

        let err = teardown_result(report, true).unwrap_err();
        let err = err.downcast_ref::<Error>().unwrap();
        assert!(matches!(err, Error::TeardownPartialFailure(_)));
        assert!(err.to_string().contains("network/kubernetes_global (device busy)"));

        assert!(teardown_result(TeardownReport::new(), true).is_ok());
    }

    #[test]
    fn test_domain_row_for_stopped_domain() {
        let row = DomainRow::from(&DomainInfo {
            id: None,
            name: "kubernetes-minion-1".to_string(),
            state: "shut off".to_string(),
        });
        assert_eq!(row.id, "-");
        assert_eq!(row.state, "shut off");
    }
}
