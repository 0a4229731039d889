//! Virtcluster CLI
//!
//! Brings a multi-node cluster of libvirt domains up and down on the local host

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use output::OutputFormat;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use virtcluster_common::Error;
use virtcluster_core::logging::LoggingConfig;
use virtcluster_core::{ClusterOrchestrator, VirtclusterConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (searched for when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    output: OutputFormat,

    /// More log output (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the pool, networks and nodes, then wait for readiness
    Up,
    /// Destroy the cluster's domains, volumes and networks
    Down {
        /// Also discard the base image and the storage pool
        #[arg(long)]
        purge: bool,
        /// Exit with an error when any resource could not be removed
        #[arg(long)]
        strict: bool,
    },
    /// Install new server binaries into a running cluster
    Push {
        /// Server release tarball (searched for when neither flag is given)
        #[arg(long, conflicts_with = "local")]
        release: Option<PathBuf>,
        /// Directory of locally built binaries
        #[arg(long)]
        local: Option<PathBuf>,
        /// Restart node services and wait for readiness afterwards
        #[arg(long)]
        restart_services: bool,
    },
    /// Show cluster domains and node readiness
    Status,
    /// Open a shell on a node, or run a command there
    Ssh {
        /// Node name or worker index (defaults to the control node)
        node: Option<String>,
        /// Command to run instead of a login shell
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print a sample configuration file
    Sample,
    /// Print the effective configuration
    Show,
    /// List the nodes derived from the configuration
    Nodes,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            output::print_error(&format!("{:#}", err));
            ExitCode::from(exit_code(&err))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Commands that must work without a valid configuration
    match cli.command {
        Commands::Completions { shell } => {
            generate_completions(shell);
            return Ok(());
        }
        Commands::Config {
            command: ConfigCommands::Sample,
        } => {
            print!("{}", VirtclusterConfig::generate_sample());
            return Ok(());
        }
        _ => {}
    }

    let config = VirtclusterConfig::load_from(cli.config.as_deref()).map_err(Error::from)?;

    let logging = LoggingConfig::from(&config.logging);
    let logging = match (cli.quiet, cli.verbose) {
        (true, _) => logging.with_level("warn"),
        (false, 0) => logging,
        (false, 1) => logging.with_level("debug"),
        (false, _) => logging.with_level("trace"),
    };
    let _guard = logging.init()?;

    let config = Arc::new(config);

    match cli.command {
        Commands::Up => {
            let mut orchestrator = ClusterOrchestrator::from_config(config)?;
            commands::cluster::handle_up(&mut orchestrator, cli.output).await?
        }
        Commands::Down { purge, strict } => {
            let mut orchestrator = ClusterOrchestrator::from_config(config)?;
            commands::cluster::handle_down(&mut orchestrator, purge, strict, cli.output).await?
        }
        Commands::Push {
            release,
            local,
            restart_services,
        } => {
            let mut orchestrator = ClusterOrchestrator::from_config(config)?;
            let mode = commands::cluster::push_mode(release, local);
            commands::cluster::handle_push(&mut orchestrator, &mode, restart_services, cli.output)
                .await?
        }
        Commands::Status => {
            let orchestrator = ClusterOrchestrator::from_config(config)?;
            commands::cluster::handle_status(&orchestrator, cli.output).await?
        }
        Commands::Ssh { node, command } => {
            commands::ssh::handle_ssh(&config, node.as_deref(), &command).await?
        }
        Commands::Config { command } => {
            commands::config::handle_config_command(command, &config, cli.output)?
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Exit status for a failed run: the code of the first library error in the chain
fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<Error>())
        .map(Error::exit_code)
        .unwrap_or(1)
}

/// Generate shell completions
fn generate_completions(shell: clap_complete::Shell) {
    use clap::CommandFactory;
    use clap_complete::generate;
    use std::io;

    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();

    generate(shell, &mut cmd, name, &mut io::stdout());
}
