use crate::output::{self, OutputFormat};
use crate::ConfigCommands;
use anyhow::Result;
use serde::Serialize;
use tabled::Tabled;
use virtcluster_common::{Error, NodeSpec};
use virtcluster_core::VirtclusterConfig;

#[derive(Debug, Serialize, Tabled)]
struct NodeRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "ROLE")]
    role: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "MAC")]
    mac: String,
    #[tabled(rename = "IMAGE")]
    image: String,
}

impl From<NodeSpec> for NodeRow {
    fn from(node: NodeSpec) -> Self {
        Self {
            name: node.name,
            role: node.role.to_string(),
            ip: node.ip.to_string(),
            mac: node.mac,
            image: node.image_name,
        }
    }
}

pub fn handle_config_command(
    command: ConfigCommands,
    config: &VirtclusterConfig,
    format: OutputFormat,
) -> Result<()> {
    match command {
        ConfigCommands::Sample => print!("{}", VirtclusterConfig::generate_sample()),
        ConfigCommands::Show => match format {
            OutputFormat::Table => print!("{}", toml::to_string_pretty(config)?),
            _ => output::print_single(config, format)?,
        },
        ConfigCommands::Nodes => {
            let cluster = config.cluster_config().map_err(Error::from)?;
            let rows: Vec<NodeRow> = cluster.node_specs().into_iter().map(NodeRow::from).collect();
            match format {
                OutputFormat::Table => output::print_table(rows, "No nodes configured"),
                _ => output::print_single(&rows, format)?,
            }
        }
    }
    Ok(())
}
