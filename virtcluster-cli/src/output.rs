//! Output formatting for CLI
//!
//! Status lines go to stdout (errors to stderr); `--output json|yaml` swaps
//! the human view for a machine-readable document.

use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn is_human(&self) -> bool {
        matches!(self, OutputFormat::Table)
    }
}

/// Print a document as JSON or YAML. Table format prints JSON.
pub fn print_single<T: Serialize>(data: &T, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table | OutputFormat::Json => print_json(data)?,
        OutputFormat::Yaml => print_yaml(data)?,
    }
    Ok(())
}

/// Print data as a table using the tabled crate
pub fn print_table<T: Tabled>(data: Vec<T>, empty: &str) {
    if data.is_empty() {
        println!("{}", empty.yellow());
        return;
    }

    let table = Table::new(data);
    println!("{}", table);
}

/// Print data as pretty-printed JSON
pub fn print_json<T: Serialize>(data: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(data)?;
    println!("{}", json);
    Ok(())
}

/// Print data as YAML
pub fn print_yaml<T: Serialize>(data: &T) -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(data)?;
    println!("{}", yaml);
    Ok(())
}

/// Print a success message with green checkmark
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a success message for a removed resource
pub fn print_removed(resource: &str) {
    println!("{} {} removed", "✓".green().bold(), resource.green().bold());
}

/// Print an error message with red X
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message with blue i
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a warning message with yellow triangle
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// `ready/expected` with a color showing whether the target is met
pub fn format_readiness(ready: Option<usize>, expected: usize) -> String {
    match ready {
        Some(ready) if ready == expected => format!("{}/{}", ready, expected).green().to_string(),
        Some(ready) => format!("{}/{}", ready, expected).yellow().to_string(),
        None => "unreachable".red().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_readiness() {
        colored::control::set_override(false);
        assert_eq!(format_readiness(Some(2), 2), "2/2");
        assert_eq!(format_readiness(Some(1), 2), "1/2");
        assert_eq!(format_readiness(None, 2), "unreachable");
    }
}
