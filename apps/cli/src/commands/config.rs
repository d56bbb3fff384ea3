//! Config command implementation.

use std::path::Path;

use clap::Subcommand;
use colored::Colorize;
use serde_json::json;

use cachet_core::default_config_path;

/// Configuration subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration file
    Validate,
}

/// Execute a config subcommand.
pub fn execute(root: &Path, command: ConfigCommand) -> anyhow::Result<()> {
    match command {
        ConfigCommand::Show { json } => show(root, json),
        ConfigCommand::Validate => validate(root),
    }
}

fn show(root: &Path, json_output: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let path = default_config_path(root);

    if json_output {
        let output = json!({
            "path": path.display().to_string(),
            "file_present": path.exists(),
            "config": config,
            "resource_prefix": config.resource_prefix(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", "Cachet Configuration".bold().cyan());
    println!();
    if path.exists() {
        println!("  Source: {}", path.display().to_string().green());
    } else {
        println!("  Source: {}", "defaults (no config file)".yellow());
    }
    println!("  Project: {}", config.project);
    println!("  Location: {}", config.location);
    println!("  Resource prefix: {}", config.resource_prefix().dimmed());
    println!("  Minimum cacheable tokens: {}", config.min_cacheable_tokens);
    println!("  Default TTL: {}s", config.default_ttl_secs);
    println!("  Maximum TTL: {}s", config.max_ttl_secs);
    println!("  Sweep interval: {}s", config.sweep_interval_secs);
    println!("  Expired retention: {}s", config.expired_retention_secs);

    Ok(())
}

fn validate(root: &Path) -> anyhow::Result<()> {
    let path = default_config_path(root);
    match super::load_config(root) {
        Ok(_) => {
            let source = if path.exists() { path.display().to_string() } else { "defaults".to_string() };
            println!("{} Configuration is valid ({})", "✓".green(), source);
            Ok(())
        }
        Err(e) => {
            eprintln!("{} Invalid configuration in {}: {}", "✗".red(), path.display(), e);
            Err(e)
        }
    }
}
