//! Configuration view and validation commands: `numberhub config`.

use anyhow::Result;

use numberhub::config::HubConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config: &HubConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!("# Effective configuration (file, environment and flags)");
            println!();
            print!("{}", config.to_redacted_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }
    Ok(())
}
