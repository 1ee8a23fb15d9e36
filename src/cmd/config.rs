//! Configuration view and validation commands — `slotwarden config`.

use anyhow::Result;
use slotwarden::config::{Settings, SlotwardenToml};

use super::super::ConfigCommands;

pub fn cmd_config(settings: &Settings, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = settings.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No slotwarden.toml at {}; defaults shown", config_path.display());
            }
            println!("# Effective values, including SLOTWARDEN_* overrides");
            println!();
            print!("{}", settings.toml.to_toml()?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = settings.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("slotwarden.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            std::fs::create_dir_all(&settings.root)?;
            SlotwardenToml::default().save(&config_path)?;

            println!("Created slotwarden.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [supervisor] tick and grace periods, worker_program");
            println!("  - [recovery] auto_recover and backoff");
            println!("  - [worker] heartbeat and scan pacing");
            println!();
        }
    }

    Ok(())
}
