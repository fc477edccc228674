//! Configuration view and validation commands (`boardsync config`).

use std::path::Path;

use anyhow::{Context, Result};

use boardsync::sync_config::SyncConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Boardsync Configuration");
            println!("=======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {}, using defaults", config_path.display());
            }
            println!();

            // Effective values include environment overrides
            let config = SyncConfig::load_or_default(config_path)?;
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No config file at {}", config_path.display());
                println!("Run 'boardsync config init' to create one.");
                return Ok(());
            }
            let config = SyncConfig::load_or_default(config_path)?;
            config
                .validate()
                .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;
            println!("Configuration is valid: {}", config_path.display());
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                anyhow::bail!("{} already exists", config_path.display());
            }
            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            SyncConfig::default().save(config_path)?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
