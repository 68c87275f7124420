//! Config command implementation.

use crate::core::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Configuration utilities.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Parse and validate the configuration file.
    Validate,
}

pub fn run_config(args: ConfigArgs, config_path: &PathBuf) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => {
            let config = Config::from_file(config_path)?;
            println!(
                "configuration OK: {} member(s), listener on {}",
                config.members.len(),
                config.listener.bind
            );
            Ok(())
        }
    }
}
