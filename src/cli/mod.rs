//! CLI definitions.

pub mod commands;

use clap::{Parser, Subcommand};

/// Trellis - etcd federation proxy.
#[derive(Parser, Debug)]
#[command(name = "trellis", version, about)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the proxy server.
    Start(commands::start::StartArgs),
    /// Configuration utilities.
    Config(commands::config::ConfigArgs),
}
