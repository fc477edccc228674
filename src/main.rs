use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use boardsync::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "boardsync")]
#[command(version, about = "Real-time board synchronization client")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format: text or json
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Path to boardsync.toml
    #[arg(long, global = true, default_value = "boardsync.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect, join rooms and print changes until interrupted
    Watch {
        /// Board ids to follow
        #[arg(long = "board", required_unless_present = "workspaces")]
        boards: Vec<String>,

        /// Workspace ids to follow
        #[arg(long = "workspace")]
        workspaces: Vec<String>,

        /// Realtime endpoint, overriding the config file
        #[arg(long)]
        endpoint: Option<String>,

        /// Access token
        #[arg(long, env = "BOARDSYNC_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Local user id, used to tell own changes from remote ones
        #[arg(long)]
        user: String,
    },
    /// View, create or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and report the first problem
    Validate,
    /// Write a default boardsync.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format);

    match &cli.command {
        Commands::Watch {
            boards,
            workspaces,
            endpoint,
            token,
            user,
        } => {
            cmd::cmd_watch(
                &cli.config,
                cmd::WatchArgs {
                    boards: boards.clone(),
                    workspaces: workspaces.clone(),
                    endpoint: endpoint.clone(),
                    token: token.clone(),
                    user: user.clone(),
                },
            )
            .await?
        }
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
    }

    Ok(())
}
