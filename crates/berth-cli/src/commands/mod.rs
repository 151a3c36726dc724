//! CLI command definitions and dispatch.

pub mod build;
pub mod images;
pub mod logs;
pub mod ps;
pub mod run;
pub mod stop;

use std::path::PathBuf;

use berth_common::config::BerthConfig;
use clap::{Parser, Subcommand};

/// berth: build an image, then run its entry command as an unprivileged account.
#[derive(Parser, Debug)]
#[command(name = "berth", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding layers, images, containers, and logs.
    #[arg(long, global = true, env = "BERTH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

impl Cli {
    /// Loads the configuration for the selected data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if `config.json` exists but is invalid.
    pub fn config(&self) -> anyhow::Result<BerthConfig> {
        let data_dir = self
            .data_dir
            .clone()
            .unwrap_or_else(|| berth_common::constants::data_dir().clone());
        Ok(BerthConfig::load(&data_dir)?)
    }
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build an image from a Berthfile.
    Build(build::BuildArgs),
    /// Run an image's entry command.
    Run(run::RunArgs),
    /// List containers.
    Ps(ps::PsArgs),
    /// Stop running containers.
    Stop(stop::StopArgs),
    /// Manage the local image catalog.
    Images(images::ImagesArgs),
    /// View container logs.
    Logs(logs::LogsArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config()?;
    tracing::debug!(data_dir = %config.data_dir.display(), "configuration loaded");
    match cli.command {
        Command::Build(args) => build::execute(args, &config),
        Command::Run(args) => run::execute(args, &config),
        Command::Ps(args) => ps::execute(&args, &config),
        Command::Stop(args) => stop::execute(&args, &config),
        Command::Images(args) => images::execute(&args, &config),
        Command::Logs(args) => logs::execute(&args, &config),
    }
}
