//! `berth logs` — View container logs.

use berth_common::config::BerthConfig;
use berth_runtime::engine::Engine;
use clap::Args;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Container id or unique id prefix.
    pub container: String,

    /// Show only the last N lines.
    #[arg(short = 'n', long)]
    pub tail: Option<usize>,
}

/// Executes the `logs` command.
///
/// # Errors
///
/// Returns an error if the container is not found or logs are unreadable.
pub fn execute(args: &LogsArgs, config: &BerthConfig) -> anyhow::Result<()> {
    let engine = Engine::new(config)?;
    let logs = engine.logs(&args.container, args.tail)?;

    if logs.is_empty() {
        println!("No logs available for container: {}", args.container);
    } else {
        print!("{logs}");
    }
    Ok(())
}
