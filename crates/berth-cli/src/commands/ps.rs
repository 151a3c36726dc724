//! `berth ps` — List containers.

use berth_common::config::BerthConfig;
use berth_common::types::ContainerState;
use berth_runtime::engine::Engine;
use clap::Args;

use crate::output;

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Show all containers (including exited and failed).
    #[arg(short, long)]
    pub all: bool,
}

/// Executes the `ps` command.
///
/// # Errors
///
/// Returns an error if the state index cannot be read.
pub fn execute(args: &PsArgs, config: &BerthConfig) -> anyhow::Result<()> {
    let engine = Engine::new(config)?;
    let containers: Vec<_> = engine
        .list()?
        .into_iter()
        .filter(|c| args.all || c.state == ContainerState::Running)
        .collect();

    if containers.is_empty() {
        println!("No containers found.");
        return Ok(());
    }

    println!(
        "{:<14} {:<20} {:<12} {:<9} {:<8} {:<6} {:<25}",
        "CONTAINER ID", "IMAGE", "USER", "STATE", "PID", "EXIT", "CREATED"
    );
    for c in &containers {
        println!(
            "{:<14} {:<20} {:<12} {:<9} {:<8} {:<6} {:<25}",
            c.id.short(),
            c.image_ref,
            c.user,
            c.state,
            output::or_dash(c.pid),
            output::or_dash(c.exit_code),
            c.created_at
        );
    }
    Ok(())
}
