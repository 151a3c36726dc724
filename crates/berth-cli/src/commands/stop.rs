//! `berth stop` — Stop running containers.

use berth_common::config::BerthConfig;
use berth_runtime::container::StopOutcome;
use berth_runtime::engine::Engine;
use clap::Args;

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Container ids or unique id prefixes.
    #[arg(required = true)]
    pub containers: Vec<String>,
}

/// Executes the `stop` command.
///
/// Sends SIGTERM, then SIGKILL once the configured grace period elapses.
///
/// # Errors
///
/// Returns the first error encountered; remaining containers are skipped.
pub fn execute(args: &StopArgs, config: &BerthConfig) -> anyhow::Result<()> {
    let engine = Engine::new(config)?;
    for reference in &args.containers {
        let outcome = engine.stop(reference)?;
        let verb = match outcome {
            StopOutcome::Terminated => "stopped",
            StopOutcome::Killed => "killed",
            StopOutcome::NotRunning => "not running",
        };
        println!("{reference}: {verb}");
    }
    Ok(())
}
