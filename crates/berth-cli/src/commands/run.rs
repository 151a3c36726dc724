//! `berth run` — Run an image's entry command.

use std::path::PathBuf;

use berth_common::config::BerthConfig;
use berth_common::types::Isolation;
use berth_recipe::envfile;
use berth_runtime::container::forward_signal;
use berth_runtime::engine::{Engine, RunOptions};
use clap::Args;
use nix::sys::signal::Signal;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Image tag or id prefix.
    pub image: String,

    /// Extra environment variable (`KEY=VALUE`), repeatable.
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// File of `KEY=VALUE` lines, applied before `--env`.
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Isolation for the entry process (`chroot` or `direct`).
    #[arg(long, env = "BERTH_ISOLATION")]
    pub isolation: Option<Isolation>,

    /// Write the entry process output to the container log instead of the terminal.
    #[arg(long)]
    pub capture: bool,
}

/// Executes the `run` command.
///
/// Ctrl+C and SIGTERM are forwarded to the entry process; berth exits with
/// the entry process's status.
///
/// # Errors
///
/// Returns `EntryProcessFailure` for a non-zero exit, or the error that
/// kept the container from starting.
pub fn execute(args: RunArgs, config: &BerthConfig) -> anyhow::Result<()> {
    let mut env = Vec::new();
    if let Some(path) = &args.env_file {
        let text = std::fs::read_to_string(path)
            .map_err(|e| berth_common::error::BerthError::io(path, e))?;
        env.extend(envfile::parse_env_file(&path.display().to_string(), &text)?);
    }
    for assignment in &args.env {
        env.push(envfile::parse_assignment(assignment)?);
    }

    let options = RunOptions {
        env,
        isolation: args.isolation.unwrap_or(config.isolation),
        capture_output: args.capture,
    };
    let engine = Engine::new(config)?;
    let running = engine.start(&args.image, &options)?;

    let pid = running.pid();
    ctrlc::set_handler(move || {
        if let Err(e) = forward_signal(pid, Signal::SIGTERM) {
            tracing::warn!(pid, error = %e, "could not forward termination signal");
        }
    })?;
    eprintln!(
        "Started {} as {} (pid {pid})",
        running.id().short(),
        running.identity().name
    );

    let record = engine.wait(running)?;
    tracing::info!(id = %record.id.short(), "container exited cleanly");
    Ok(())
}
