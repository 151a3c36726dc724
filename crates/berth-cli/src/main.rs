//! # berth
//!
//! Builds an image from a manifest and a source tree, then runs its entry
//! command as the unprivileged account the image created.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod commands;
mod output;

use std::process::ExitCode;

use berth_common::error::BerthError;
use clap::Parser;

use crate::commands::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match commands::execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let berth = err.downcast_ref::<BerthError>();
            // The entry process already reported its own failure.
            if !matches!(berth, Some(BerthError::EntryProcessFailure { .. })) {
                eprintln!("error: {err:#}");
            }
            let code = berth.map_or(1, BerthError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
