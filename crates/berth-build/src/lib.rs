//! # berth-build
//!
//! The image build pipeline of the berth harness.
//!
//! Handles:
//! - **Context**: the explicit build state threaded through every step.
//! - **Pipeline**: working directory, manifest, dependency install, source
//!   copy, account creation, identity switch, and entry command.
//! - **Installers**: the dependency installer seam and its local backends.
//! - **Cache**: step cache keys chained over parent steps.
//! - **Filter**: `.berthignore` handling for the build context.
//! - **Recipe**: driving the pipeline from a `Berthfile`.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cache;
pub mod context;
pub mod copy;
pub mod filter;
pub mod installer;
pub mod log;
pub mod pipeline;
pub mod recipe;
