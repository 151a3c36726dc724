//! Container instantiation for the berth runtime.
//!
//! Handles:
//! - **Engine**: resolving an image, assembling its root, and running the
//!   entry command as the image's account.
//! - **Launcher**: the `ProcessLauncher` seam, `chroot` and direct isolation.
//! - **Containers**: lifecycle records and stop signaling.
//! - **State**: the daemon-less container index.
//! - **Logs**: per-container log files.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod engine;
pub mod launcher;
pub mod logs;
pub mod state;
