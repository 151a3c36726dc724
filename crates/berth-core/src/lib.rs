//! # berth-core
//!
//! Privilege primitives for the berth harness.
//!
//! This crate provides:
//! - **Accounts**: provisioning unprivileged accounts inside an image root.
//! - **Identity**: the one-way switch from the builder to an account, and
//!   the `chroot` + `setuid` sequence applied to entry processes.
//! - **Access**: auditing that an account can use every image entry.
//!
//! Raw system calls go through `nix` and are confined to
//! [`identity::enter_root`] and [`identity::drop_privileges`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod access;
pub mod account;
pub mod identity;
