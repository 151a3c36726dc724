//! # berth-image
//!
//! Image and layer management for the berth harness.
//!
//! Handles:
//! - **Snapshots**: capturing a staging root and diffing it per build step.
//! - **Layers**: deterministic, content-addressed tar deltas with whiteouts.
//! - **Storage**: the local layer store, step cache, and image configs.
//! - **Images**: configs, root filesystem assembly, and merged entry views.
//! - **Sources**: `scratch`, `file://`, and `tar://` base roots.
//! - **Hashing**: SHA-256 content verification.
//! - **Registry**: local image catalog with tags.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod hash;
pub mod image;
pub mod layer;
pub mod registry;
pub mod snapshot;
pub mod source;
pub mod storage;
