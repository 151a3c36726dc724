//! # berth-recipe
//!
//! Parsers for the build inputs of the berth harness.
//!
//! Handles:
//! - **Parser**: Lexing, AST construction, and order validation of `Berthfile` recipes.
//! - **Manifest**: Dependency manifests and version constraints.
//! - **Envfile**: `KEY=VALUE` assignments from flags, env files, and `ENV`.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod envfile;
pub mod manifest;
pub mod parser;
