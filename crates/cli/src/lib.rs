//! CLI tool for running public-key addressed network nodes.
//!
//! Provides commands for:
//! - Generating node identities
//! - Inspecting addresses
//! - Running and dialing direct-only echo nodes
//! - An in-process demo over both backends

pub mod commands;
pub mod config;

pub use commands::{Command, CommandResult};
pub use config::CliConfig;
