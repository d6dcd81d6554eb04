//! # SwarmFS CLI
//!
//! The command-line surface over [`swarmfs_core::Node`] (§6 CLI surface).
//! Split into a library so its configuration and progress-display helpers
//! carry their own unit tests and doctests instead of living behind a
//! bin-only crate — `main.rs` is just argument parsing and dispatch.

pub mod config;
pub mod progress;
