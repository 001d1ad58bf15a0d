//! CLI module for dogood - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for running the factory
//! and inspecting or adjusting the shared coordination state.

pub mod commands;

pub use commands::Cli;
