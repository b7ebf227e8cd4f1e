//! CLI module for the Keystone reconciliation engine.
//!
//! This module provides the command-line interface: argument parsing and
//! output formatting. Commands are dispatched by the binary.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
