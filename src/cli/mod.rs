//! CLI module for the Halldyll infrastructure tool.
//!
//! This module provides the command-line interface for validating,
//! planning, applying, and destroying declared infrastructure.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
