//! CLI, configuration, terminal UI and commands
//!
//! This crate provides the `colab` command-line interface.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod secret;
pub mod ui;

pub use cli::Cli;
pub use error::{ClientError, ClientResult};
