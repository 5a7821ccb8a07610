//! Command-line interface for promptgrid.
//!
//! Provides offline expansion inspection and an end-to-end runner against
//! the live image service.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
