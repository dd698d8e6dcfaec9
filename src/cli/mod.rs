//! Command-line interface for arvo-corpus.
//!
//! Provides commands for checking the metadata stores, extracting cases,
//! building the corpus and inspecting its index.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
