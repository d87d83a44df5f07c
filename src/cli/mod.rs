//! Command-line interface for compute-forge.
//!
//! Provides commands for running single compute jobs and for benchmarking
//! the worker pool with a mixed-priority batch.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
