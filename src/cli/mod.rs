//! CLI module for dripfeed - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for scheduling,
//! delivery ticks, subscriber management, and status queries.

pub mod commands;

pub use commands::Cli;
