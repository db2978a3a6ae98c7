//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - schedule: assign today's send times
//! - tick: run one delivery pass
//! - run: run the scheduler and worker continuously
//! - subscriber: add/list/deactivate subscribers
//! - status: inspect a subscriber's delivery for a day
//! - prune: drop history rows past retention

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Dripfeed - daily personalized SMS scheduling and delivery
#[derive(Parser, Debug)]
#[command(name = "dripfeed")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Assign a send time to every active subscriber for a day
    Schedule {
        /// UTC day to schedule (YYYY-MM-DD, defaults to today)
        #[arg(short, long)]
        day: Option<NaiveDate>,
    },

    /// Run one delivery pass over due records
    Tick,

    /// Run continuously: schedule each new day and tick on an interval
    Run {
        /// Seconds between delivery passes
        #[arg(short, long, default_value_t = 30)]
        interval: u64,
    },

    /// Subscriber management commands
    Subscriber {
        #[command(subcommand)]
        command: SubscriberCommands,
    },

    /// Show a subscriber's delivery status for a day
    Status {
        /// Subscriber ID to check
        subscriber: String,

        /// UTC day to check (YYYY-MM-DD, defaults to today)
        #[arg(short, long)]
        day: Option<NaiveDate>,
    },

    /// Delete history entries older than the retention window
    Prune,
}

/// Subscriber management subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum SubscriberCommands {
    /// Add or update a subscriber
    Add {
        /// Subscriber ID
        id: String,

        /// Phone number in E.164 form
        phone: String,

        /// IANA timezone name
        #[arg(short, long, default_value = "UTC")]
        timezone: String,

        /// Local hour the delivery window opens (0-23)
        #[arg(long, default_value_t = 12)]
        window_start: u8,

        /// Local hour the delivery window closes (1-24, exclusive)
        #[arg(long, default_value_t = 17)]
        window_end: u8,
    },

    /// List active subscribers
    List,

    /// Deactivate a subscriber
    Deactivate {
        /// Subscriber ID to deactivate
        id: String,
    },
}
