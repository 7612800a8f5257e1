//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::orders::OrderStatus;

/// Track command arguments.
#[derive(Debug, Args)]
pub struct TrackCommand {
    /// Order to track
    #[arg(short, long)]
    pub order: String,

    /// User reporting the positions
    #[arg(short, long)]
    pub user: String,

    /// Replay fixes from a JSON Lines file (a simulated random walk is used otherwise)
    #[arg(long, value_name = "FILE")]
    pub replay: Option<PathBuf>,

    /// Stop after this many seconds (runs until Ctrl-C when omitted)
    #[arg(short, long)]
    pub duration_secs: Option<u64>,
}

/// History command arguments.
#[derive(Debug, Args)]
pub struct HistoryCommand {
    /// Order whose history to show
    pub order: String,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Latest command arguments.
#[derive(Debug, Args)]
pub struct LatestCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Watch command arguments.
#[derive(Debug, Args)]
pub struct WatchCommand {
    /// Poll interval in milliseconds (defaults to the configured interval)
    #[arg(short, long)]
    pub interval_ms: Option<u64>,

    /// Stop after this many refreshes
    #[arg(short = 'n', long)]
    pub count: Option<u64>,
}

/// Order registry commands.
#[derive(Debug, Subcommand)]
pub enum OrdersCommand {
    /// Register a new order
    Add {
        /// Destination latitude
        #[arg(long, allow_hyphen_values = true)]
        dest_lat: f64,

        /// Destination longitude
        #[arg(long, allow_hyphen_values = true)]
        dest_lng: f64,

        /// Assign the order to a user
        #[arg(short, long, value_name = "USER")]
        assign: Option<String>,

        /// Use this id instead of generating one
        #[arg(long)]
        id: Option<String>,
    },

    /// List registered orders
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Change an order's status
    Status {
        /// Order to update
        id: String,

        /// New status: pending, assigned, in-transit or delivered
        status: OrderStatus,
    },
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}
