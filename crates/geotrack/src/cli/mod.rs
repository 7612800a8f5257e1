//! Command-line interface for geotrack.
//!
//! This module provides the CLI structure for the `geotrack` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::logging::Verbosity;

pub use commands::{
    ConfigCommand, HistoryCommand, LatestCommand, OrdersCommand, StatusCommand, TrackCommand,
    WatchCommand,
};

/// geotrack - Track delivery orders by GPS
///
/// Samples positions for an order, keeps a bounded history per order, and
/// shows the latest known position of every tracked order.
#[derive(Debug, Parser)]
#[command(name = "geotrack")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Track an order's position until stopped
    Track(TrackCommand),

    /// Show the stored history of an order
    History(HistoryCommand),

    /// Show the latest position of every tracked order
    Latest(LatestCommand),

    /// Continuously refresh the latest positions
    Watch(WatchCommand),

    /// Manage the order registry
    #[command(subcommand)]
    Orders(OrdersCommand),

    /// Show storage status
    Status(StatusCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.quiet, self.verbose)
    }
}
