//! CLI argument parsing using clap v4
//!
//! One binary, one subcommand per role.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::coordinator::SelectionStrategy;
use crate::relay::DuplicatePolicy;

/// relaymesh - relay-brokered peer-to-peer task dispatch
///
/// Run a relay that keeps the peer directory, nodes that execute programs,
/// or submit programs as a coordinator.
#[derive(Parser, Debug)]
#[command(name = "relaymesh")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay / peer directory
    Relay {
        /// Path to configuration file
        #[arg(short, long, env = "RELAYMESH_CONFIG")]
        config: Option<String>,

        /// Listen address, e.g. 0.0.0.0:3000
        #[arg(short, long)]
        bind: Option<String>,

        /// What to do when an identity registers twice (replace, reject)
        #[arg(long)]
        duplicate_policy: Option<DuplicatePolicy>,
    },

    /// Run a worker node
    Node {
        /// Path to configuration file
        #[arg(short, long, env = "RELAYMESH_CONFIG")]
        config: Option<String>,

        /// Relay WebSocket URL
        #[arg(short, long)]
        relay_url: Option<String>,

        /// Node identity (random `peer-…` if unset)
        #[arg(long)]
        id: Option<String>,

        /// Echo programs back instead of running them
        #[arg(long)]
        mock: bool,
    },

    /// Dispatch a program to an idle node and print its result
    Submit {
        /// Path to configuration file
        #[arg(short, long, env = "RELAYMESH_CONFIG")]
        config: Option<String>,

        /// Relay WebSocket URL
        #[arg(short, long)]
        relay_url: Option<String>,

        /// Node selection strategy
        #[arg(short, long, value_enum)]
        strategy: Option<SelectionStrategy>,

        /// Program text
        #[arg(conflicts_with = "file", required_unless_present = "file")]
        code: Option<String>,

        /// Read the program from a file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Submit the same program this many times
        #[arg(short = 'n', long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        repeat: u32,

        /// Per-task result timeout in milliseconds
        #[arg(long)]
        task_timeout_ms: Option<u64>,

        /// Print results as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// List worker nodes known to the relay
    Nodes {
        /// Path to configuration file
        #[arg(short, long, env = "RELAYMESH_CONFIG")]
        config: Option<String>,

        /// Relay WebSocket URL
        #[arg(short, long)]
        relay_url: Option<String>,

        /// Print the directory as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Display version and build information
    Version,
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Write a default configuration file
    Init {
        /// Where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
