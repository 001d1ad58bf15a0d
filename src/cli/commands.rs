//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - factory: run the agent factory over a candidate file
//! - status: show claims and rate budget
//! - trust: inspect or adjust per-repo trust
//! - audit: show the action trail

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Dogood - multi-agent OSS contribution coordinator
#[derive(Parser, Debug)]
#[command(name = "dogood")]
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
    /// Run the agent factory over a candidate file
    Factory {
        /// JSON file of candidate work items
        #[arg(short = 'f', long)]
        candidates: PathBuf,

        /// Override the configured worker cap
        #[arg(short, long)]
        max_agents: Option<usize>,

        /// Override the configured candidate cap
        #[arg(long)]
        max_items: Option<usize>,
    },

    /// Show active claims, rate budget, and recent contributions
    Status {
        /// Number of contributions to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Show trust state for a repo
    Trust {
        /// Repository (owner/name)
        repo: String,
    },

    /// Record a merged pull request for a repo
    RecordMerge {
        /// Repository (owner/name)
        repo: String,
    },

    /// Record maintainer pushback against a repo
    RecordStrike {
        /// Repository (owner/name)
        repo: String,

        /// What happened
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Remove strikes from a repo
    Redeem {
        /// Repository (owner/name)
        repo: String,

        /// Strikes to remove
        #[arg(short, long, default_value_t = 1)]
        amount: u32,
    },

    /// Release or abandon a claim by hand
    Release {
        /// Work item key (owner/name#number)
        work_item: String,

        /// Agent id holding the claim
        #[arg(short, long)]
        owner: String,

        /// Mark abandoned instead of completed
        #[arg(short, long)]
        abandon: bool,
    },

    /// Show the most recent audit entries
    Audit {
        /// Number of entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Delete stale claim rows
    Sweep,
}
