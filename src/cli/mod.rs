//! CLI module for the pipeline binary
//!
//! Uses clap for argument parsing and owo-colors for colored terminal output.

pub mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// A.R.E.S Pipeline - research runs over many data sources
///
/// Routes a question, clarifies it, plans which sources to query, queries them
/// concurrently and streams back a synthesized answer.
#[derive(Parser, Debug)]
#[command(
    name = "ares-pipeline",
    author = "Dirmacs <build@dirmacs.com>",
    version,
    about = "A.R.E.S Pipeline - multi-source research runs",
    after_help = "EXAMPLES:\n    \
                  ares-pipeline run \"What were Q3 sales by region?\"\n    \
                  ares-pipeline run --json \"List our HR policies\"\n    \
                  ares-pipeline config --validate\n    \
                  ares-pipeline sources --config my.toml"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "ares-pipeline.toml", global = true)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline for a single user message
    Run {
        /// The user's message
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,

        /// Print events as JSON lines instead of formatted text
        #[arg(long)]
        json: bool,

        /// Override the run timeout, in seconds
        #[arg(long)]
        run_timeout: Option<u64>,
    },

    /// Show configuration information
    Config {
        /// Show the full configuration as TOML
        #[arg(short = 'f', long)]
        full: bool,

        /// Validate the configuration file
        #[arg(long)]
        validate: bool,
    },

    /// List configured data sources
    Sources,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
