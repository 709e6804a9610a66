//! Command-line interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default configuration file written by `config init`.
pub const DEFAULT_CONFIG_FILE: &str = "mocap-reduce.toml";

/// mocap-reduce - Reconstruct, trim, average and smooth motion-capture trials
#[derive(Parser, Debug)]
#[command(name = "mocap-reduce")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the whole pipeline on a directory of recordings
    Run {
        /// Input root: <participant>/<experiment>/<trial>.csv
        #[arg(short, long)]
        input: PathBuf,

        /// Output root for all stages
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Print the reference ranking for anchor markers
    Score {
        /// Input root: <participant>/<experiment>/<trial>.csv
        #[arg(short, long)]
        input: PathBuf,

        /// Only rank this experiment
        #[arg(short, long)]
        experiment: Option<String>,
    },

    /// View or create configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration as TOML
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse command-line arguments
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Path used by `config init`
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}
