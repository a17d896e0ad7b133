use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Usage Protection
///
/// Tracks daily app usage against a time budget and a weekly schedule,
/// with a one-time self-extension and a PIN-gated parental unlock.
#[derive(Parser, Debug)]
#[command(name = "usage-protection")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the host config file (defaults to the per-user config dir)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example host config and settings file
    Init {
        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },
    /// Track usage in the foreground until Ctrl-C
    Run,
    /// Show today's usage and lock state
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Use today's self-extension (self mode, daily limit reached)
    Extend,
    /// Return parental extension time to today's budget
    Unlock {
        /// Parental PIN (4-12 digits)
        #[arg(long)]
        pin: String,
    },
    /// Print the hash to store as `parentPinHash`
    HashPin {
        /// New parental PIN (4-12 digits)
        pin: String,
    },
}
