use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::utils::version;

#[derive(Parser)]
#[command(author, version = version().leak() as &'static str, about, long_about = None)]
#[command(subcommand_value_name = "SUBCOMMAND")]
#[command(subcommand_help_heading = "Subcommands")]
pub struct Cli {
    /// Path to the configuration directory (default: `/etc/keywarp`).
    #[arg(short, long)]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub subcommand: Option<Sub>,
}

#[derive(Subcommand)]
pub enum Sub {
    /// Validate the configuration files.
    Validate {
        /// Path to the configuration directory (default: `/etc/keywarp`).
        #[arg(short, long)]
        config_dir: Option<PathBuf>,
    },
    /// Communicate with the running keywarp instance.
    Msg {
        #[command(subcommand)]
        msg: Msg,
    },
}

#[derive(Subcommand)]
pub enum Msg {
    /// Re-scan the configuration directory and re-bind devices.
    Reload,
    /// Apply a `[layer.]key = action` expression to every configuration.
    Bind {
        /// The binding expression.
        expr: String,
    },
    /// Subscribe to layer activations and print them to stdout.
    Listen,
}
