//! Command-line argument parsing

use crate::output::OutputFormat;
use clap::{Parser, Subcommand};
use diwan_core::RequestId;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "diwan-admin",
    about = "Operator tools for the diwan approval workflow",
    version,
    long_about = "Inspect approval requests, report inconsistencies between a request's \
                  cached state and its approval history, and repair them."
)]
pub struct Args {
    /// Configuration file; settings fall back to DIWAN__* environment variables
    #[arg(short, long, env = "DIWAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format (text, json, yaml)
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(
        short,
        long,
        env = "LOG_LEVEL",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Apply pending database migrations
    Migrate,

    /// Show a request with its approval rows
    Show {
        /// Request ID
        request_id: RequestId,
    },

    /// Show how far a request has progressed
    Progress {
        /// Request ID
        request_id: RequestId,
    },

    /// Report inconsistencies between a request and its approval history
    Diagnose {
        /// Request ID
        request_id: RequestId,

        /// Exit with a failure status when issues are found
        #[arg(long)]
        strict: bool,
    },

    /// Rewrite a request's status and current step from its approval history
    Fix {
        /// Request ID
        request_id: RequestId,
    },
}
