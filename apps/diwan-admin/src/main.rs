//! diwan-admin
//!
//! Operator tools for inspecting and repairing approval requests.

mod cli;
mod commands;
mod output;
mod telemetry;

use anyhow::{Context as _, Result};
use clap::Parser;
use colored::Colorize;
use diwan_core::AppConfig;
use std::process::ExitCode;

use crate::cli::{Args, Command};
use crate::commands::Context;
use crate::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file if it exists
    dotenv::dotenv().ok();

    let args = Args::parse();
    if args.no_color {
        colored::control::set_override(false);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Command failed: {:#}", e);
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load_from_file(&path.to_string_lossy())
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => AppConfig::load().context("Failed to load configuration from environment")?,
    };

    if let Some(level) = &args.log_level {
        config.telemetry.log_level = level.clone();
    }
    config.telemetry.json_logs |= args.json_logs;
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    init_telemetry(&config.telemetry)?;
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), command = ?args.command, "Starting");

    let ctx = Context::connect(config, args.format).await?;
    match args.command {
        Command::Migrate => commands::migrate::run(&ctx).await,
        Command::Show { request_id } => commands::request::show(&ctx, request_id).await,
        Command::Progress { request_id } => commands::request::progress(&ctx, request_id).await,
        Command::Diagnose { request_id, strict } => {
            commands::repair::diagnose(&ctx, request_id, strict).await
        }
        Command::Fix { request_id } => commands::repair::fix(&ctx, request_id).await,
    }
}
