//! Output formatting utilities

use colored::{ColoredString, Colorize};
use diwan_workflow::{ApprovalStatus, RequestStatus};
use serde::Serialize;

/// Output format types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "yaml" | "yml" => Ok(OutputFormat::Yaml),
            _ => Err(format!("Unknown format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Yaml => write!(f, "yaml"),
        }
    }
}

/// Serialize `value` for the machine-readable formats. Returns `None` for
/// text, which each command renders itself.
pub fn format_structured<T: Serialize>(value: &T, format: OutputFormat) -> anyhow::Result<Option<String>> {
    match format {
        OutputFormat::Text => Ok(None),
        OutputFormat::Json => Ok(Some(serde_json::to_string_pretty(value)?)),
        OutputFormat::Yaml => Ok(Some(serde_yaml::to_string(value)?)),
    }
}

/// Print a success message
pub fn success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

/// Print a warning message
pub fn warning(message: &str) {
    println!("{} {}", "⚠".yellow(), message);
}

/// Print a key-value pair
pub fn key_value(key: &str, value: impl std::fmt::Display) {
    println!("{}: {}", key.bold(), value);
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.bold().underline());
}

pub fn request_status(status: RequestStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        RequestStatus::Completed => label.green(),
        RequestStatus::Rejected => label.red(),
        RequestStatus::Cancelled => label.dimmed(),
        RequestStatus::Pending | RequestStatus::InProgress => label.yellow(),
    }
}

pub fn approval_status(status: ApprovalStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        ApprovalStatus::Approved => label.green(),
        ApprovalStatus::Rejected => label.red(),
        ApprovalStatus::Pending => label.yellow(),
    }
}

/// Render a percentage as a fixed-width bar
pub fn progress_bar(percent: u8, width: usize) -> String {
    let filled = (usize::from(percent.min(100)) * width + 50) / 100;
    format!("[{}{}] {:>3}%", "#".repeat(filled), "-".repeat(width - filled), percent)
}
