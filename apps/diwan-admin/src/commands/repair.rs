//! Diagnose and fix commands

use super::Context;
use crate::output::{self, format_structured};
use anyhow::{bail, Context as _, Result};
use colored::Colorize;
use diwan_core::RequestId;

pub async fn diagnose(ctx: &Context, request_id: RequestId, strict: bool) -> Result<()> {
    let report = ctx
        .machine()
        .diagnostics()
        .diagnose(request_id)
        .await
        .with_context(|| format!("Failed to diagnose request {}", request_id))?;

    if let Some(rendered) = format_structured(&report, ctx.format)? {
        println!("{}", rendered);
    } else if report.is_consistent() {
        output::success(&format!(
            "Request {} is consistent ({})",
            request_id, report.status
        ));
    } else {
        output::warning(&format!(
            "Request {} has {} issue(s)",
            request_id,
            report.issues.len()
        ));
        for issue in &report.issues {
            println!("  {} {}", issue.kind.as_str().yellow().bold(), issue.message);
        }
        println!();
        println!("Run {} to repair it.", format!("diwan-admin fix {}", request_id).bold());
    }

    if strict && !report.is_consistent() {
        bail!("{} inconsistencies found", report.issues.len());
    }
    Ok(())
}

pub async fn fix(ctx: &Context, request_id: RequestId) -> Result<()> {
    let report = ctx
        .machine()
        .diagnostics()
        .fix(request_id)
        .await
        .with_context(|| format!("Failed to repair request {}", request_id))?;

    if let Some(rendered) = format_structured(&report, ctx.format)? {
        println!("{}", rendered);
        return Ok(());
    }

    if !report.changed {
        output::success(&format!("Request {} needed no changes", request_id));
        return Ok(());
    }

    output::success(&format!("Request {} repaired", request_id));
    for action in &report.actions {
        println!("  - {}", action);
    }
    output::key_value("Status", output::request_status(report.request.status));
    output::key_value("Version", report.request.version);
    Ok(())
}
