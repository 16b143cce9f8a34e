//! Request inspection commands

use super::Context;
use crate::output::{self, format_structured};
use anyhow::{Context as _, Result};
use colored::Colorize;
use diwan_core::{RequestId, StepId};
use diwan_workflow::{RequestSnapshot, StagePosition, WorkflowDefinition};
use serde::Serialize;

#[derive(Serialize)]
struct RequestView<'a> {
    #[serde(flatten)]
    snapshot: &'a RequestSnapshot,
    workflow_name: &'a str,
}

pub async fn show(ctx: &Context, request_id: RequestId) -> Result<()> {
    let machine = ctx.machine();
    let snapshot = machine
        .snapshot(request_id)
        .await
        .with_context(|| format!("Failed to load request {}", request_id))?;
    let workflow = machine.workflow(&snapshot.request.workflow_id).await?;

    let view = RequestView {
        snapshot: &snapshot,
        workflow_name: &workflow.name,
    };
    if let Some(rendered) = format_structured(&view, ctx.format)? {
        println!("{}", rendered);
        return Ok(());
    }

    let request = &snapshot.request;
    output::key_value("Request", request.id);
    output::key_value("Workflow", format!("{} ({})", workflow.name, workflow.id));
    output::key_value("Status", output::request_status(request.status));
    output::key_value("Requester", request.requester_id);
    output::key_value(
        "Current step",
        request
            .current_step_id
            .map(|id| step_label(&workflow, &id))
            .unwrap_or_else(|| "-".to_string()),
    );
    output::key_value("Version", request.version);
    output::key_value("Updated", request.updated_at.to_rfc3339());

    output::section("Approvals");
    if snapshot.approvals.is_empty() {
        println!("  {}", "none".dimmed());
    }
    for approval in &snapshot.approvals {
        let assignee = match (approval.assignment.role(), approval.assignment.approver_id()) {
            (Some(role), Some(holder)) => format!("{} ({})", holder, role),
            (Some(role), None) => format!("any holder of {}", role),
            (None, Some(user)) => user.to_string(),
            (None, None) => "-".to_string(),
        };
        println!(
            "  {} {:<9} {} -> {}",
            approval.id.to_string().dimmed(),
            output::approval_status(approval.status),
            step_label(&workflow, &approval.step_id),
            assignee
        );
        if let Some(comments) = &approval.comments {
            println!("      {}", comments.italic());
        }
    }

    Ok(())
}

pub async fn progress(ctx: &Context, request_id: RequestId) -> Result<()> {
    let progress = ctx
        .machine()
        .progress(request_id)
        .await
        .with_context(|| format!("Failed to load request {}", request_id))?;

    if let Some(rendered) = format_structured(&progress, ctx.format)? {
        println!("{}", rendered);
        return Ok(());
    }

    output::key_value("Status", output::request_status(progress.status));
    let stage = match (progress.position, progress.stage_order) {
        (StagePosition::At { index }, Some(order)) => {
            format!("{} of {} (order {})", index + 1, progress.total_stages, order)
        }
        (StagePosition::Dangling { step_id }, _) => format!("unknown step {}", step_id).red().to_string(),
        _ => "not started".to_string(),
    };
    output::key_value("Stage", stage);
    output::key_value("Progress", output::progress_bar(progress.percent, 20));
    Ok(())
}

fn step_label(workflow: &WorkflowDefinition, step_id: &StepId) -> String {
    match workflow.step(step_id) {
        Some(step) => format!("{} [{}, order {}]", step.step_name, step.step_type, step.step_order),
        None => format!("{} [not in workflow]", step_id),
    }
}
