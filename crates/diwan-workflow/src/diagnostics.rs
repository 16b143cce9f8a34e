//! Consistency checks and repair for request state
//!
//! The approval rows are the ground truth. [`inspect`] compares a request's
//! cached pointer and status against them and its workflow; [`plan_repair`]
//! derives the state the history implies. `fix` applies that plan under the
//! same lock and version check the state machine uses.

use crate::engine::{Loaded, Services};
use crate::request::{Approval, ApprovalStatus, Request, RequestSnapshot, RequestStatus};
use crate::resolver::StagePosition;
use crate::retry::retry_with;
use crate::stages::Stage;
use crate::step::{StepType, WorkflowDefinition};
use crate::store::ChangeSet;
use crate::{Result, WorkflowError};
use diwan_core::{ApprovalId, Event, RequestId, StepId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Pointer names a step outside the request's workflow
    ForeignPointer,
    /// A passed stage has a required decision step without rows, or any
    /// decision step with a rejected row
    UnsettledStage,
    /// Pending row that can never be acted on
    OrphanedApproval,
    /// A step of the live current stage has no rows
    MissingApprovals,
    /// The live current stage is already cleared
    StalledStage,
    /// Status contradicts the approval history at the pointer
    StatusMismatch,
    /// Status contradicts whether the pointer is set
    StatusPointerMismatch,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::ForeignPointer => "foreign_pointer",
            IssueKind::UnsettledStage => "unsettled_stage",
            IssueKind::OrphanedApproval => "orphaned_approval",
            IssueKind::MissingApprovals => "missing_approvals",
            IssueKind::StalledStage => "stalled_stage",
            IssueKind::StatusMismatch => "status_mismatch",
            IssueKind::StatusPointerMismatch => "status_pointer_mismatch",
        }
    }
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<ApprovalId>,
}

impl Issue {
    fn new(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step_id: None,
            approval_id: None,
        }
    }

    fn with_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    fn with_approval(mut self, approval: &Approval) -> Self {
        self.step_id = Some(approval.step_id);
        self.approval_id = Some(approval.id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub issues: Vec<Issue>,
}

impl DiagnosticReport {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }

    /// Surface the issues as an [`WorkflowError::Inconsistent`] error
    pub fn into_result(self) -> Result<()> {
        if self.issues.is_empty() {
            return Ok(());
        }
        let kinds: Vec<&str> = self.issues.iter().map(|i| i.kind.as_str()).collect();
        Err(WorkflowError::Inconsistent(format!(
            "request {}: {}",
            self.request_id,
            kinds.join(", ")
        )))
    }
}

/// Outcome of a `fix` run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairReport {
    pub changed: bool,
    pub actions: Vec<String>,
    pub request: Request,
}

/// State the approval history implies for a request
#[derive(Debug, Clone, PartialEq)]
pub struct RepairPlan {
    pub status: RequestStatus,
    pub current_step_id: Option<StepId>,
    /// Index of the derived current stage, when one is current
    pub stage_index: Option<usize>,
    /// Steps of the derived current stage that need fresh rows
    pub regenerate: Vec<StepId>,
    /// Pending rows that can never be acted on
    pub delete: Vec<ApprovalId>,
}

impl RepairPlan {
    pub fn changes_anything(&self, request: &Request) -> bool {
        self.status != request.status
            || self.current_step_id != request.current_step_id
            || !self.regenerate.is_empty()
            || !self.delete.is_empty()
    }
}

/// Pending rows for steps outside the workflow
fn foreign_pending<'a>(
    workflow: &'a WorkflowDefinition,
    approvals: &'a [Approval],
) -> impl Iterator<Item = &'a Approval> + 'a {
    approvals
        .iter()
        .filter(move |a| a.is_pending() && !workflow.contains_step(&a.step_id))
}

/// Pending rows of stages after `index`
fn future_pending<'a>(
    stages: &'a [Stage],
    index: Option<usize>,
    approvals: &'a [Approval],
) -> impl Iterator<Item = &'a Approval> + 'a {
    let from = index.map_or(0, |i| i + 1);
    approvals.iter().filter(move |a| {
        a.is_pending() && stages[from.min(stages.len())..].iter().any(|s| s.contains(&a.step_id))
    })
}

/// Read-only consistency checks over a loaded request
pub fn inspect(snapshot: &RequestSnapshot, workflow: &WorkflowDefinition, stages: &[Stage]) -> Vec<Issue> {
    let request = &snapshot.request;
    let approvals = &snapshot.approvals;
    let position = StagePosition::resolve(stages, request.current_step_id.as_ref());
    let mut issues = Vec::new();

    if let StagePosition::Dangling { step_id } = position {
        issues.push(
            Issue::new(
                IssueKind::ForeignPointer,
                format!(
                    "current step {} is not part of workflow {}",
                    step_id, request.workflow_id
                ),
            )
            .with_step(step_id),
        );
    }

    for row in foreign_pending(workflow, approvals) {
        issues.push(
            Issue::new(
                IssueKind::OrphanedApproval,
                format!("pending approval {} is for a step outside the workflow", row.id),
            )
            .with_approval(row),
        );
    }

    if request.status == RequestStatus::Cancelled {
        return issues;
    }

    match (request.status, request.current_step_id) {
        (RequestStatus::Completed, Some(_)) => issues.push(Issue::new(
            IssueKind::StatusPointerMismatch,
            "completed request still points at a step",
        )),
        (RequestStatus::Pending, Some(_)) => issues.push(Issue::new(
            IssueKind::StatusPointerMismatch,
            "pending request already points at a step",
        )),
        (RequestStatus::Rejected | RequestStatus::InProgress, None) if !stages.is_empty() => {
            issues.push(Issue::new(
                IssueKind::StatusPointerMismatch,
                format!("{} request has no current step", request.status),
            ))
        }
        _ => {}
    }

    if request.status == RequestStatus::Pending
        && approvals.iter().any(|a| workflow.contains_step(&a.step_id))
    {
        issues.push(Issue::new(
            IssueKind::StatusMismatch,
            "pending request already has approval history",
        ));
    }

    if stages.is_empty() && matches!(request.status, RequestStatus::InProgress | RequestStatus::Rejected) {
        issues.push(Issue::new(
            IssueKind::StatusMismatch,
            format!("{} request routed through a workflow with no steps", request.status),
        ));
    }

    if matches!(position, StagePosition::Dangling { .. }) {
        return issues;
    }

    let (passed, current) = match (request.status, position.index()) {
        (RequestStatus::Completed, _) => (stages.len(), None),
        (_, Some(index)) => (index, Some(index)),
        (_, None) => (0, None),
    };

    for stage in &stages[..passed] {
        for step in stage.steps.iter().filter(|s| s.step_type == StepType::Decision) {
            let mut rows = approvals.iter().filter(|a| a.step_id == step.id).peekable();
            if rows.peek().is_none() {
                if !step.is_blocking() {
                    continue;
                }
                issues.push(
                    Issue::new(
                        IssueKind::UnsettledStage,
                        format!("passed stage {} has no approval for step '{}'", stage.order, step.step_name),
                    )
                    .with_step(step.id),
                );
                continue;
            }
            for row in rows {
                match row.status {
                    ApprovalStatus::Approved => {}
                    ApprovalStatus::Rejected => issues.push(
                        Issue::new(
                            IssueKind::UnsettledStage,
                            format!("passed stage {} has a rejected approval for step '{}'", stage.order, step.step_name),
                        )
                        .with_approval(row),
                    ),
                    ApprovalStatus::Pending if step.is_blocking() => issues.push(
                        Issue::new(
                            IssueKind::OrphanedApproval,
                            format!("pending approval {} belongs to passed stage {}", row.id, stage.order),
                        )
                        .with_approval(row),
                    ),
                    ApprovalStatus::Pending => {}
                }
            }
        }
    }

    if request.status != RequestStatus::Completed {
        for row in future_pending(stages, current, approvals) {
            issues.push(
                Issue::new(
                    IssueKind::OrphanedApproval,
                    format!("pending approval {} belongs to a stage the request has not reached", row.id),
                )
                .with_approval(row),
            );
        }
    }

    let Some(index) = current else {
        return issues;
    };
    let stage = &stages[index];

    if request.status.is_live() {
        for step in &stage.steps {
            if !approvals.iter().any(|a| a.step_id == step.id) {
                issues.push(
                    Issue::new(
                        IssueKind::MissingApprovals,
                        format!("current stage {} has no approval rows for step '{}'", stage.order, step.step_name),
                    )
                    .with_step(step.id),
                );
            }
        }

        if stage.has_rejection(approvals) {
            issues.push(Issue::new(
                IssueKind::StatusMismatch,
                format!("{} request has a rejected decision in stage {}", request.status, stage.order),
            ));
        } else if stage.is_cleared(approvals) {
            issues.push(Issue::new(
                IssueKind::StalledStage,
                format!("current stage {} is cleared but the request did not advance", stage.order),
            ));
        }
    } else if request.status == RequestStatus::Rejected && !stage.has_rejection(approvals) {
        issues.push(Issue::new(
            IssueKind::StatusMismatch,
            format!("rejected request has no rejected decision in stage {}", stage.order),
        ));
    }

    issues
}

/// Derive the state the approval history implies.
///
/// Stages are walked in order: a stage with a rejected decision row ends
/// the walk as rejected, a cleared stage is passed, and the first uncleared
/// stage becomes current. A pending request with no rows for workflow steps
/// has not started. Cancelled requests keep their status and only lose a
/// foreign pointer and foreign pending rows.
pub fn plan_repair(snapshot: &RequestSnapshot, workflow: &WorkflowDefinition, stages: &[Stage]) -> RepairPlan {
    let request = &snapshot.request;
    let approvals = &snapshot.approvals;
    let mut delete: Vec<ApprovalId> = foreign_pending(workflow, approvals).map(|a| a.id).collect();

    let keep_or_representative = |index: usize| -> Option<StepId> {
        let stage = &stages[index];
        match request.current_step_id {
            Some(step_id) if stage.contains(&step_id) => Some(step_id),
            _ => Some(stage.representative().id),
        }
    };

    if request.status == RequestStatus::Cancelled {
        let current_step_id = match StagePosition::resolve(stages, request.current_step_id.as_ref()) {
            StagePosition::Dangling { .. } => None,
            _ => request.current_step_id,
        };
        return RepairPlan {
            status: request.status,
            current_step_id,
            stage_index: None,
            regenerate: Vec::new(),
            delete,
        };
    }

    let started = request.status != RequestStatus::Pending
        || approvals.iter().any(|a| workflow.contains_step(&a.step_id));
    if !started {
        return RepairPlan {
            status: RequestStatus::Pending,
            current_step_id: None,
            stage_index: None,
            regenerate: Vec::new(),
            delete,
        };
    }

    let mut derived: Option<(RequestStatus, usize)> = None;
    for (index, stage) in stages.iter().enumerate() {
        if stage.has_rejection(approvals) {
            derived = Some((RequestStatus::Rejected, index));
            break;
        }
        if !stage.is_cleared(approvals) {
            derived = Some((RequestStatus::InProgress, index));
            break;
        }
    }

    let Some((status, index)) = derived else {
        return RepairPlan {
            status: RequestStatus::Completed,
            current_step_id: None,
            stage_index: None,
            regenerate: Vec::new(),
            delete,
        };
    };

    let already: HashSet<ApprovalId> = delete.iter().copied().collect();
    delete.extend(
        future_pending(stages, Some(index), approvals)
            .map(|a| a.id)
            .filter(|id| !already.contains(id)),
    );

    let regenerate = if status == RequestStatus::InProgress {
        stages[index]
            .steps
            .iter()
            .filter(|step| !approvals.iter().any(|a| a.step_id == step.id))
            .map(|step| step.id)
            .collect()
    } else {
        Vec::new()
    };

    RepairPlan {
        status,
        current_step_id: keep_or_representative(index),
        stage_index: Some(index),
        regenerate,
        delete,
    }
}

/// Detects and repairs inconsistencies between a request's cached state
/// and its approval history
#[derive(Clone)]
pub struct DiagnosticsEngine {
    services: Services,
}

impl DiagnosticsEngine {
    pub(crate) fn from_services(services: Services) -> Self {
        Self { services }
    }

    /// Report every inconsistency of a request. Inconsistent data is the
    /// expected output here, never an error.
    pub async fn diagnose(&self, request_id: RequestId) -> Result<DiagnosticReport> {
        let Loaded {
            snapshot,
            workflow,
            stages,
        } = self.services.load(&request_id).await?;
        let issues = inspect(&snapshot, &workflow, &stages);

        if !issues.is_empty() {
            tracing::warn!(
                request_id = %request_id,
                issue_count = issues.len(),
                "Request inconsistencies detected"
            );
        }

        Ok(DiagnosticReport {
            request_id,
            status: snapshot.request.status,
            issues,
        })
    }

    /// Rewrite pointer and status from the approval history. Running it on a
    /// consistent request performs no write.
    pub async fn fix(&self, request_id: RequestId) -> Result<RepairReport> {
        let _guard = self.services.locks.acquire(request_id).await;
        let report = retry_with(
            &self.services.retry,
            || self.try_fix(request_id),
            WorkflowError::is_conflict,
        )
        .await?;

        if report.changed {
            self.services
                .publish(vec![Event::new(
                    "request.repaired",
                    json!({
                        "request_id": request_id,
                        "status": report.request.status,
                        "actions": report.actions,
                    }),
                )])
                .await;
        }
        Ok(report)
    }

    async fn try_fix(&self, request_id: RequestId) -> Result<RepairReport> {
        let Loaded {
            snapshot,
            workflow,
            stages,
        } = self.services.load(&request_id).await?;
        let request = &snapshot.request;
        let plan = plan_repair(&snapshot, &workflow, &stages);

        if !plan.changes_anything(request) {
            tracing::debug!(request_id = %request_id, "Request already consistent");
            return Ok(RepairReport {
                changed: false,
                actions: Vec::new(),
                request: request.clone(),
            });
        }

        let mut actions = Vec::new();
        let mut changes = ChangeSet::new(request);

        if plan.status != request.status {
            actions.push(format!("status {} -> {}", request.status, plan.status));
            changes.request.status = plan.status;
        }
        if plan.current_step_id != request.current_step_id {
            actions.push(format!(
                "pointer {} -> {}",
                display_step(request.current_step_id),
                display_step(plan.current_step_id)
            ));
            changes.request.current_step_id = plan.current_step_id;
        }
        for id in &plan.delete {
            actions.push(format!("deleted orphaned approval {}", id));
        }
        changes.deleted = plan.delete.clone();

        if let Some(index) = plan.stage_index {
            let steps = stages[index]
                .steps
                .iter()
                .filter(|step| plan.regenerate.contains(&step.id));
            let rows = self.services.rows_for_steps(request, steps).await?;
            for row in &rows {
                actions.push(format!("created approval {} for step {}", row.id, row.step_id));
            }
            changes.inserted = rows;
        }

        self.services.store.commit(&changes).await?;

        tracing::info!(
            request_id = %request_id,
            status = %changes.request.status,
            action_count = actions.len(),
            "Request repaired"
        );

        Ok(RepairReport {
            changed: true,
            actions,
            request: changes.request,
        })
    }
}

fn display_step(step_id: Option<StepId>) -> String {
    step_id.map_or_else(|| "null".to_string(), |id| id.to_string())
}
