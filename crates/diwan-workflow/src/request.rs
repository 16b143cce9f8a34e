//! Requests and their approval rows

use crate::approval::Actor;
use crate::step::{Approver, ApproverType, WorkflowStep};
use chrono::{DateTime, Utc};
use diwan_core::{ApprovalId, RequestId, RoleRef, StepId, UserId, WorkflowId};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Created, not yet submitted
    Pending,
    /// Routed through the workflow, stages remain
    InProgress,
    /// Every blocking stage cleared
    Completed,
    /// A decision approver rejected
    Rejected,
    /// Cancelled by an external actor
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "in_progress" => Some(RequestStatus::InProgress),
            "completed" => Some(RequestStatus::Completed),
            "rejected" => Some(RequestStatus::Rejected),
            "cancelled" => Some(RequestStatus::Cancelled),
            _ => None,
        }
    }

    /// Requests that can still be acted on
    pub fn is_live(&self) -> bool {
        matches!(self, RequestStatus::Pending | RequestStatus::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request routed through a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub workflow_id: WorkflowId,
    /// Representative step of the current stage. Only stage membership is
    /// meaningful; terminal requests keep the last value for audit.
    pub current_step_id: Option<StepId>,
    pub status: RequestStatus,
    pub requester_id: UserId,
    #[serde(default)]
    pub form_data: serde_json::Value,
    /// Optimistic concurrency counter, bumped on every committed write
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    /// Create a pending request
    pub fn new(workflow_id: WorkflowId, requester_id: UserId, form_data: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: RequestId::new(),
            workflow_id,
            current_step_id: None,
            status: RequestStatus::Pending,
            requester_id,
            form_data,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self
    }
}

/// State of one approval row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome an approver records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approved,
    Rejected,
}

impl From<DecisionOutcome> for ApprovalStatus {
    fn from(outcome: DecisionOutcome) -> Self {
        match outcome {
            DecisionOutcome::Approved => ApprovalStatus::Approved,
            DecisionOutcome::Rejected => ApprovalStatus::Rejected,
        }
    }
}

/// Who an approval row is assigned to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "assignment_type", rename_all = "snake_case")]
pub enum Assignment {
    Direct {
        approver_id: UserId,
    },
    /// `approver_id` is the holder resolved when the stage was entered;
    /// `None` is an open row any current holder may settle.
    Role {
        role: RoleRef,
        approver_id: Option<UserId>,
    },
}

impl Assignment {
    pub fn assignment_type(&self) -> ApproverType {
        match self {
            Assignment::Direct { .. } => ApproverType::Direct,
            Assignment::Role { .. } => ApproverType::Role,
        }
    }

    pub fn approver_id(&self) -> Option<UserId> {
        match self {
            Assignment::Direct { approver_id } => Some(*approver_id),
            Assignment::Role { approver_id, .. } => *approver_id,
        }
    }

    pub fn role(&self) -> Option<&RoleRef> {
        match self {
            Assignment::Direct { .. } => None,
            Assignment::Role { role, .. } => Some(role),
        }
    }

    /// Whether `actor` is the party this row waits on
    pub fn matches(&self, actor: &Actor) -> bool {
        match self {
            Assignment::Direct { approver_id } => *approver_id == actor.id,
            Assignment::Role { role, approver_id } => {
                actor.has_role(role) && approver_id.map_or(true, |id| id == actor.id)
            }
        }
    }
}

/// One approval row required to clear a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub request_id: RequestId,
    pub step_id: StepId,
    pub assignment: Assignment,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub comments: Option<String>,
    /// User who settled the row
    #[serde(default)]
    pub acted_by: Option<UserId>,
    #[serde(default)]
    pub responded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Approval {
    /// Create a pending row
    pub fn pending(request_id: RequestId, step_id: StepId, assignment: Assignment) -> Self {
        Self {
            id: ApprovalId::new(),
            request_id,
            step_id,
            assignment,
            status: ApprovalStatus::Pending,
            comments: None,
            acted_by: None,
            responded_at: None,
            created_at: Utc::now(),
        }
    }

    /// Create the pending rows for `step`. Role steps bind one row per
    /// holder in `holders`; with no holders a single open row is created so
    /// the stage cannot clear vacuously.
    pub fn for_step(request_id: RequestId, step: &WorkflowStep, holders: &[UserId]) -> Vec<Self> {
        match &step.approver {
            Approver::User(user_id) => vec![Self::pending(
                request_id,
                step.id,
                Assignment::Direct {
                    approver_id: *user_id,
                },
            )],
            Approver::Role(role) if holders.is_empty() => vec![Self::pending(
                request_id,
                step.id,
                Assignment::Role {
                    role: role.clone(),
                    approver_id: None,
                },
            )],
            Approver::Role(role) => holders
                .iter()
                .map(|holder| {
                    Self::pending(
                        request_id,
                        step.id,
                        Assignment::Role {
                            role: role.clone(),
                            approver_id: Some(*holder),
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    /// Settle the row. Rows move out of `Pending` exactly once.
    pub fn settle(
        &mut self,
        outcome: DecisionOutcome,
        actor: UserId,
        comments: Option<String>,
    ) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = outcome.into();
        self.acted_by = Some(actor);
        self.comments = comments;
        self.responded_at = Some(Utc::now());
        true
    }
}

/// A request together with every approval row it owns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub request: Request,
    pub approvals: Vec<Approval>,
}

impl RequestSnapshot {
    pub fn approvals_for<'a>(&'a self, step_id: &'a StepId) -> impl Iterator<Item = &'a Approval> {
        self.approvals.iter().filter(move |a| &a.step_id == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepType;
    use std::collections::HashSet;

    fn actor(id: UserId, roles: &[&str]) -> Actor {
        Actor::new(id).with_roles(roles.iter().map(|r| RoleRef::from(*r)))
    }

    #[test]
    fn test_status_helpers() {
        assert!(RequestStatus::Pending.is_live());
        assert!(RequestStatus::InProgress.is_live());
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Rejected.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());
        assert_eq!(RequestStatus::parse("in_progress"), Some(RequestStatus::InProgress));
        assert_eq!(RequestStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn test_direct_assignment_matches_only_named_user() {
        let user = UserId::new();
        let assignment = Assignment::Direct { approver_id: user };

        assert!(assignment.matches(&actor(user, &[])));
        assert!(!assignment.matches(&actor(UserId::new(), &[])));
    }

    #[test]
    fn test_role_assignment_matching() {
        let holder = UserId::new();
        let bound = Assignment::Role {
            role: RoleRef::from("finance"),
            approver_id: Some(holder),
        };
        let open = Assignment::Role {
            role: RoleRef::from("finance"),
            approver_id: None,
        };

        assert!(bound.matches(&actor(holder, &["finance"])));
        assert!(!bound.matches(&actor(holder, &["hr"])));
        assert!(!bound.matches(&actor(UserId::new(), &["finance"])));
        assert!(open.matches(&actor(UserId::new(), &["finance"])));
        assert!(!open.matches(&actor(UserId::new(), &[])));
    }

    #[test]
    fn test_rows_for_role_step() {
        let step = WorkflowStep::new(
            WorkflowId::new(),
            1,
            "Finance",
            StepType::Decision,
            Approver::Role(RoleRef::from("finance")),
        );
        let request_id = RequestId::new();
        let holders = vec![UserId::new(), UserId::new()];

        let rows = Approval::for_step(request_id, &step, &holders);
        assert_eq!(rows.len(), 2);
        let bound: HashSet<_> = rows.iter().filter_map(|r| r.assignment.approver_id()).collect();
        assert_eq!(bound, holders.iter().copied().collect());

        let open = Approval::for_step(request_id, &step, &[]);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].assignment.approver_id(), None);
        assert_eq!(open[0].assignment.assignment_type(), ApproverType::Role);
    }

    #[test]
    fn test_settle_only_once() {
        let mut row = Approval::pending(
            RequestId::new(),
            StepId::new(),
            Assignment::Direct {
                approver_id: UserId::new(),
            },
        );
        let by = UserId::new();

        assert!(row.settle(DecisionOutcome::Approved, by, Some("ok".to_string())));
        assert_eq!(row.status, ApprovalStatus::Approved);
        assert_eq!(row.acted_by, Some(by));
        assert!(row.responded_at.is_some());

        assert!(!row.settle(DecisionOutcome::Rejected, by, None));
        assert_eq!(row.status, ApprovalStatus::Approved);
    }
}
