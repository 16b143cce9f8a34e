//! Approval gate: who may act on a request's current stage

use crate::request::{Approval, Request};
use crate::stages::Stage;
use crate::step::StepType;
use diwan_core::{RoleRef, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The acting user, with roles already resolved by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub roles: HashSet<RoleRef>,
    pub is_admin: bool,
}

impl Actor {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            roles: HashSet::new(),
            is_admin: false,
        }
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = RoleRef>) -> Self {
        self.roles.extend(roles);
        self
    }

    pub fn with_role(mut self, role: impl Into<RoleRef>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }

    pub fn has_role(&self, role: &RoleRef) -> bool {
        self.roles.contains(role)
    }
}

/// Pure predicates over loaded request state. Never fails: missing data
/// simply means "no".
#[derive(Debug, Clone, Copy, Default)]
pub struct ApprovalGate;

impl ApprovalGate {
    /// Whether `actor` may record a decision on the stage at `stage_index`
    pub fn can_act(
        request: &Request,
        approvals: &[Approval],
        stages: &[Stage],
        stage_index: Option<usize>,
        actor: &Actor,
    ) -> bool {
        if !request.status.is_live() {
            return false;
        }

        let Some(stage) = stage_index.and_then(|i| stages.get(i)) else {
            return false;
        };

        // Requesters never decide on their own request, admin or not.
        if actor.id == request.requester_id {
            tracing::debug!(
                request_id = %request.id,
                actor_id = %actor.id,
                "Requester cannot act on own request"
            );
            return false;
        }

        if actor.is_admin {
            return true;
        }

        let allowed = !Self::matching_rows(request, approvals, stage, actor).is_empty();
        tracing::debug!(
            request_id = %request.id,
            actor_id = %actor.id,
            stage_order = stage.order,
            allowed,
            "Approval gate evaluated"
        );
        allowed
    }

    /// Indices of the pending rows in `stage` that wait on `actor`
    pub fn matching_rows(
        request: &Request,
        approvals: &[Approval],
        stage: &Stage,
        actor: &Actor,
    ) -> Vec<usize> {
        approvals
            .iter()
            .enumerate()
            .filter(|(_, a)| {
                a.request_id == request.id
                    && a.is_pending()
                    && stage.contains(&a.step_id)
                    && a.assignment.matches(actor)
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Rows a decision by `actor` settles: the rows that wait on them, or,
    /// for an administrator with no decision row of their own, those rows
    /// plus every pending decision row of the stage.
    pub fn actionable_rows(
        request: &Request,
        approvals: &[Approval],
        stage: &Stage,
        actor: &Actor,
    ) -> Vec<usize> {
        let is_decision = |a: &Approval| {
            stage
                .step(&a.step_id)
                .is_some_and(|s| s.step_type == StepType::Decision)
        };

        let own = Self::matching_rows(request, approvals, stage, actor);
        if !actor.is_admin || own.iter().any(|&i| is_decision(&approvals[i])) {
            return own;
        }

        approvals
            .iter()
            .enumerate()
            .filter(|(i, a)| {
                own.contains(i) || (a.request_id == request.id && a.is_pending() && is_decision(*a))
            })
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Assignment, DecisionOutcome, RequestStatus};
    use crate::stages::build_stages;
    use crate::step::{Approver, WorkflowStep};
    use diwan_core::WorkflowId;

    struct Fixture {
        request: Request,
        stages: Vec<Stage>,
        approvals: Vec<Approval>,
        approver: UserId,
    }

    fn fixture() -> Fixture {
        let wf = WorkflowId::new();
        let approver = UserId::new();
        let direct = WorkflowStep::new(wf, 1, "Manager", StepType::Decision, Approver::User(approver));
        let role = WorkflowStep::new(
            wf,
            1,
            "Finance",
            StepType::Decision,
            Approver::Role(RoleRef::from("finance")),
        );
        let stages = build_stages(&[direct.clone(), role.clone()]);

        let mut request = Request::new(wf, UserId::new(), serde_json::json!({}));
        request.status = RequestStatus::InProgress;
        request.current_step_id = Some(direct.id);

        let mut approvals = Approval::for_step(request.id, &direct, &[]);
        approvals.extend(Approval::for_step(request.id, &role, &[]));

        Fixture {
            request,
            stages,
            approvals,
            approver,
        }
    }

    #[test]
    fn test_direct_approver_can_act() {
        let f = fixture();
        let actor = Actor::new(f.approver);
        assert!(ApprovalGate::can_act(&f.request, &f.approvals, &f.stages, Some(0), &actor));
    }

    #[test]
    fn test_role_holder_can_act() {
        let f = fixture();
        let actor = Actor::new(UserId::new()).with_role("finance");
        assert!(ApprovalGate::can_act(&f.request, &f.approvals, &f.stages, Some(0), &actor));
    }

    #[test]
    fn test_stranger_cannot_act() {
        let f = fixture();
        let actor = Actor::new(UserId::new()).with_role("hr");
        assert!(!ApprovalGate::can_act(&f.request, &f.approvals, &f.stages, Some(0), &actor));
    }

    #[test]
    fn test_requester_cannot_act_even_as_admin() {
        let mut f = fixture();
        f.approvals[0].assignment = Assignment::Direct {
            approver_id: f.request.requester_id,
        };
        let requester = Actor::new(f.request.requester_id).with_role("finance");
        assert!(!ApprovalGate::can_act(&f.request, &f.approvals, &f.stages, Some(0), &requester));
        assert!(!ApprovalGate::can_act(
            &f.request,
            &f.approvals,
            &f.stages,
            Some(0),
            &requester.admin()
        ));
    }

    #[test]
    fn test_admin_override() {
        let f = fixture();
        let admin = Actor::new(UserId::new()).admin();

        assert!(ApprovalGate::can_act(&f.request, &f.approvals, &f.stages, Some(0), &admin));
        let rows = ApprovalGate::actionable_rows(&f.request, &f.approvals, &f.stages[0], &admin);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_admin_named_on_opinion_still_overrides_decisions() {
        let mut f = fixture();
        let admin = Actor::new(UserId::new()).admin();
        let peer = WorkflowStep::new(
            f.request.workflow_id,
            1,
            "Peer",
            StepType::Opinion,
            Approver::User(admin.id),
        );
        let mut steps = f.stages[0].steps.clone();
        steps.push(peer.clone());
        f.stages = build_stages(&steps);
        f.approvals.extend(Approval::for_step(f.request.id, &peer, &[]));

        let rows = ApprovalGate::actionable_rows(&f.request, &f.approvals, &f.stages[0], &admin);
        assert_eq!(rows, vec![0, 1, 2]);

        let named = Actor::new(f.approver).admin();
        let rows = ApprovalGate::actionable_rows(&f.request, &f.approvals, &f.stages[0], &named);
        assert_eq!(rows, vec![0]);
    }

    #[test]
    fn test_terminal_or_unresolved_requests_are_closed() {
        let mut f = fixture();
        let actor = Actor::new(f.approver);

        assert!(!ApprovalGate::can_act(&f.request, &f.approvals, &f.stages, None, &actor));
        assert!(!ApprovalGate::can_act(&f.request, &f.approvals, &f.stages, Some(4), &actor));

        f.request.status = RequestStatus::Completed;
        assert!(!ApprovalGate::can_act(&f.request, &f.approvals, &f.stages, Some(0), &actor.clone().admin()));
    }

    #[test]
    fn test_settled_rows_no_longer_match() {
        let mut f = fixture();
        let actor = Actor::new(f.approver);
        f.approvals[0].settle(DecisionOutcome::Approved, f.approver, None);

        assert!(!ApprovalGate::can_act(&f.request, &f.approvals, &f.stages, Some(0), &actor));
    }
}
