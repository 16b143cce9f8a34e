//! Request state machine
//!
//! Drives requests through their workflow's stages: submission, decisions,
//! auto-advance past non-blocking stages and completion. Every write is one
//! [`ChangeSet`] committed against the version that was read, under the
//! request's in-process lock, retried on conflict.

use crate::approval::{Actor, ApprovalGate};
use crate::diagnostics::DiagnosticsEngine;
use crate::identity::IdentityProvider;
use crate::lock::RequestLocks;
use crate::request::{Approval, DecisionOutcome, Request, RequestSnapshot, RequestStatus};
use crate::resolver::{RequestProgress, StagePosition};
use crate::retry::{retry_with, RetryConfig, RetryPolicy};
use crate::stages::{build_stages, next_blocking_stage, Stage};
use crate::step::{Approver, StepType, WorkflowDefinition, WorkflowStep};
use crate::store::{ApprovalStore, ChangeSet};
use crate::{Result, WorkflowError};
use diwan_core::{ApprovalId, Event, EventPublisher, RequestId, UserId, WorkflowConfig, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// An approver's decision on the current stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub outcome: DecisionOutcome,
    #[serde(default)]
    pub comments: Option<String>,
    /// Stage the caller believes is current. A mismatch means the caller
    /// acted on a stale view and the decision is refused.
    #[serde(default)]
    pub stage_order: Option<i32>,
}

impl Decision {
    pub fn approve() -> Self {
        Self {
            outcome: DecisionOutcome::Approved,
            comments: None,
            stage_order: None,
        }
    }

    pub fn reject() -> Self {
        Self {
            outcome: DecisionOutcome::Rejected,
            ..Self::approve()
        }
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    pub fn at_stage(mut self, order: i32) -> Self {
        self.stage_order = Some(order);
        self
    }
}

/// What a recorded decision did to the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    /// Rows settled, stage still waiting on others
    Recorded,
    /// Stage cleared, pointer moved to the next blocking stage
    Advanced { from_order: i32, to_order: i32 },
    /// Last blocking stage cleared
    Completed,
    /// A decision step was rejected
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionReceipt {
    pub request: Request,
    pub transition: Transition,
    /// Rows settled by this decision
    pub settled: Vec<ApprovalId>,
}

/// A request loaded together with its workflow
pub(crate) struct Loaded {
    pub snapshot: RequestSnapshot,
    pub workflow: WorkflowDefinition,
    pub stages: Vec<Stage>,
}

/// Collaborators shared by the state machine and the diagnostics engine
#[derive(Clone)]
pub(crate) struct Services {
    pub store: Arc<dyn ApprovalStore>,
    pub directory: Arc<dyn IdentityProvider>,
    pub publisher: Arc<dyn EventPublisher>,
    pub retry: RetryPolicy,
    pub locks: Arc<RequestLocks>,
}

impl Services {
    pub async fn load(&self, request_id: &RequestId) -> Result<Loaded> {
        let snapshot = self
            .store
            .load_request(request_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("request {}", request_id)))?;
        let workflow = self.load_workflow(&snapshot.request.workflow_id).await?;
        let stages = build_stages(&workflow.steps);

        Ok(Loaded {
            snapshot,
            workflow,
            stages,
        })
    }

    pub async fn load_workflow(&self, workflow_id: &WorkflowId) -> Result<WorkflowDefinition> {
        self.store
            .load_workflow(workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow {}", workflow_id)))
    }

    /// Fresh pending rows for `steps`, binding role steps to their current
    /// holders. The requester is never bound as an approver of their own
    /// request.
    pub async fn rows_for_steps<'a>(
        &self,
        request: &Request,
        steps: impl IntoIterator<Item = &'a WorkflowStep>,
    ) -> Result<Vec<Approval>> {
        let mut rows = Vec::new();
        for step in steps {
            let holders: Vec<UserId> = match &step.approver {
                Approver::User(_) => Vec::new(),
                Approver::Role(role) => self
                    .directory
                    .role_holders(role)
                    .await?
                    .into_iter()
                    .filter(|holder| *holder != request.requester_id)
                    .collect(),
            };
            rows.extend(Approval::for_step(request.id, step, &holders));
        }
        Ok(rows)
    }

    /// Move the request to the first blocking stage at or after `from`,
    /// creating its rows, or complete it when none remains. Returns the
    /// index of the stage entered.
    pub async fn enter_stage(
        &self,
        stages: &[Stage],
        from: usize,
        changes: &mut ChangeSet,
    ) -> Result<Option<usize>> {
        match next_blocking_stage(stages, from) {
            Some(index) => {
                let stage = &stages[index];
                let rows = self.rows_for_steps(&changes.request, &stage.steps).await?;
                changes.request.status = RequestStatus::InProgress;
                changes.request.current_step_id = Some(stage.representative().id);
                changes.inserted.extend(rows);
                Ok(Some(index))
            }
            None => {
                changes.request.status = RequestStatus::Completed;
                changes.request.current_step_id = None;
                Ok(None)
            }
        }
    }

    /// Publish after commit. Delivery failures never undo a transition.
    pub async fn publish(&self, events: Vec<Event>) {
        for event in events {
            if let Err(e) = self.publisher.publish(&event).await {
                tracing::warn!(
                    event_type = %event.event_type,
                    error = %e,
                    "Failed to publish workflow event"
                );
            }
        }
    }
}

/// Governs request status transitions and stage advancement
#[derive(Clone)]
pub struct RequestStateMachine {
    services: Services,
}

impl RequestStateMachine {
    /// Create a state machine with the default retry policy
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        directory: Arc<dyn IdentityProvider>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            services: Services {
                store,
                directory,
                publisher,
                retry: RetryPolicy::default(),
                locks: Arc::new(RequestLocks::new()),
            },
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.services.retry = retry;
        self
    }

    pub fn with_config(self, config: &WorkflowConfig) -> Self {
        self.with_retry_policy(RetryPolicy::new(RetryConfig::from(config)))
    }

    /// Diagnostics over the same store, sharing this machine's request locks
    pub fn diagnostics(&self) -> DiagnosticsEngine {
        DiagnosticsEngine::from_services(self.services.clone())
    }

    /// Validate and save a workflow definition
    pub async fn create_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        workflow.validate()?;
        if self.services.store.load_workflow(&workflow.id).await?.is_some() {
            return Err(WorkflowError::InvalidDefinition(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        self.services.store.save_workflow(workflow).await?;

        tracing::info!(
            workflow_id = %workflow.id,
            name = %workflow.name,
            step_count = workflow.steps.len(),
            "Workflow created"
        );
        Ok(())
    }

    /// Create a pending request against an existing workflow
    pub async fn open_request(
        &self,
        workflow_id: WorkflowId,
        requester_id: UserId,
        form_data: serde_json::Value,
    ) -> Result<Request> {
        self.services.load_workflow(&workflow_id).await?;

        let request = Request::new(workflow_id, requester_id, form_data);
        self.services.store.insert_request(&request).await?;

        tracing::info!(
            request_id = %request.id,
            workflow_id = %workflow_id,
            requester_id = %requester_id,
            "Request opened"
        );
        Ok(request)
    }

    /// Route a pending request into its first blocking stage. A workflow
    /// with no blocking stage completes immediately.
    pub async fn submit(&self, request_id: RequestId) -> Result<Request> {
        let _guard = self.services.locks.acquire(request_id).await;
        let (request, events) = retry_with(
            &self.services.retry,
            || self.try_submit(request_id),
            WorkflowError::is_conflict,
        )
        .await?;

        self.services.publish(events).await;
        Ok(request)
    }

    async fn try_submit(&self, request_id: RequestId) -> Result<(Request, Vec<Event>)> {
        let Loaded {
            snapshot, stages, ..
        } = self.services.load(&request_id).await?;
        let request = snapshot.request;

        if request.status != RequestStatus::Pending || request.current_step_id.is_some() {
            return Err(WorkflowError::InvalidState(format!(
                "request {} is {} and cannot be submitted",
                request.id, request.status
            )));
        }

        let mut changes = ChangeSet::new(&request);
        let entered = self.services.enter_stage(&stages, 0, &mut changes).await?;
        self.services.store.commit(&changes).await?;

        let mut events = vec![Event::new(
            "request.submitted",
            json!({
                "request_id": request.id,
                "workflow_id": request.workflow_id,
                "stage_order": entered.map(|i| stages[i].order),
            }),
        )];

        match entered {
            Some(index) => tracing::info!(
                request_id = %request.id,
                stage_order = stages[index].order,
                approvals = changes.inserted.len(),
                "Request submitted"
            ),
            None => {
                tracing::info!(request_id = %request.id, "Request submitted and completed without decisions");
                events.push(Event::new(
                    "request.completed",
                    json!({ "request_id": request.id }),
                ));
            }
        }

        Ok((changes.request, events))
    }

    /// Record `actor`'s decision on the request's current stage
    pub async fn record_decision(
        &self,
        request_id: RequestId,
        actor: &Actor,
        decision: Decision,
    ) -> Result<DecisionReceipt> {
        let _guard = self.services.locks.acquire(request_id).await;
        let (receipt, events) = retry_with(
            &self.services.retry,
            || self.try_record_decision(request_id, actor, &decision),
            WorkflowError::is_conflict,
        )
        .await?;

        self.services.publish(events).await;
        Ok(receipt)
    }

    async fn try_record_decision(
        &self,
        request_id: RequestId,
        actor: &Actor,
        decision: &Decision,
    ) -> Result<(DecisionReceipt, Vec<Event>)> {
        let Loaded {
            snapshot, stages, ..
        } = self.services.load(&request_id).await?;
        let request = &snapshot.request;

        if request.status.is_terminal() {
            return Err(WorkflowError::InvalidState(format!(
                "request {} is {}",
                request.id, request.status
            )));
        }

        let index = match StagePosition::resolve(&stages, request.current_step_id.as_ref()) {
            StagePosition::At { index } => index,
            StagePosition::NotStarted => {
                return Err(WorkflowError::InvalidState(format!(
                    "request {} has not been submitted",
                    request.id
                )))
            }
            StagePosition::Dangling { step_id } => {
                return Err(WorkflowError::Inconsistent(format!(
                    "current step {} of request {} is not part of workflow {}",
                    step_id, request.id, request.workflow_id
                )))
            }
        };
        let stage = &stages[index];

        if let Some(order) = decision.stage_order {
            if order != stage.order {
                return Err(WorkflowError::InvalidState(format!(
                    "request {} is at stage {}, not {}",
                    request.id, stage.order, order
                )));
            }
        }

        if !ApprovalGate::can_act(request, &snapshot.approvals, &stages, Some(index), actor) {
            tracing::warn!(
                request_id = %request.id,
                actor_id = %actor.id,
                stage_order = stage.order,
                "Decision refused by approval gate"
            );
            return Err(WorkflowError::Forbidden);
        }

        let rows = ApprovalGate::actionable_rows(request, &snapshot.approvals, stage, actor);
        if rows.is_empty() {
            return Err(WorkflowError::InvalidState(format!(
                "no pending approvals in stage {} of request {}",
                stage.order, request.id
            )));
        }

        let mut approvals = snapshot.approvals.clone();
        let mut changes = ChangeSet::new(request);
        let mut rejects_decision = false;
        for i in rows {
            let row = &mut approvals[i];
            row.settle(decision.outcome, actor.id, decision.comments.clone());
            let is_decision = stage
                .step(&row.step_id)
                .is_some_and(|s| s.step_type == StepType::Decision);
            rejects_decision |= is_decision && decision.outcome == DecisionOutcome::Rejected;
            changes.updated.push(row.clone());
        }
        let settled: Vec<ApprovalId> = changes.updated.iter().map(|a| a.id).collect();

        let transition = if rejects_decision {
            changes.request.status = RequestStatus::Rejected;
            Transition::Rejected
        } else if stage.is_cleared(&approvals) {
            match self.services.enter_stage(&stages, index + 1, &mut changes).await? {
                Some(next) => Transition::Advanced {
                    from_order: stage.order,
                    to_order: stages[next].order,
                },
                None => Transition::Completed,
            }
        } else {
            changes.request.status = RequestStatus::InProgress;
            Transition::Recorded
        };

        self.services.store.commit(&changes).await?;

        tracing::info!(
            request_id = %request.id,
            actor_id = %actor.id,
            outcome = ?decision.outcome,
            stage_order = stage.order,
            settled = settled.len(),
            transition = ?transition,
            "Decision recorded"
        );

        let mut events = vec![Event::new(
            "request.decision_recorded",
            json!({
                "request_id": request.id,
                "actor_id": actor.id,
                "outcome": decision.outcome,
                "stage_order": stage.order,
                "approvals": settled,
            }),
        )];
        match transition {
            Transition::Recorded => {}
            Transition::Advanced {
                from_order,
                to_order,
            } => events.push(Event::new(
                "request.advanced",
                json!({ "request_id": request.id, "from_order": from_order, "to_order": to_order }),
            )),
            Transition::Completed => events.push(Event::new(
                "request.completed",
                json!({ "request_id": request.id }),
            )),
            Transition::Rejected => events.push(Event::new(
                "request.rejected",
                json!({ "request_id": request.id, "stage_order": stage.order, "actor_id": actor.id }),
            )),
        }

        Ok((
            DecisionReceipt {
                request: changes.request,
                transition,
                settled,
            },
            events,
        ))
    }

    /// Whether `actor` may act on the request right now
    pub async fn can_act(&self, request_id: RequestId, actor: &Actor) -> Result<bool> {
        let Loaded {
            snapshot, stages, ..
        } = self.services.load(&request_id).await?;
        let index = StagePosition::resolve(&stages, snapshot.request.current_step_id.as_ref()).index();

        Ok(ApprovalGate::can_act(
            &snapshot.request,
            &snapshot.approvals,
            &stages,
            index,
            actor,
        ))
    }

    pub async fn progress(&self, request_id: RequestId) -> Result<RequestProgress> {
        let Loaded {
            snapshot, stages, ..
        } = self.services.load(&request_id).await?;
        let request = &snapshot.request;

        Ok(RequestProgress::compute(
            &stages,
            request.current_step_id.as_ref(),
            request.status,
        ))
    }

    /// Load a request with its approval rows
    pub async fn snapshot(&self, request_id: RequestId) -> Result<RequestSnapshot> {
        Ok(self.services.load(&request_id).await?.snapshot)
    }

    pub async fn workflow(&self, workflow_id: &WorkflowId) -> Result<WorkflowDefinition> {
        self.services.load_workflow(workflow_id).await
    }

    /// Resolve a user through the identity provider
    pub async fn actor(&self, user_id: &UserId) -> Result<Actor> {
        Ok(self.services.directory.resolve_actor(user_id).await?)
    }
}
