//! Integration tests for the diwan-workflow crate.

use async_trait::async_trait;
use diwan_core::{
    Event, EventPublisher, InMemoryPublisher, PublishError, RequestId, RoleRef, StepId, UserId,
    WorkflowId,
};
use diwan_workflow::{
    Actor, ApprovalStatus, ApprovalStore, Approver, ChangeSet, Decision, InMemoryApprovalStore,
    IssueKind, Request, RequestSnapshot, RequestStateMachine, RequestStatus, RetryPolicy,
    StaticDirectory, StepType, StoreError, StoreResult, Transition, WorkflowDefinition,
    WorkflowError,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    machine: RequestStateMachine,
    store: Arc<InMemoryApprovalStore>,
    directory: Arc<StaticDirectory>,
    publisher: Arc<InMemoryPublisher>,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryApprovalStore::new());
    let directory = Arc::new(StaticDirectory::new());
    let publisher = Arc::new(InMemoryPublisher::new());
    let machine = RequestStateMachine::new(store.clone(), directory.clone(), publisher.clone());
    Harness {
        machine,
        store,
        directory,
        publisher,
    }
}

async fn open_and_submit(machine: &RequestStateMachine, workflow: &WorkflowDefinition) -> Request {
    machine.create_workflow(workflow).await.unwrap();
    let request = machine
        .open_request(workflow.id, UserId::new(), json!({"title": "Laptop purchase"}))
        .await
        .unwrap();
    machine.submit(request.id).await.unwrap()
}

/// Stage 1: two required decision approvers. Stage 2: one decision approver.
struct TwoStage {
    workflow: WorkflowDefinition,
    first: UserId,
    second: UserId,
    third: UserId,
    stage_one: [StepId; 2],
    stage_two: StepId,
}

fn two_stage_workflow() -> TwoStage {
    let (first, second, third) = (UserId::new(), UserId::new(), UserId::new());
    let mut workflow = WorkflowDefinition::new("Purchase", "Two-stage purchase approval");
    let a = workflow.push_step(1, "Manager", StepType::Decision, Approver::User(first));
    let b = workflow.push_step(1, "Department head", StepType::Decision, Approver::User(second));
    let c = workflow.push_step(2, "Finance", StepType::Decision, Approver::User(third));
    TwoStage {
        workflow,
        first,
        second,
        third,
        stage_one: [a, b],
        stage_two: c,
    }
}

// ==================== Scenario A ====================

#[tokio::test]
async fn test_scenario_a_parallel_stage_then_final_stage() {
    let h = harness();
    let wf = two_stage_workflow();

    let request = open_and_submit(&h.machine, &wf.workflow).await;
    assert_eq!(request.status, RequestStatus::InProgress);
    assert!(wf.stage_one.contains(&request.current_step_id.unwrap()));
    assert_eq!(h.machine.progress(request.id).await.unwrap().percent, 50);

    let receipt = h
        .machine
        .record_decision(request.id, &Actor::new(wf.first), Decision::approve())
        .await
        .unwrap();
    assert_eq!(receipt.transition, Transition::Recorded);
    assert_eq!(receipt.request.status, RequestStatus::InProgress);
    assert_eq!(receipt.request.current_step_id, request.current_step_id);

    let receipt = h
        .machine
        .record_decision(
            request.id,
            &Actor::new(wf.second),
            Decision::approve().at_stage(1),
        )
        .await
        .unwrap();
    assert_eq!(
        receipt.transition,
        Transition::Advanced {
            from_order: 1,
            to_order: 2
        }
    );
    assert_eq!(receipt.request.current_step_id, Some(wf.stage_two));

    let receipt = h
        .machine
        .record_decision(
            request.id,
            &Actor::new(wf.third),
            Decision::approve().with_comments("within budget"),
        )
        .await
        .unwrap();
    assert_eq!(receipt.transition, Transition::Completed);
    assert_eq!(receipt.request.status, RequestStatus::Completed);
    assert_eq!(receipt.request.current_step_id, None);

    let progress = h.machine.progress(request.id).await.unwrap();
    assert_eq!(progress.percent, 100);

    assert_eq!(
        h.publisher.event_types(),
        vec![
            "request.submitted",
            "request.decision_recorded",
            "request.decision_recorded",
            "request.advanced",
            "request.decision_recorded",
            "request.completed",
        ]
    );

    let report = h.machine.diagnostics().diagnose(request.id).await.unwrap();
    assert!(report.is_consistent(), "{:?}", report.issues);
}

// ==================== Scenario B ====================

#[tokio::test]
async fn test_scenario_b_rejection_stops_the_request() {
    let h = harness();
    let wf = two_stage_workflow();

    let request = open_and_submit(&h.machine, &wf.workflow).await;
    let receipt = h
        .machine
        .record_decision(
            request.id,
            &Actor::new(wf.first),
            Decision::reject().with_comments("not needed"),
        )
        .await
        .unwrap();

    assert_eq!(receipt.transition, Transition::Rejected);
    assert_eq!(receipt.request.status, RequestStatus::Rejected);
    assert_eq!(receipt.request.current_step_id, request.current_step_id);

    let snapshot = h.machine.snapshot(request.id).await.unwrap();
    assert!(snapshot.approvals_for(&wf.stage_two).next().is_none());
    assert_eq!(snapshot.approvals.len(), 2);

    let progress = h.machine.progress(request.id).await.unwrap();
    assert_eq!(progress.percent, 50);

    assert!(matches!(
        h.machine
            .record_decision(request.id, &Actor::new(wf.second), Decision::approve())
            .await,
        Err(WorkflowError::InvalidState(_))
    ));

    let report = h.machine.diagnostics().diagnose(request.id).await.unwrap();
    assert!(report.is_consistent(), "{:?}", report.issues);
}

// ==================== Scenario C ====================

#[tokio::test]
async fn test_scenario_c_opinion_never_blocks() {
    let h = harness();
    let (advisor, decider, last) = (UserId::new(), UserId::new(), UserId::new());
    let mut workflow = WorkflowDefinition::new("Contract", "");
    workflow.push_step(1, "Legal opinion", StepType::Opinion, Approver::User(advisor));
    workflow.push_step(1, "Director", StepType::Decision, Approver::User(decider));
    let final_step = workflow.push_step(2, "CEO", StepType::Decision, Approver::User(last));

    let request = open_and_submit(&h.machine, &workflow).await;
    assert_eq!(h.machine.snapshot(request.id).await.unwrap().approvals.len(), 2);

    // A negative opinion is recorded but neither rejects nor advances.
    let receipt = h
        .machine
        .record_decision(
            request.id,
            &Actor::new(advisor),
            Decision::reject().with_comments("clause 4 is risky"),
        )
        .await
        .unwrap();
    assert_eq!(receipt.transition, Transition::Recorded);
    assert_eq!(receipt.request.status, RequestStatus::InProgress);

    let receipt = h
        .machine
        .record_decision(request.id, &Actor::new(decider), Decision::approve())
        .await
        .unwrap();
    assert_eq!(receipt.request.current_step_id, Some(final_step));

    let snapshot = h.machine.snapshot(request.id).await.unwrap();
    let opinion_rows: Vec<_> = snapshot
        .approvals
        .iter()
        .filter(|a| a.assignment.approver_id() == Some(advisor))
        .collect();
    assert_eq!(opinion_rows.len(), 1);
    assert_eq!(opinion_rows[0].status, ApprovalStatus::Rejected);
}

#[tokio::test]
async fn test_scenario_c_decision_alone_clears_stage() {
    let h = harness();
    let (advisor, decider) = (UserId::new(), UserId::new());
    let mut workflow = WorkflowDefinition::new("Contract", "");
    workflow.push_step(1, "Legal opinion", StepType::Opinion, Approver::User(advisor));
    workflow.push_step(1, "Director", StepType::Decision, Approver::User(decider));
    workflow.push_step(2, "CEO", StepType::Decision, Approver::User(UserId::new()));

    let request = open_and_submit(&h.machine, &workflow).await;
    let receipt = h
        .machine
        .record_decision(request.id, &Actor::new(decider), Decision::approve())
        .await
        .unwrap();

    assert!(matches!(receipt.transition, Transition::Advanced { .. }));
    assert!(!h.machine.can_act(request.id, &Actor::new(advisor)).await.unwrap());

    let report = h.machine.diagnostics().diagnose(request.id).await.unwrap();
    assert!(report.is_consistent(), "{:?}", report.issues);
}

// ==================== Scenario D ====================

#[tokio::test]
async fn test_scenario_d_foreign_pointer_diagnosed_and_fixed() {
    let h = harness();
    let wf = two_stage_workflow();
    let request = open_and_submit(&h.machine, &wf.workflow).await;

    let mut other = WorkflowDefinition::new("Leave", "");
    let foreign = other.push_step(1, "HR", StepType::Decision, Approver::User(UserId::new()));
    h.machine.create_workflow(&other).await.unwrap();

    let mut damaged = h.machine.snapshot(request.id).await.unwrap().request;
    damaged.current_step_id = Some(foreign);
    h.store.overwrite_request(damaged).await;

    let diagnostics = h.machine.diagnostics();
    let report = diagnostics.diagnose(request.id).await.unwrap();
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].kind, IssueKind::ForeignPointer);
    assert!(matches!(
        report.clone().into_result(),
        Err(WorkflowError::Inconsistent(_))
    ));

    let repaired = diagnostics.fix(request.id).await.unwrap();
    assert!(repaired.changed);
    assert_eq!(repaired.request.status, RequestStatus::InProgress);
    assert!(wf.stage_one.contains(&repaired.request.current_step_id.unwrap()));

    assert!(diagnostics.diagnose(request.id).await.unwrap().is_consistent());
    assert!(h.publisher.event_types().contains(&"request.repaired".to_string()));

    // The repaired request is usable again.
    h.machine
        .record_decision(request.id, &Actor::new(wf.first), Decision::approve())
        .await
        .unwrap();
}

// ==================== Auto-completion ====================

#[tokio::test]
async fn test_opinion_only_workflow_completes_on_submit() {
    let h = harness();
    let mut workflow = WorkflowDefinition::new("Feedback", "");
    workflow.push_step(1, "Peer review", StepType::Opinion, Approver::User(UserId::new()));
    workflow.push_step(2, "Team review", StepType::Opinion, Approver::Role(RoleRef::from("team")));

    let request = open_and_submit(&h.machine, &workflow).await;

    assert_eq!(request.status, RequestStatus::Completed);
    assert_eq!(request.current_step_id, None);
    assert!(h.machine.snapshot(request.id).await.unwrap().approvals.is_empty());
    assert_eq!(h.machine.progress(request.id).await.unwrap().percent, 100);
}

#[tokio::test]
async fn test_leading_opinion_stages_are_skipped() {
    let h = harness();
    let decider = UserId::new();
    let mut workflow = WorkflowDefinition::new("Hiring", "");
    workflow.push_step(1, "Panel notes", StepType::Opinion, Approver::User(UserId::new()));
    workflow.push_step(2, "Optional check", StepType::Decision, Approver::User(UserId::new()));
    let real = workflow.push_step(3, "Hiring manager", StepType::Decision, Approver::User(decider));
    workflow.steps[1].is_required = false;

    let request = open_and_submit(&h.machine, &workflow).await;

    assert_eq!(request.status, RequestStatus::InProgress);
    assert_eq!(request.current_step_id, Some(real));
    let snapshot = h.machine.snapshot(request.id).await.unwrap();
    assert_eq!(snapshot.approvals.len(), 1);
    assert_eq!(snapshot.approvals[0].step_id, real);
}

#[tokio::test]
async fn test_trailing_opinion_stage_completes_after_last_decision() {
    let h = harness();
    let decider = UserId::new();
    let mut workflow = WorkflowDefinition::new("Hiring", "");
    workflow.push_step(1, "Hiring manager", StepType::Decision, Approver::User(decider));
    workflow.push_step(2, "Announcement notes", StepType::Opinion, Approver::User(UserId::new()));

    let request = open_and_submit(&h.machine, &workflow).await;
    let receipt = h
        .machine
        .record_decision(request.id, &Actor::new(decider), Decision::approve())
        .await
        .unwrap();

    assert_eq!(receipt.transition, Transition::Completed);
    assert_eq!(h.machine.snapshot(request.id).await.unwrap().approvals.len(), 1);
}

// ==================== Role approvers ====================

#[tokio::test]
async fn test_role_stage_needs_every_bound_holder() {
    let h = harness();
    let (alice, bob) = (UserId::new(), UserId::new());
    h.directory.grant(alice, "finance");
    h.directory.grant(bob, "finance");

    let mut workflow = WorkflowDefinition::new("Expense", "");
    workflow.push_step(1, "Finance", StepType::Decision, Approver::Role(RoleRef::from("finance")));
    let request = open_and_submit(&h.machine, &workflow).await;

    let alice_actor = h.machine.actor(&alice).await.unwrap();
    let receipt = h
        .machine
        .record_decision(request.id, &alice_actor, Decision::approve())
        .await
        .unwrap();
    assert_eq!(receipt.transition, Transition::Recorded);
    assert_eq!(receipt.settled.len(), 1);

    // Alice's own row is settled; nothing else waits on her.
    assert!(!h.machine.can_act(request.id, &alice_actor).await.unwrap());

    let bob_actor = h.machine.actor(&bob).await.unwrap();
    let receipt = h
        .machine
        .record_decision(request.id, &bob_actor, Decision::approve())
        .await
        .unwrap();
    assert_eq!(receipt.transition, Transition::Completed);
}

#[tokio::test]
async fn test_revoked_holder_loses_access() {
    let h = harness();
    let alice = UserId::new();
    h.directory.grant(alice, "finance");

    let mut workflow = WorkflowDefinition::new("Expense", "");
    workflow.push_step(1, "Finance", StepType::Decision, Approver::Role(RoleRef::from("finance")));
    let request = open_and_submit(&h.machine, &workflow).await;

    h.directory.revoke(&alice, &RoleRef::from("finance"));
    let actor = h.machine.actor(&alice).await.unwrap();
    assert!(matches!(
        h.machine.record_decision(request.id, &actor, Decision::approve()).await,
        Err(WorkflowError::Forbidden)
    ));
}

// ==================== Repair ====================

#[tokio::test]
async fn test_fix_is_idempotent() {
    let h = harness();
    let wf = two_stage_workflow();
    let request = open_and_submit(&h.machine, &wf.workflow).await;

    // Settle stage one behind the state machine's back so the request stalls.
    let mut snapshot = h.machine.snapshot(request.id).await.unwrap();
    for row in snapshot.approvals.iter_mut() {
        row.settle(diwan_workflow::DecisionOutcome::Approved, wf.first, None);
    }
    h.store
        .overwrite_approvals(&request.id, snapshot.approvals.clone())
        .await;

    let diagnostics = h.machine.diagnostics();
    let report = diagnostics.diagnose(request.id).await.unwrap();
    assert_eq!(report.issues[0].kind, IssueKind::StalledStage);

    let first = diagnostics.fix(request.id).await.unwrap();
    assert!(first.changed);
    assert_eq!(first.request.current_step_id, Some(wf.stage_two));

    let before = h.machine.snapshot(request.id).await.unwrap();
    let second = diagnostics.fix(request.id).await.unwrap();
    assert!(!second.changed);
    assert!(second.actions.is_empty());
    assert_eq!(h.machine.snapshot(request.id).await.unwrap(), before);
    assert!(diagnostics.diagnose(request.id).await.unwrap().is_consistent());

    h.machine
        .record_decision(request.id, &Actor::new(wf.third), Decision::approve())
        .await
        .unwrap();
    assert_eq!(
        h.machine.progress(request.id).await.unwrap().status,
        RequestStatus::Completed
    );
}

#[tokio::test]
async fn test_fix_on_consistent_request_does_not_write() {
    let h = harness();
    let wf = two_stage_workflow();
    let request = open_and_submit(&h.machine, &wf.workflow).await;

    let report = h.machine.diagnostics().fix(request.id).await.unwrap();
    assert!(!report.changed);
    assert_eq!(report.request.version, request.version);
}

// ==================== Concurrency ====================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_approvers_advance_once() {
    for _ in 0..20 {
        let h = harness();
        let wf = two_stage_workflow();
        let request = open_and_submit(&h.machine, &wf.workflow).await;

        let tasks: Vec<_> = [wf.first, wf.second]
            .into_iter()
            .map(|user| {
                let machine = h.machine.clone();
                tokio::spawn(async move {
                    machine
                        .record_decision(request.id, &Actor::new(user), Decision::approve())
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let snapshot = h.machine.snapshot(request.id).await.unwrap();
        assert_eq!(snapshot.request.current_step_id, Some(wf.stage_two));
        assert_eq!(snapshot.approvals_for(&wf.stage_two).count(), 1);
        let advanced = h
            .publisher
            .event_types()
            .into_iter()
            .filter(|t| t == "request.advanced")
            .count();
        assert_eq!(advanced, 1);
    }
}

/// Store whose first `failures` commits lose a version race
struct RacyStore {
    inner: InMemoryApprovalStore,
    failures: AtomicU32,
}

#[async_trait]
impl ApprovalStore for RacyStore {
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> StoreResult<()> {
        self.inner.save_workflow(workflow).await
    }

    async fn load_workflow(&self, workflow_id: &WorkflowId) -> StoreResult<Option<WorkflowDefinition>> {
        self.inner.load_workflow(workflow_id).await
    }

    async fn insert_request(&self, request: &Request) -> StoreResult<()> {
        self.inner.insert_request(request).await
    }

    async fn load_request(&self, request_id: &RequestId) -> StoreResult<Option<RequestSnapshot>> {
        self.inner.load_request(request_id).await
    }

    async fn commit(&self, changes: &ChangeSet) -> StoreResult<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Conflict {
                request_id: changes.request_id(),
                expected: changes.expected_version,
                actual: changes.expected_version + 1,
            });
        }
        self.inner.commit(changes).await
    }
}

fn racy_machine(failures: u32, retries: u32) -> (RequestStateMachine, Arc<RacyStore>) {
    let store = Arc::new(RacyStore {
        inner: InMemoryApprovalStore::new(),
        failures: AtomicU32::new(failures),
    });
    let machine = RequestStateMachine::new(
        store.clone(),
        Arc::new(StaticDirectory::new()),
        Arc::new(InMemoryPublisher::new()),
    )
    .with_retry_policy(RetryPolicy::fixed(retries, Duration::from_millis(1)));
    (machine, store)
}

#[tokio::test]
async fn test_conflicts_are_retried() {
    let (machine, _store) = racy_machine(2, 3);
    let mut workflow = WorkflowDefinition::new("Purchase", "");
    workflow.push_step(1, "Manager", StepType::Decision, Approver::User(UserId::new()));

    let request = open_and_submit(&machine, &workflow).await;
    assert_eq!(request.status, RequestStatus::InProgress);
}

#[tokio::test]
async fn test_exhausted_retries_surface_conflict() {
    let (machine, store) = racy_machine(0, 1);
    let mut workflow = WorkflowDefinition::new("Purchase", "");
    workflow.push_step(1, "Manager", StepType::Decision, Approver::User(UserId::new()));
    machine.create_workflow(&workflow).await.unwrap();
    let request = machine
        .open_request(workflow.id, UserId::new(), json!({}))
        .await
        .unwrap();

    store.failures.store(5, Ordering::SeqCst);
    let err = machine.submit(request.id).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(store.failures.load(Ordering::SeqCst), 3);
}

// ==================== Notifications ====================

struct BrokenPublisher;

#[async_trait]
impl EventPublisher for BrokenPublisher {
    async fn publish(&self, event: &Event) -> Result<(), PublishError> {
        Err(PublishError {
            event_type: event.event_type.clone(),
            reason: "sink unavailable".into(),
        })
    }
}

#[tokio::test]
async fn test_publish_failure_keeps_transition() {
    let store = Arc::new(InMemoryApprovalStore::new());
    let machine = RequestStateMachine::new(
        store.clone(),
        Arc::new(StaticDirectory::new()),
        Arc::new(BrokenPublisher),
    );
    let approver = UserId::new();
    let mut workflow = WorkflowDefinition::new("Purchase", "");
    workflow.push_step(1, "Manager", StepType::Decision, Approver::User(approver));

    let request = open_and_submit(&machine, &workflow).await;
    let receipt = machine
        .record_decision(request.id, &Actor::new(approver), Decision::approve())
        .await
        .unwrap();

    assert_eq!(receipt.transition, Transition::Completed);
    let stored = store.load_request(&request.id).await.unwrap().unwrap();
    assert_eq!(stored.request.status, RequestStatus::Completed);
}
