//! Grouping of workflow steps into ordered stages

use crate::request::{Approval, ApprovalStatus};
use crate::step::{StepType, WorkflowStep};
use diwan_core::StepId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// All steps sharing one `step_order`; they run in parallel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub order: i32,
    pub steps: Vec<WorkflowStep>,
}

impl Stage {
    /// Step whose id is stored as the request pointer while this stage is current
    pub fn representative(&self) -> &WorkflowStep {
        // Stages are never built empty.
        &self.steps[0]
    }

    pub fn contains(&self, step_id: &StepId) -> bool {
        self.steps.iter().any(|s| &s.id == step_id)
    }

    pub fn step(&self, step_id: &StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| &s.id == step_id)
    }

    /// Required decision steps
    pub fn blocking_steps(&self) -> impl Iterator<Item = &WorkflowStep> {
        self.steps.iter().filter(|s| s.is_blocking())
    }

    /// A stage without required decision steps is cleared on entry
    pub fn is_blocking(&self) -> bool {
        self.blocking_steps().next().is_some()
    }

    /// Every required decision step has rows and all of them are approved
    pub fn is_cleared(&self, approvals: &[Approval]) -> bool {
        self.blocking_steps().all(|step| {
            let mut rows = approvals.iter().filter(|a| a.step_id == step.id).peekable();
            rows.peek().is_some() && rows.all(|a| a.status == ApprovalStatus::Approved)
        })
    }

    /// Some decision step in this stage has a rejected row
    pub fn has_rejection(&self, approvals: &[Approval]) -> bool {
        approvals.iter().any(|a| {
            a.status == ApprovalStatus::Rejected
                && self
                    .step(&a.step_id)
                    .is_some_and(|s| s.step_type == StepType::Decision)
        })
    }
}

/// Group `steps` into stages sorted ascending by order value. Steps keep
/// their input order inside a stage. An empty list yields no stages.
pub fn build_stages(steps: &[WorkflowStep]) -> Vec<Stage> {
    let mut grouped: BTreeMap<i32, Vec<WorkflowStep>> = BTreeMap::new();
    for step in steps {
        grouped.entry(step.step_order).or_default().push(step.clone());
    }

    grouped
        .into_iter()
        .map(|(order, steps)| Stage { order, steps })
        .collect()
}

/// First stage at or after `from` that holds a required decision step
pub fn next_blocking_stage(stages: &[Stage], from: usize) -> Option<usize> {
    (from..stages.len()).find(|&i| stages[i].is_blocking())
}
