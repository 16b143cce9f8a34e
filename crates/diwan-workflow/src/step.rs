//! Workflow definitions and their steps

use crate::{Result, WorkflowError};
use diwan_core::{RoleRef, StepId, UserId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Whether a step gates progression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Blocking: the stage cannot clear until its approvals are settled
    Decision,
    /// Non-blocking: collects feedback only
    Opinion,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Decision => "decision",
            StepType::Opinion => "opinion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "decision" => Some(StepType::Decision),
            "opinion" => Some(StepType::Opinion),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an approver is addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverType {
    Direct,
    Role,
}

impl ApproverType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApproverType::Direct => "direct",
            ApproverType::Role => "role",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(ApproverType::Direct),
            "role" => Some(ApproverType::Role),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApproverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The approver a step names: a user, or every holder of a role
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "approver_type", content = "reference", rename_all = "snake_case")]
pub enum Approver {
    #[serde(rename = "direct")]
    User(UserId),
    Role(RoleRef),
}

impl Approver {
    pub fn approver_type(&self) -> ApproverType {
        match self {
            Approver::User(_) => ApproverType::Direct,
            Approver::Role(_) => ApproverType::Role,
        }
    }
}

/// One step of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    pub workflow_id: WorkflowId,
    /// Steps sharing an order value run in parallel as one stage
    pub step_order: i32,
    pub step_name: String,
    pub step_type: StepType,
    pub approver: Approver,
    #[serde(default)]
    pub instructions: Option<String>,
    pub is_required: bool,
}

impl WorkflowStep {
    /// Create a required step with a generated id
    pub fn new(
        workflow_id: WorkflowId,
        step_order: i32,
        step_name: impl Into<String>,
        step_type: StepType,
        approver: Approver,
    ) -> Self {
        Self {
            id: StepId::new(),
            workflow_id,
            step_order,
            step_name: step_name.into(),
            step_type,
            approver,
            instructions: None,
            is_required: true,
        }
    }

    pub fn with_id(mut self, id: StepId) -> Self {
        self.id = id;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.is_required = false;
        self
    }

    /// Required decision steps are the only ones that hold a stage open
    pub fn is_blocking(&self) -> bool {
        match self.step_type {
            StepType::Decision => self.is_required,
            StepType::Opinion => false,
        }
    }
}

/// Workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique workflow ID
    pub id: WorkflowId,
    /// Workflow name
    pub name: String,
    /// Workflow description
    pub description: String,
    /// Workflow steps, in configuration order
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    /// Create a new workflow definition
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            description: description.into(),
            steps: Vec::new(),
        }
    }

    /// Set workflow ID
    pub fn with_id(mut self, id: WorkflowId) -> Self {
        self.id = id;
        self
    }

    /// Add a step bound to this workflow
    pub fn add_step(mut self, mut step: WorkflowStep) -> Self {
        step.workflow_id = self.id;
        self.steps.push(step);
        self
    }

    /// Add a step built from its parts and return its id
    pub fn push_step(
        &mut self,
        step_order: i32,
        step_name: impl Into<String>,
        step_type: StepType,
        approver: Approver,
    ) -> StepId {
        let step = WorkflowStep::new(self.id, step_order, step_name, step_type, approver);
        let id = step.id;
        self.steps.push(step);
        id
    }

    pub fn step(&self, step_id: &StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| &s.id == step_id)
    }

    pub fn contains_step(&self, step_id: &StepId) -> bool {
        self.step(step_id).is_some()
    }

    /// Validate the workflow definition. An empty step list is valid: requests
    /// routed through it complete on submission.
    pub fn validate(&self) -> Result<()> {
        let mut seen_ids = HashSet::new();
        for step in &self.steps {
            if !seen_ids.insert(step.id) {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "duplicate step id {}",
                    step.id
                )));
            }
            if step.workflow_id != self.id {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "step {} belongs to workflow {}, not {}",
                    step.id, step.workflow_id, self.id
                )));
            }
            if step.step_name.trim().is_empty() {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "step {} has no name",
                    step.id
                )));
            }
        }

        Ok(())
    }
}
