//! Mapping of a request pointer onto its workflow's stages

use crate::request::RequestStatus;
use crate::stages::Stage;
use diwan_core::StepId;
use serde::{Deserialize, Serialize};

/// Where a request pointer lands in the stage list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagePosition {
    /// Null pointer
    NotStarted,
    /// Pointer resolves to the stage at `index`
    At { index: usize },
    /// Pointer names a step outside the workflow
    Dangling { step_id: StepId },
}

impl StagePosition {
    pub fn resolve(stages: &[Stage], current_step_id: Option<&StepId>) -> Self {
        match (current_step_id, locate_stage(stages, current_step_id)) {
            (None, _) => StagePosition::NotStarted,
            (Some(_), Some(index)) => StagePosition::At { index },
            (Some(step_id), None) => StagePosition::Dangling { step_id: *step_id },
        }
    }

    pub fn index(&self) -> Option<usize> {
        match self {
            StagePosition::At { index } => Some(*index),
            StagePosition::NotStarted | StagePosition::Dangling { .. } => None,
        }
    }
}

/// Index of the stage containing `current_step_id`, or `None` when the
/// pointer is null or matches no step.
pub fn locate_stage(stages: &[Stage], current_step_id: Option<&StepId>) -> Option<usize> {
    let step_id = current_step_id?;
    stages.iter().position(|stage| stage.contains(step_id))
}

/// Completion percentage in `0..=100`.
///
/// Completed requests always report 100. Rejected requests keep the value
/// of the stage they were rejected at, like any other status.
pub fn compute_progress(stages: &[Stage], stage_index: Option<usize>, status: RequestStatus) -> u8 {
    if status == RequestStatus::Completed {
        return 100;
    }

    let total = stages.len();
    let Some(index) = stage_index else {
        return 0;
    };
    if total == 0 {
        return 0;
    }

    let percent = (100.0 * (index + 1) as f64 / total as f64).round();
    percent.clamp(0.0, 100.0) as u8
}

/// Progress summary of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestProgress {
    pub status: RequestStatus,
    pub position: StagePosition,
    /// Order value of the current stage, when resolvable
    pub stage_order: Option<i32>,
    pub total_stages: usize,
    pub percent: u8,
}

impl RequestProgress {
    pub fn compute(stages: &[Stage], current_step_id: Option<&StepId>, status: RequestStatus) -> Self {
        let position = StagePosition::resolve(stages, current_step_id);
        let index = position.index();
        Self {
            status,
            position,
            stage_order: index.map(|i| stages[i].order),
            total_stages: stages.len(),
            percent: compute_progress(stages, index, status),
        }
    }
}
