//! Multi-step request approval workflow
//!
//! This crate provides:
//! - Step model and grouping of steps into parallel stages
//! - Resolution of a request pointer to its stage, and progress
//! - The approval gate deciding who may act on a stage
//! - A request state machine with optimistic concurrency and conflict retry
//! - Diagnostics and idempotent repair of request state
//! - Store and identity seams with in-memory implementations

pub mod approval;
pub mod diagnostics;
pub mod engine;
pub mod identity;
pub mod lock;
pub mod request;
pub mod resolver;
pub mod retry;
pub mod stages;
pub mod step;
pub mod store;

pub use approval::{Actor, ApprovalGate};
pub use diagnostics::{
    inspect, plan_repair, DiagnosticReport, DiagnosticsEngine, Issue, IssueKind, RepairPlan,
    RepairReport,
};
pub use engine::{Decision, DecisionReceipt, RequestStateMachine, Transition};
pub use identity::{IdentityError, IdentityProvider, StaticDirectory};
pub use lock::{RequestLockGuard, RequestLocks};
pub use request::{
    Approval, ApprovalStatus, Assignment, DecisionOutcome, Request, RequestSnapshot,
    RequestStatus,
};
pub use resolver::{compute_progress, locate_stage, RequestProgress, StagePosition};
pub use retry::{RetryConfig, RetryPolicy};
pub use stages::{build_stages, next_blocking_stage, Stage};
pub use step::{Approver, ApproverType, StepType, WorkflowDefinition, WorkflowStep};
pub use store::{ApprovalStore, ChangeSet, InMemoryApprovalStore, StoreError, StoreResult};

use diwan_core::RequestId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("you cannot act on this request")]
    Forbidden,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Inconsistent request: {0}")]
    Inconsistent(String),

    #[error("Request {0} was modified concurrently, retries exhausted")]
    Conflict(RequestId),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
}

impl WorkflowError {
    /// HTTP status code a caller surfacing this error should use
    pub fn status_code(&self) -> u16 {
        match self {
            WorkflowError::Forbidden => 403,
            WorkflowError::NotFound(_) => 404,
            WorkflowError::InvalidState(_) | WorkflowError::Conflict(_) => 409,
            WorkflowError::InvalidDefinition(_) => 400,
            WorkflowError::Inconsistent(_) => 422,
            WorkflowError::Identity(_) => 502,
            WorkflowError::Store(_) => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            WorkflowError::Forbidden => "FORBIDDEN",
            WorkflowError::InvalidState(_) => "INVALID_STATE",
            WorkflowError::Inconsistent(_) => "INCONSISTENT",
            WorkflowError::Conflict(_) => "CONFLICT",
            WorkflowError::NotFound(_) => "NOT_FOUND",
            WorkflowError::InvalidDefinition(_) => "INVALID_DEFINITION",
            WorkflowError::Store(_) => "STORE_ERROR",
            WorkflowError::Identity(_) => "IDENTITY_ERROR",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, WorkflowError::Conflict(_))
    }
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { request_id, .. } => WorkflowError::Conflict(request_id),
            StoreError::NotFound(what) => WorkflowError::NotFound(what),
            StoreError::Backend(reason) => WorkflowError::Store(reason),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
