//! Durable store seam for workflows, requests and approval rows
//!
//! Writes go through [`ChangeSet`], committed atomically against the
//! request version read at the start of the operation.

use crate::request::{Approval, Request, RequestSnapshot};
use crate::step::WorkflowDefinition;
use async_trait::async_trait;
use diwan_core::{ApprovalId, RequestId, WorkflowId};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Version conflict on request {request_id}: expected {expected}, found {actual}")]
    Conflict {
        request_id: RequestId,
        expected: u64,
        actual: u64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// All writes of one request transition
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    /// Version the writer read; the commit aborts if it moved
    pub expected_version: u64,
    /// New request state; its `version` is `expected_version + 1`
    pub request: Request,
    pub inserted: Vec<Approval>,
    pub updated: Vec<Approval>,
    pub deleted: Vec<ApprovalId>,
}

impl ChangeSet {
    /// Start a change set from the request as read
    pub fn new(read: &Request) -> Self {
        let mut request = read.clone();
        request.version = read.version + 1;
        request.updated_at = chrono::Utc::now();
        Self {
            expected_version: read.version,
            request,
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request.id
    }
}

/// Version repository-style seam over the three approval tables
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Insert a workflow definition and its steps; an existing id is an error
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> StoreResult<()>;

    /// Get a workflow definition with its steps in configuration order
    async fn load_workflow(&self, workflow_id: &WorkflowId) -> StoreResult<Option<WorkflowDefinition>>;

    /// Insert a new request
    async fn insert_request(&self, request: &Request) -> StoreResult<()>;

    /// Read a request with all of its approval rows
    async fn load_request(&self, request_id: &RequestId) -> StoreResult<Option<RequestSnapshot>>;

    /// Apply a change set atomically, failing with [`StoreError::Conflict`]
    /// when the stored version differs from `expected_version`
    async fn commit(&self, changes: &ChangeSet) -> StoreResult<()>;
}

/// In-memory store
#[derive(Default)]
pub struct InMemoryApprovalStore {
    workflows: RwLock<HashMap<WorkflowId, WorkflowDefinition>>,
    requests: RwLock<HashMap<RequestId, RequestSnapshot>>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a request row without any version check. Used to stage
    /// damaged state for repair tooling and tests.
    pub async fn overwrite_request(&self, request: Request) {
        let mut requests = self.requests.write().await;
        match requests.get_mut(&request.id) {
            Some(snapshot) => snapshot.request = request,
            None => {
                requests.insert(
                    request.id,
                    RequestSnapshot {
                        request,
                        approvals: Vec::new(),
                    },
                );
            }
        }
    }

    /// Replace the approval rows of a request without any version check
    pub async fn overwrite_approvals(&self, request_id: &RequestId, approvals: Vec<Approval>) {
        if let Some(snapshot) = self.requests.write().await.get_mut(request_id) {
            snapshot.approvals = approvals;
        }
    }
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> StoreResult<()> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow.id) {
            return Err(StoreError::Backend(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn load_workflow(&self, workflow_id: &WorkflowId) -> StoreResult<Option<WorkflowDefinition>> {
        Ok(self.workflows.read().await.get(workflow_id).cloned())
    }

    async fn insert_request(&self, request: &Request) -> StoreResult<()> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id) {
            return Err(StoreError::Backend(format!(
                "request {} already exists",
                request.id
            )));
        }
        requests.insert(
            request.id,
            RequestSnapshot {
                request: request.clone(),
                approvals: Vec::new(),
            },
        );
        Ok(())
    }

    async fn load_request(&self, request_id: &RequestId) -> StoreResult<Option<RequestSnapshot>> {
        Ok(self.requests.read().await.get(request_id).cloned())
    }

    async fn commit(&self, changes: &ChangeSet) -> StoreResult<()> {
        let mut requests = self.requests.write().await;
        let snapshot = requests
            .get_mut(&changes.request_id())
            .ok_or_else(|| StoreError::NotFound(format!("request {}", changes.request_id())))?;

        if snapshot.request.version != changes.expected_version {
            return Err(StoreError::Conflict {
                request_id: changes.request_id(),
                expected: changes.expected_version,
                actual: snapshot.request.version,
            });
        }

        snapshot.request = changes.request.clone();
        snapshot
            .approvals
            .retain(|a| !changes.deleted.contains(&a.id));
        for updated in &changes.updated {
            if let Some(row) = snapshot.approvals.iter_mut().find(|a| a.id == updated.id) {
                *row = updated.clone();
            }
        }
        snapshot.approvals.extend(changes.inserted.iter().cloned());

        Ok(())
    }
}
