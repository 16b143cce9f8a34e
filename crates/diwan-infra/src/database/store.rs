//! Request store over PostgreSQL
//!
//! Commits update the request row with `WHERE version = $expected`; zero
//! affected rows means another writer got there first.

use crate::{InfraError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diwan_core::{ApprovalId, RequestId, RoleRef, StepId, UserId, WorkflowId};
use diwan_workflow::{
    Approval, ApprovalStatus, ApprovalStore, Approver, Assignment, ChangeSet, Request,
    RequestSnapshot, RequestStatus, StepType, StoreResult, WorkflowDefinition, WorkflowStep,
};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

const REQUEST_COLUMNS: &str = "id, workflow_id, current_step_id, status, requester_id, form_data, version, created_at, updated_at";

const APPROVAL_COLUMNS: &str = "id, request_id, step_id, assignment_type, approver_id, role, status, comments, acted_by, responded_at, created_at";

#[derive(Clone)]
pub struct PgApprovalStore {
    pool: PgPool,
}

impl PgApprovalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn save_workflow_rows(&self, workflow: &WorkflowDefinition) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Workflows are immutable once stored; a duplicate id fails on the primary key
        sqlx::query("INSERT INTO workflows (id, name, description) VALUES ($1, $2, $3)")
            .bind(*workflow.id.as_uuid())
            .bind(&workflow.name)
            .bind(&workflow.description)
            .execute(&mut *tx)
            .await?;

        for (position, step) in workflow.steps.iter().enumerate() {
            let (user_id, role) = match &step.approver {
                Approver::User(user_id) => (Some(*user_id.as_uuid()), None),
                Approver::Role(role) => (None, Some(role.as_str())),
            };

            sqlx::query(
                "INSERT INTO workflow_steps
                    (id, workflow_id, position, step_order, step_name, step_type, approver_type,
                     approver_user_id, approver_role, instructions, is_required)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(*step.id.as_uuid())
            .bind(*workflow.id.as_uuid())
            .bind(position as i32)
            .bind(step.step_order)
            .bind(&step.step_name)
            .bind(step.step_type.as_str())
            .bind(step.approver.approver_type().as_str())
            .bind(user_id)
            .bind(role)
            .bind(&step.instructions)
            .bind(step.is_required)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(workflow_id = %workflow.id, steps = workflow.steps.len(), "Workflow inserted");
        Ok(())
    }

    async fn fetch_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowDefinition>> {
        let Some(row) = sqlx::query("SELECT id, name, description FROM workflows WHERE id = $1")
            .bind(*workflow_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let mut workflow = WorkflowDefinition::new(
            row.try_get::<String, _>("name")?,
            row.try_get::<String, _>("description")?,
        )
        .with_id(*workflow_id);

        let steps = sqlx::query(
            "SELECT id, workflow_id, step_order, step_name, step_type, approver_type,
                    approver_user_id, approver_role, instructions, is_required
             FROM workflow_steps WHERE workflow_id = $1 ORDER BY position",
        )
        .bind(*workflow_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        for row in &steps {
            workflow.steps.push(decode_step(row)?);
        }
        Ok(Some(workflow))
    }

    async fn insert_request_row(&self, request: &Request) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO requests ({REQUEST_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(*request.id.as_uuid())
        .bind(*request.workflow_id.as_uuid())
        .bind(request.current_step_id.map(|id| *id.as_uuid()))
        .bind(request.status.as_str())
        .bind(*request.requester_id.as_uuid())
        .bind(&request.form_data)
        .bind(request.version as i64)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_request(&self, request_id: &RequestId) -> Result<Option<RequestSnapshot>> {
        let Some(row) = sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = $1"))
            .bind(*request_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let request = decode_request(&row)?;

        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM request_approvals WHERE request_id = $1 ORDER BY created_at, id"
        ))
        .bind(*request_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        let approvals = rows.iter().map(decode_approval).collect::<Result<Vec<_>>>()?;

        Ok(Some(RequestSnapshot { request, approvals }))
    }

    async fn commit_changes(&self, changes: &ChangeSet) -> Result<()> {
        let request = &changes.request;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE requests
             SET current_step_id = $3, status = $4, form_data = $5, version = $6, updated_at = $7
             WHERE id = $1 AND version = $2",
        )
        .bind(*request.id.as_uuid())
        .bind(changes.expected_version as i64)
        .bind(request.current_step_id.map(|id| *id.as_uuid()))
        .bind(request.status.as_str())
        .bind(&request.form_data)
        .bind(request.version as i64)
        .bind(request.updated_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let actual: Option<i64> = sqlx::query_scalar("SELECT version FROM requests WHERE id = $1")
                .bind(*request.id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;

            return Err(match actual {
                Some(actual) => InfraError::VersionConflict {
                    request_id: request.id,
                    expected: changes.expected_version,
                    actual: actual as u64,
                },
                None => InfraError::NotFound(format!("request {}", request.id)),
            });
        }

        if !changes.deleted.is_empty() {
            let ids: Vec<Uuid> = changes.deleted.iter().map(|id| *id.as_uuid()).collect();
            sqlx::query("DELETE FROM request_approvals WHERE request_id = $1 AND id = ANY($2)")
                .bind(*request.id.as_uuid())
                .bind(ids)
                .execute(&mut *tx)
                .await?;
        }

        for approval in &changes.updated {
            sqlx::query(
                "UPDATE request_approvals
                 SET status = $3, comments = $4, acted_by = $5, responded_at = $6
                 WHERE id = $1 AND request_id = $2",
            )
            .bind(*approval.id.as_uuid())
            .bind(*request.id.as_uuid())
            .bind(approval.status.as_str())
            .bind(&approval.comments)
            .bind(approval.acted_by.map(|id| *id.as_uuid()))
            .bind(approval.responded_at)
            .execute(&mut *tx)
            .await?;
        }

        for approval in &changes.inserted {
            insert_approval(&mut tx, approval).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

async fn insert_approval(tx: &mut Transaction<'_, Postgres>, approval: &Approval) -> Result<()> {
    let (assignment_type, approver_id, role) = encode_assignment(&approval.assignment);
    sqlx::query(&format!(
        "INSERT INTO request_approvals ({APPROVAL_COLUMNS})
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
    ))
    .bind(*approval.id.as_uuid())
    .bind(*approval.request_id.as_uuid())
    .bind(*approval.step_id.as_uuid())
    .bind(assignment_type)
    .bind(approver_id)
    .bind(role)
    .bind(approval.status.as_str())
    .bind(&approval.comments)
    .bind(approval.acted_by.map(|id| *id.as_uuid()))
    .bind(approval.responded_at)
    .bind(approval.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Column values for an assignment: type tag, approver id, role
pub(crate) fn encode_assignment(assignment: &Assignment) -> (&'static str, Option<Uuid>, Option<String>) {
    let approver_id = assignment.approver_id().map(|id| *id.as_uuid());
    let role = assignment.role().map(|r| r.as_str().to_string());
    (assignment.assignment_type().as_str(), approver_id, role)
}

pub(crate) fn decode_assignment(
    assignment_type: &str,
    approver_id: Option<Uuid>,
    role: Option<String>,
) -> Result<Assignment> {
    match (assignment_type, approver_id, role) {
        ("direct", Some(id), _) => Ok(Assignment::Direct {
            approver_id: UserId::from_uuid(id),
        }),
        ("role", approver_id, Some(role)) => Ok(Assignment::Role {
            role: RoleRef::new(role),
            approver_id: approver_id.map(UserId::from_uuid),
        }),
        (other, _, _) => Err(InfraError::Decode(format!(
            "incomplete '{}' assignment",
            other
        ))),
    }
}

fn decode_step(row: &PgRow) -> Result<WorkflowStep> {
    let step_type: String = row.try_get("step_type")?;
    let step_type = StepType::parse(&step_type)
        .ok_or_else(|| InfraError::Decode(format!("step type '{}'", step_type)))?;

    let approver_type: String = row.try_get("approver_type")?;
    let approver = match approver_type.as_str() {
        "direct" => row
            .try_get::<Option<Uuid>, _>("approver_user_id")?
            .map(|id| Approver::User(UserId::from_uuid(id))),
        "role" => row
            .try_get::<Option<String>, _>("approver_role")?
            .map(|role| Approver::Role(RoleRef::new(role))),
        _ => None,
    }
    .ok_or_else(|| InfraError::Decode(format!("approver of type '{}'", approver_type)))?;

    let mut step = WorkflowStep::new(
        WorkflowId::from_uuid(row.try_get("workflow_id")?),
        row.try_get("step_order")?,
        row.try_get::<String, _>("step_name")?,
        step_type,
        approver,
    )
    .with_id(StepId::from_uuid(row.try_get("id")?));
    step.instructions = row.try_get("instructions")?;
    step.is_required = row.try_get("is_required")?;
    Ok(step)
}

fn decode_request(row: &PgRow) -> Result<Request> {
    let status: String = row.try_get("status")?;
    let version: i64 = row.try_get("version")?;

    Ok(Request {
        id: RequestId::from_uuid(row.try_get("id")?),
        workflow_id: WorkflowId::from_uuid(row.try_get("workflow_id")?),
        current_step_id: row
            .try_get::<Option<Uuid>, _>("current_step_id")?
            .map(StepId::from_uuid),
        status: RequestStatus::parse(&status)
            .ok_or_else(|| InfraError::Decode(format!("request status '{}'", status)))?,
        requester_id: UserId::from_uuid(row.try_get("requester_id")?),
        form_data: row.try_get("form_data")?,
        version: version as u64,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn decode_approval(row: &PgRow) -> Result<Approval> {
    let status: String = row.try_get("status")?;
    let assignment_type: String = row.try_get("assignment_type")?;

    Ok(Approval {
        id: ApprovalId::from_uuid(row.try_get("id")?),
        request_id: RequestId::from_uuid(row.try_get("request_id")?),
        step_id: StepId::from_uuid(row.try_get("step_id")?),
        assignment: decode_assignment(
            &assignment_type,
            row.try_get("approver_id")?,
            row.try_get("role")?,
        )?,
        status: ApprovalStatus::parse(&status)
            .ok_or_else(|| InfraError::Decode(format!("approval status '{}'", status)))?,
        comments: row.try_get("comments")?,
        acted_by: row.try_get::<Option<Uuid>, _>("acted_by")?.map(UserId::from_uuid),
        responded_at: row.try_get("responded_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ApprovalStore for PgApprovalStore {
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> StoreResult<()> {
        Ok(self.save_workflow_rows(workflow).await?)
    }

    async fn load_workflow(&self, workflow_id: &WorkflowId) -> StoreResult<Option<WorkflowDefinition>> {
        Ok(self.fetch_workflow(workflow_id).await?)
    }

    async fn insert_request(&self, request: &Request) -> StoreResult<()> {
        Ok(self.insert_request_row(request).await?)
    }

    async fn load_request(&self, request_id: &RequestId) -> StoreResult<Option<RequestSnapshot>> {
        Ok(self.fetch_request(request_id).await?)
    }

    async fn commit(&self, changes: &ChangeSet) -> StoreResult<()> {
        let result = self.commit_changes(changes).await;
        if let Err(InfraError::VersionConflict {
            expected, actual, ..
        }) = &result
        {
            tracing::warn!(
                request_id = %changes.request_id(),
                expected,
                actual,
                "Request version moved during commit"
            );
        }
        Ok(result?)
    }
}
