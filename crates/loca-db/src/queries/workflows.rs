//! Database query functions for the `workflows` table.
//!
//! Steps live in the `steps` JSON column and are rewritten as a whole after
//! every step state change.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{Workflow, WorkflowStatus, WorkflowStep, WorkflowType};

/// Fields supplied when creating a workflow.
#[derive(Debug, Clone)]
pub struct NewWorkflow<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub workflow_type: WorkflowType,
    pub steps: &'a [WorkflowStep],
    pub loop_while: Option<&'a str>,
    pub max_iterations: Option<i64>,
}

/// Insert a new `pending` workflow.
pub async fn insert_workflow(pool: &SqlitePool, new: &NewWorkflow<'_>) -> Result<Workflow> {
    let workflow = sqlx::query_as::<_, Workflow>(
        "INSERT INTO workflows \
         (id, name, description, workflow_type, steps, status, loop_while, max_iterations, \
          iteration, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(new.name)
    .bind(new.description)
    .bind(new.workflow_type)
    .bind(Json(new.steps))
    .bind(WorkflowStatus::Pending)
    .bind(new.loop_while)
    .bind(new.max_iterations)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert workflow {:?}", new.name))?;

    Ok(workflow)
}

/// Fetch a single workflow by ID.
pub async fn get_workflow(pool: &SqlitePool, id: Uuid) -> Result<Option<Workflow>> {
    let workflow = sqlx::query_as::<_, Workflow>("SELECT * FROM workflows WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow")?;

    Ok(workflow)
}

/// Fetch only the status of a workflow.
pub async fn get_workflow_status(pool: &SqlitePool, id: Uuid) -> Result<Option<WorkflowStatus>> {
    let status =
        sqlx::query_scalar::<_, WorkflowStatus>("SELECT status FROM workflows WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch workflow status")?;

    Ok(status)
}

/// List all workflows, newest first.
pub async fn list_workflows(pool: &SqlitePool) -> Result<Vec<Workflow>> {
    let workflows = sqlx::query_as::<_, Workflow>(
        "SELECT * FROM workflows ORDER BY created_at DESC, rowid DESC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list workflows")?;

    Ok(workflows)
}

/// Move a workflow that is not currently running into `running` under a
/// new `run_id`.
///
/// Resets the run bookkeeping (timestamps, error, index, iteration) and
/// stores the given steps. Returns `false` if the workflow was already
/// running. Writes scoped to an older `run_id` stop matching from here on.
pub async fn start_workflow(
    pool: &SqlitePool,
    id: Uuid,
    run_id: Uuid,
    steps: &[WorkflowStep],
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE workflows SET status = ?1, steps = ?2, started_at = ?3, completed_at = NULL, \
         error = NULL, current_step_index = NULL, iteration = 0, run_id = ?4 \
         WHERE id = ?5 AND status != ?1",
    )
    .bind(WorkflowStatus::Running)
    .bind(Json(steps))
    .bind(Utc::now())
    .bind(run_id)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to start workflow")?;

    Ok(res.rows_affected() == 1)
}

/// Status and current `run_id` of a workflow.
pub async fn get_run_state(
    pool: &SqlitePool,
    id: Uuid,
) -> Result<Option<(WorkflowStatus, Option<Uuid>)>> {
    let row = sqlx::query_as::<_, (WorkflowStatus, Option<Uuid>)>(
        "SELECT status, run_id FROM workflows WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to get workflow run state")?;

    Ok(row)
}

/// Overwrite the steps JSON on behalf of run `run_id`.
///
/// Returns `false` if a newer run has replaced it.
pub async fn update_workflow_steps(
    pool: &SqlitePool,
    id: Uuid,
    run_id: Uuid,
    steps: &[WorkflowStep],
) -> Result<bool> {
    let res = sqlx::query("UPDATE workflows SET steps = ?1 WHERE id = ?2 AND run_id = ?3")
        .bind(Json(steps))
        .bind(id)
        .bind(run_id)
        .execute(pool)
        .await
        .context("failed to update workflow steps")?;

    Ok(res.rows_affected() == 1)
}

/// Record the step index being executed and the current loop iteration.
///
/// Returns `false` if run `run_id` is no longer the workflow's current run.
pub async fn set_workflow_progress(
    pool: &SqlitePool,
    id: Uuid,
    run_id: Uuid,
    current_step_index: Option<i64>,
    iteration: i64,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE workflows SET current_step_index = ?1, iteration = ?2 \
         WHERE id = ?3 AND run_id = ?4",
    )
    .bind(current_step_index)
    .bind(iteration)
    .bind(id)
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to update workflow progress")?;

    Ok(res.rows_affected() == 1)
}

/// Transition `running -> completed|failed` for run `run_id`, stamping
/// `completed_at`.
///
/// Returns `false` if the workflow was no longer running (e.g. cancelled)
/// or a newer run has replaced this one.
pub async fn finish_workflow(
    pool: &SqlitePool,
    id: Uuid,
    run_id: Uuid,
    status: WorkflowStatus,
    error: Option<&str>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE workflows SET status = ?1, error = ?2, completed_at = ?3 \
         WHERE id = ?4 AND run_id = ?5 AND status = ?6",
    )
    .bind(status)
    .bind(error)
    .bind(Utc::now())
    .bind(id)
    .bind(run_id)
    .bind(WorkflowStatus::Running)
    .execute(pool)
    .await
    .context("failed to finish workflow")?;

    Ok(res.rows_affected() == 1)
}

/// Transition `pending|running -> cancelled`.
///
/// Returns the updated row, or `None` if the workflow does not exist or
/// was already terminal.
pub async fn cancel_workflow(pool: &SqlitePool, id: Uuid) -> Result<Option<Workflow>> {
    let workflow = sqlx::query_as::<_, Workflow>(
        "UPDATE workflows SET status = ?1, completed_at = ?2 \
         WHERE id = ?3 AND status IN (?4, ?5) \
         RETURNING *",
    )
    .bind(WorkflowStatus::Cancelled)
    .bind(Utc::now())
    .bind(id)
    .bind(WorkflowStatus::Pending)
    .bind(WorkflowStatus::Running)
    .fetch_optional(pool)
    .await
    .context("failed to cancel workflow")?;

    Ok(workflow)
}
