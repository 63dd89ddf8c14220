//! Database query functions for the `tasks` table.
//!
//! Terminal writes are conditional on the current status so a concurrent
//! cancellation is never overwritten: each returns `false` when the row was
//! no longer in the expected state.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Insert a new `pending` task.
pub async fn insert_task(pool: &SqlitePool, agent_id: Uuid, prompt: &str) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, agent_id, prompt, status, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(agent_id)
    .bind(prompt)
    .bind(TaskStatus::Pending)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &SqlitePool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch only the status of a task.
pub async fn get_task_status(pool: &SqlitePool, id: Uuid) -> Result<Option<TaskStatus>> {
    let status = sqlx::query_scalar::<_, TaskStatus>("SELECT status FROM tasks WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task status")?;

    Ok(status)
}

/// List the tasks of one agent, newest first.
pub async fn list_tasks_for_agent(pool: &SqlitePool, agent_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE agent_id = ?1 ORDER BY created_at DESC, rowid DESC",
    )
    .bind(agent_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for agent")?;

    Ok(tasks)
}

/// List the most recent tasks across all agents.
pub async fn list_recent_tasks(pool: &SqlitePool, limit: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks ORDER BY created_at DESC, rowid DESC LIMIT ?1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list recent tasks")?;

    Ok(tasks)
}

/// Transition `pending -> running` and stamp `started_at`.
///
/// Returns `false` if the task was not pending (e.g. cancelled before the
/// runner picked it up).
pub async fn mark_task_running(pool: &SqlitePool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks SET status = ?1, started_at = ?2 WHERE id = ?3 AND status = ?4",
    )
    .bind(TaskStatus::Running)
    .bind(Utc::now())
    .bind(id)
    .bind(TaskStatus::Pending)
    .execute(pool)
    .await
    .context("failed to mark task running")?;

    Ok(result.rows_affected() == 1)
}

/// Transition `running -> completed` with the final result.
///
/// Returns `false` if the task was no longer running.
pub async fn complete_task(pool: &SqlitePool, id: Uuid, result: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE tasks SET status = ?1, result = ?2, completed_at = ?3 \
         WHERE id = ?4 AND status = ?5",
    )
    .bind(TaskStatus::Completed)
    .bind(result)
    .bind(Utc::now())
    .bind(id)
    .bind(TaskStatus::Running)
    .execute(pool)
    .await
    .context("failed to complete task")?;

    Ok(res.rows_affected() == 1)
}

/// Transition `pending|running -> failed` with an error message.
///
/// Returns `false` if the task had already reached a terminal state.
pub async fn fail_task(pool: &SqlitePool, id: Uuid, error: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE tasks SET status = ?1, error = ?2, completed_at = ?3 \
         WHERE id = ?4 AND status IN (?5, ?6)",
    )
    .bind(TaskStatus::Failed)
    .bind(error)
    .bind(Utc::now())
    .bind(id)
    .bind(TaskStatus::Pending)
    .bind(TaskStatus::Running)
    .execute(pool)
    .await
    .context("failed to fail task")?;

    Ok(res.rows_affected() == 1)
}

/// Transition `pending|running -> cancelled`.
///
/// Returns the updated row, or `None` if the task does not exist or was
/// already terminal.
pub async fn cancel_task(pool: &SqlitePool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks SET status = ?1, completed_at = ?2 \
         WHERE id = ?3 AND status IN (?4, ?5) \
         RETURNING *",
    )
    .bind(TaskStatus::Cancelled)
    .bind(Utc::now())
    .bind(id)
    .bind(TaskStatus::Pending)
    .bind(TaskStatus::Running)
    .fetch_optional(pool)
    .await
    .context("failed to cancel task")?;

    Ok(task)
}

/// Count tasks grouped by status.
pub async fn count_tasks_by_status(pool: &SqlitePool) -> Result<Vec<(TaskStatus, i64)>> {
    let rows = sqlx::query_as::<_, (TaskStatus, i64)>(
        "SELECT status, COUNT(*) FROM tasks GROUP BY status ORDER BY status",
    )
    .fetch_all(pool)
    .await
    .context("failed to count tasks by status")?;

    Ok(rows)
}
