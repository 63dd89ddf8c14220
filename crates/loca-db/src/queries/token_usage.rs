//! Database query functions for the `token_usage` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::models::{ProviderKind, TokenUsage};

/// Aggregated token counts for one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, FromRow)]
pub struct UsageTotals {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

/// Record the usage reported for one task.
#[allow(clippy::too_many_arguments)]
pub async fn insert_token_usage(
    pool: &SqlitePool,
    task_id: Option<Uuid>,
    agent_id: Uuid,
    provider: ProviderKind,
    model: &str,
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
) -> Result<TokenUsage> {
    let row = sqlx::query_as::<_, TokenUsage>(
        "INSERT INTO token_usage \
         (task_id, agent_id, provider, model, prompt_tokens, completion_tokens, total_tokens, \
          recorded_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(agent_id)
    .bind(provider)
    .bind(model)
    .bind(prompt_tokens)
    .bind(completion_tokens)
    .bind(total_tokens)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert token usage")?;

    Ok(row)
}

/// Sum all recorded usage for an agent. Zero when nothing was recorded.
pub async fn usage_totals_for_agent(pool: &SqlitePool, agent_id: Uuid) -> Result<UsageTotals> {
    let totals = sqlx::query_as::<_, UsageTotals>(
        "SELECT COALESCE(SUM(prompt_tokens), 0) AS prompt_tokens, \
                COALESCE(SUM(completion_tokens), 0) AS completion_tokens, \
                COALESCE(SUM(total_tokens), 0) AS total_tokens \
         FROM token_usage WHERE agent_id = ?1",
    )
    .bind(agent_id)
    .fetch_one(pool)
    .await
    .context("failed to sum token usage")?;

    Ok(totals)
}

/// List the usage rows recorded for one task.
pub async fn list_usage_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<TokenUsage>> {
    let rows = sqlx::query_as::<_, TokenUsage>(
        "SELECT * FROM token_usage WHERE task_id = ?1 ORDER BY id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list token usage for task")?;

    Ok(rows)
}
