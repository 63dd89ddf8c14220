//! Database query functions for the `agents` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{Agent, AgentStatus, ProviderKind};

/// Fields supplied when registering an agent.
#[derive(Debug, Clone)]
pub struct NewAgent<'a> {
    pub name: &'a str,
    pub provider: ProviderKind,
    pub api_key: &'a str,
    pub base_url: Option<&'a str>,
    pub model: &'a str,
    pub max_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub system_prompt: Option<&'a str>,
}

/// Insert a new agent in the `idle` state.
pub async fn insert_agent(pool: &SqlitePool, new: &NewAgent<'_>) -> Result<Agent> {
    let now = Utc::now();
    let agent = sqlx::query_as::<_, Agent>(
        "INSERT INTO agents \
         (id, name, provider, api_key, base_url, model, max_tokens, temperature, system_prompt, \
          status, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(new.name)
    .bind(new.provider)
    .bind(new.api_key)
    .bind(new.base_url)
    .bind(new.model)
    .bind(new.max_tokens)
    .bind(new.temperature)
    .bind(new.system_prompt)
    .bind(AgentStatus::Idle)
    .bind(now)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert agent {:?}", new.name))?;

    Ok(agent)
}

/// Fetch a single agent by ID.
pub async fn get_agent(pool: &SqlitePool, id: Uuid) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent")?;

    Ok(agent)
}

/// Fetch a single agent by its unique name.
pub async fn get_agent_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE name = ?1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent by name")?;

    Ok(agent)
}

/// List all agents, ordered by creation time.
pub async fn list_agents(pool: &SqlitePool) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>("SELECT * FROM agents ORDER BY created_at ASC, rowid ASC")
        .fetch_all(pool)
        .await
        .context("failed to list agents")?;

    Ok(agents)
}

/// Update the status of an agent.
pub async fn set_agent_status(pool: &SqlitePool, id: Uuid, status: AgentStatus) -> Result<()> {
    let result = sqlx::query("UPDATE agents SET status = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(status)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update agent status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("agent {id} not found");
    }

    Ok(())
}
