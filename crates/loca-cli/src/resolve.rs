//! Resolution of user-supplied agent and workflow references.
//!
//! - [`resolve_agent`] accepts an agent UUID or an agent name.
//! - [`resolve_workflow`] accepts a workflow UUID or a workflow name; a
//!   name must match exactly one workflow.

use anyhow::{Context, Result, bail};
use sqlx::SqlitePool;
use uuid::Uuid;

use loca_db::models::{Agent, Workflow};
use loca_db::queries::agents as agent_queries;
use loca_db::queries::workflows as workflow_queries;

/// Look up an agent by id, falling back to its name.
pub async fn resolve_agent(pool: &SqlitePool, input: &str) -> Result<Agent> {
    if let Ok(id) = Uuid::parse_str(input) {
        if let Some(agent) = agent_queries::get_agent(pool, id).await? {
            return Ok(agent);
        }
    }
    agent_queries::get_agent_by_name(pool, input)
        .await?
        .with_context(|| format!("agent {input:?} not found (not a known id or name)"))
}

/// Look up a workflow by id, falling back to a unique name.
pub async fn resolve_workflow(pool: &SqlitePool, input: &str) -> Result<Workflow> {
    if let Ok(id) = Uuid::parse_str(input) {
        return workflow_queries::get_workflow(pool, id)
            .await?
            .with_context(|| format!("workflow {id} not found"));
    }

    let mut matches: Vec<Workflow> = workflow_queries::list_workflows(pool)
        .await?
        .into_iter()
        .filter(|wf| wf.name == input)
        .collect();
    match matches.len() {
        0 => bail!("workflow {input:?} not found"),
        1 => Ok(matches.remove(0)),
        n => bail!("{n} workflows are named {input:?}; use the workflow id instead"),
    }
}

/// Parse a UUID argument with a uniform error message.
pub fn parse_id(kind: &str, input: &str) -> Result<Uuid> {
    Uuid::parse_str(input).with_context(|| format!("invalid {kind} ID: {input}"))
}
