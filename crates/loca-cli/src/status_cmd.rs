//! `loca status` and `loca cancel` commands.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use sqlx::SqlitePool;

use loca_core::events::NullEvents;
use loca_core::{EngineError, ProviderRegistry, TaskRunner, WorkflowEngine};
use loca_db::queries::{agents as agent_queries, tasks as task_queries, token_usage};

use crate::agent_cmds::truncate;
use crate::resolve::parse_id;

/// Number of tasks listed in the overview.
const RECENT_TASKS: i64 = 10;

/// Show an overview, or one task in detail when `task_id` is given.
pub async fn run_status(pool: &SqlitePool, task_id: Option<&str>) -> Result<()> {
    match task_id {
        Some(id) => show_task(pool, id).await,
        None => show_overview(pool).await,
    }
}

async fn show_overview(pool: &SqlitePool) -> Result<()> {
    let agents = agent_queries::list_agents(pool).await?;
    println!("Agents: {}", agents.len());
    for agent in &agents {
        println!("  {:<20} {:<8} {}/{}", agent.name, agent.status, agent.provider, agent.model);
    }

    let counts = task_queries::count_tasks_by_status(pool).await?;
    let total: i64 = counts.iter().map(|(_, n)| n).sum();
    println!();
    println!("Tasks: {total}");
    for (status, n) in &counts {
        println!("  {status:<10} {n}");
    }

    let recent = task_queries::list_recent_tasks(pool, RECENT_TASKS).await?;
    if recent.is_empty() {
        return Ok(());
    }
    println!();
    println!("{:<38} {:<10} {:<17} PROMPT", "ID", "STATUS", "CREATED");
    println!("{}", "-".repeat(100));
    for task in &recent {
        println!(
            "{:<38} {:<10} {:<17} {}",
            task.id,
            task.status,
            task.created_at.format("%Y-%m-%d %H:%M"),
            truncate(&task.prompt.replace('\n', " "), 32),
        );
    }
    Ok(())
}

async fn show_task(pool: &SqlitePool, input: &str) -> Result<()> {
    let id = parse_id("task", input)?;
    let task = task_queries::get_task(pool, id)
        .await?
        .with_context(|| format!("task {id} not found"))?;
    let agent = agent_queries::get_agent(pool, task.agent_id).await?;

    println!("Task: {}", task.id);
    println!("  Status:   {}", task.status);
    match &agent {
        Some(a) => println!("  Agent:    {} ({}/{})", a.name, a.provider, a.model),
        None => println!("  Agent:    {} (deleted)", task.agent_id),
    }
    println!("  Created:  {}", task.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(t) = task.started_at {
        println!("  Started:  {}", t.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(t) = task.completed_at {
        println!("  Finished: {}", t.format("%Y-%m-%d %H:%M:%S"));
        if let Some(start) = task.started_at {
            let secs = (t - start).num_milliseconds() as f64 / 1000.0;
            println!("  Duration: {secs:.1}s");
        }
    }

    for usage in token_usage::list_usage_for_task(pool, task.id).await? {
        println!(
            "  Tokens:   {} prompt + {} completion = {}",
            usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
        );
    }

    println!();
    println!("Prompt:");
    println!("{}", task.prompt);
    if let Some(result) = &task.result {
        println!();
        println!("Result:");
        println!("{result}");
    }
    if let Some(err) = &task.error {
        println!();
        println!("Error: {err}");
    }
    Ok(())
}

/// Cancel a task, or a workflow if no task has that id.
///
/// A run followed by another `loca` process notices the cancellation
/// through the database and stops.
pub async fn run_cancel(pool: &SqlitePool, input: &str) -> Result<()> {
    let id = parse_id("task or workflow", input)?;
    let registry = Arc::new(ProviderRegistry::new());
    let events = Arc::new(NullEvents);

    let runner = TaskRunner::new(pool.clone(), registry.clone(), events.clone());
    match runner.cancel_task(id).await {
        Ok(task) => {
            println!("Task {} cancelled.", task.id);
            return Ok(());
        }
        Err(EngineError::TaskNotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }

    let engine = WorkflowEngine::new(pool.clone(), registry, events);
    match engine.cancel_workflow(id).await {
        Ok(workflow) => {
            println!("Workflow {} ({}) cancelled.", workflow.name, workflow.id);
            Ok(())
        }
        Err(EngineError::WorkflowNotFound(_)) => bail!("no task or workflow with ID {id}"),
        Err(e) => Err(e.into()),
    }
}
