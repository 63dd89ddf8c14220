//! CLI handlers for `loca workflow` subcommands.
//!
//! Implements:
//! - `loca workflow create <file>` -- create a workflow from a TOML file
//! - `loca workflow run <wf>`      -- run a workflow and follow its progress
//! - `loca workflow show <wf>`     -- show a workflow with its steps
//! - `loca workflow list`          -- list all workflows

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use loca_core::events::{BroadcastEvents, EngineEvent, EventPayload};
use loca_core::workflow::definition::{create_workflow, parse_workflow_toml};
use loca_core::{EngineError, ProviderRegistry, WorkflowEngine};
use loca_db::models::{StepStatus, Workflow, WorkflowStatus};
use loca_db::queries::agents as agent_queries;
use loca_db::queries::workflows as workflow_queries;

use crate::WorkflowCommands;
use crate::agent_cmds::truncate;
use crate::resolve::resolve_workflow;
use crate::shutdown::{EXIT_INTERRUPTED, cancel_on_ctrl_c};

// -----------------------------------------------------------------------
// Public entry point
// -----------------------------------------------------------------------

/// Dispatch a `WorkflowCommands` variant to the appropriate handler.
pub async fn run_workflow_command(command: WorkflowCommands, pool: &SqlitePool) -> Result<()> {
    match command {
        WorkflowCommands::Create { file } => cmd_create(pool, &file).await,
        WorkflowCommands::Run { workflow } => cmd_run(pool, &workflow).await,
        WorkflowCommands::Show { workflow } => cmd_show(pool, &workflow).await,
        WorkflowCommands::List => cmd_list(pool).await,
    }
}

// -----------------------------------------------------------------------
// loca workflow create <file>
// -----------------------------------------------------------------------

async fn cmd_create(pool: &SqlitePool, file_path: &str) -> Result<()> {
    let content = std::fs::read_to_string(file_path)
        .with_context(|| format!("failed to read workflow file: {file_path}"))?;
    let def = parse_workflow_toml(&content)
        .with_context(|| format!("failed to parse workflow file: {file_path}"))?;

    let workflow = create_workflow(pool, &def).await?;
    let dep_edges: usize = workflow.steps.iter().map(|s| s.depends_on.len()).sum();

    println!("Workflow created successfully.");
    println!();
    println!("  Workflow ID:      {}", workflow.id);
    println!("  Name:             {}", workflow.name);
    println!("  Type:             {}", workflow.workflow_type);
    println!("  Steps:            {}", workflow.steps.len());
    println!("  Dependency edges: {dep_edges}");
    if let Some(cond) = &workflow.loop_while {
        println!("  Loop while:       {cond}");
    }
    Ok(())
}

// -----------------------------------------------------------------------
// loca workflow run <wf>
// -----------------------------------------------------------------------

/// Start the workflow and print each step as it finishes. Ctrl-C cancels
/// the workflow.
async fn cmd_run(pool: &SqlitePool, input: &str) -> Result<()> {
    let workflow = resolve_workflow(pool, input).await?;

    let events = Arc::new(BroadcastEvents::default());
    let mut rx = events.subscribe();
    let engine = WorkflowEngine::new(pool.clone(), Arc::new(ProviderRegistry::new()), events);

    let mut handle = engine.run_workflow(workflow.id).await?;
    println!(
        "Running workflow {} ({}, {} steps)...",
        workflow.name,
        workflow.workflow_type,
        workflow.steps.len()
    );

    let cancel = cancel_on_ctrl_c();
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                match engine.cancel_workflow(workflow.id).await {
                    Ok(_) | Err(EngineError::AlreadyTerminal { .. }) => {}
                    Err(e) => return Err(e).context("failed to cancel workflow"),
                }
                println!("Workflow {} cancelled.", workflow.id);
                std::process::exit(EXIT_INTERRUPTED);
            }
            joined = &mut handle => {
                if let Err(e) = joined {
                    tracing::error!(workflow_id = %workflow.id, error = %e, "workflow task aborted");
                }
                break;
            }
            event = rx.recv() => match event {
                Ok(event) => print_progress(workflow.id, &event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
    while let Ok(event) = rx.try_recv() {
        print_progress(workflow.id, &event);
    }

    let finished = workflow_queries::get_workflow(pool, workflow.id)
        .await?
        .with_context(|| format!("workflow {} not found", workflow.id))?;
    println!();
    println!("Workflow {}: {}", finished.name, finished.status);
    if let Some(err) = &finished.error {
        println!("  Error: {err}");
    }
    if let Some(last) = finished
        .steps
        .iter()
        .rev()
        .find(|s| s.status == StepStatus::Completed)
    {
        if let Some(result) = &last.result {
            println!();
            println!("{result}");
        }
    }

    match finished.status {
        WorkflowStatus::Completed => Ok(()),
        WorkflowStatus::Cancelled => std::process::exit(EXIT_INTERRUPTED),
        _ => std::process::exit(1),
    }
}

fn print_progress(workflow_id: Uuid, event: &EngineEvent) {
    if let EventPayload::WorkflowProgress {
        workflow_id: id,
        step,
    } = &event.payload
    {
        if *id == workflow_id {
            let chars = step.result.as_deref().map_or(0, |r| r.chars().count());
            println!("  [done] {} ({chars} chars)", step.name);
        }
    }
}

// -----------------------------------------------------------------------
// loca workflow show <wf>
// -----------------------------------------------------------------------

async fn cmd_show(pool: &SqlitePool, input: &str) -> Result<()> {
    let workflow = resolve_workflow(pool, input).await?;
    let agent_names = agent_names(pool).await?;

    println!("Workflow: {}", workflow.name);
    println!("  ID:          {}", workflow.id);
    println!("  Type:        {}", workflow.workflow_type);
    println!("  Status:      {}", workflow.status);
    if let Some(desc) = &workflow.description {
        println!("  Description: {desc}");
    }
    if let Some(cond) = &workflow.loop_while {
        let max = workflow
            .max_iterations
            .map_or_else(|| "default".to_string(), |n| n.to_string());
        println!("  Loop while:  {cond} (max iterations: {max})");
    }
    if workflow.iteration > 0 {
        println!("  Iteration:   {}", workflow.iteration);
    }
    if let Some(err) = &workflow.error {
        println!("  Error:       {err}");
    }
    print_timestamps(&workflow);

    println!();
    println!("  {:<3} {:<20} {:<16} {:<10} RESULT", "#", "STEP", "AGENT", "STATUS");
    println!("  {}", "-".repeat(90));
    for (i, step) in workflow.steps.iter().enumerate() {
        let agent = agent_names
            .get(&step.agent_id)
            .map_or("<deleted>", String::as_str);
        let detail = match (&step.result, &step.error) {
            (_, Some(err)) => format!("error: {}", one_line(err)),
            (Some(result), None) => one_line(result),
            (None, None) => String::new(),
        };
        println!(
            "  {:<3} {:<20} {:<16} {:<10} {}",
            i + 1,
            truncate(&step.name, 20),
            truncate(agent, 16),
            step.status,
            truncate(&detail, 40),
        );
    }
    Ok(())
}

fn print_timestamps(workflow: &Workflow) {
    println!(
        "  Created:     {}",
        workflow.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(t) = workflow.started_at {
        println!("  Started:     {}", t.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(t) = workflow.completed_at {
        println!("  Finished:    {}", t.format("%Y-%m-%d %H:%M:%S"));
    }
}

fn one_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

async fn agent_names(pool: &SqlitePool) -> Result<HashMap<Uuid, String>> {
    Ok(agent_queries::list_agents(pool)
        .await?
        .into_iter()
        .map(|a| (a.id, a.name))
        .collect())
}

// -----------------------------------------------------------------------
// loca workflow list
// -----------------------------------------------------------------------

async fn cmd_list(pool: &SqlitePool) -> Result<()> {
    let workflows = workflow_queries::list_workflows(pool).await?;

    if workflows.is_empty() {
        println!("No workflows found. Use `loca workflow create <file>` to create one.");
        return Ok(());
    }

    let id_w = 36;
    let name_w = workflows
        .iter()
        .map(|w| w.name.len())
        .max()
        .unwrap_or(4)
        .max(4);
    let type_w = 11;
    let status_w = 9;

    println!(
        "{:<id_w$}  {:<name_w$}  {:<type_w$}  {:<status_w$}  {:>5}  CREATED",
        "ID", "NAME", "TYPE", "STATUS", "STEPS",
    );
    for wf in &workflows {
        println!(
            "{:<id_w$}  {:<name_w$}  {:<type_w$}  {:<status_w$}  {:>5}  {}",
            wf.id,
            wf.name,
            wf.workflow_type,
            wf.status,
            wf.steps.len(),
            wf.created_at.format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}
