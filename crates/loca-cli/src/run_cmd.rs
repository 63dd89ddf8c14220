//! `loca run` command: send one prompt to an agent and stream the answer.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio::sync::broadcast::error::RecvError;

use loca_core::events::{BroadcastEvents, EventPayload};
use loca_core::{EngineError, ProviderRegistry, TaskRunner};
use loca_db::models::TaskStatus;
use loca_db::queries::tasks as task_queries;

use crate::resolve::resolve_agent;
use crate::shutdown::{EXIT_INTERRUPTED, cancel_on_ctrl_c};

/// Run the prompt command.
///
/// Streams fragments to stdout as they arrive. Ctrl-C cancels the task.
pub async fn run_prompt(pool: &SqlitePool, agent_ref: &str, prompt: &str) -> Result<()> {
    let agent = resolve_agent(pool, agent_ref).await?;

    let events = Arc::new(BroadcastEvents::default());
    let mut rx = events.subscribe();
    let runner = TaskRunner::new(pool.clone(), Arc::new(ProviderRegistry::new()), events);

    let task = runner.dispatch(agent.id, prompt).await?;
    eprintln!("Task {} dispatched to {} ({})", task.id, agent.name, agent.model);

    let cancel = cancel_on_ctrl_c();
    let mut stdout = std::io::stdout();
    let mut printed = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                match runner.cancel_task(task.id).await {
                    Ok(_) | Err(EngineError::AlreadyTerminal { .. }) => {}
                    Err(e) => return Err(e).context("failed to cancel task"),
                }
                eprintln!("Task {} cancelled.", task.id);
                std::process::exit(EXIT_INTERRUPTED);
            }
            event = rx.recv() => match event {
                Ok(event) => match event.payload {
                    EventPayload::TaskProgress { task_id, content } if task_id == task.id => {
                        if let Some(fresh) = content.get(printed..) {
                            write!(stdout, "{fresh}")?;
                            stdout.flush()?;
                        }
                        printed = content.len();
                    }
                    EventPayload::TaskCompleted(t)
                    | EventPayload::TaskFailed(t)
                    | EventPayload::TaskCancelled(t)
                        if t.id == task.id =>
                    {
                        break;
                    }
                    _ => {}
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
    if printed > 0 {
        println!();
    }

    let task = task_queries::get_task(pool, task.id)
        .await?
        .with_context(|| format!("task {} not found", task.id))?;
    match task.status {
        TaskStatus::Completed => Ok(()),
        TaskStatus::Cancelled => {
            eprintln!("Task {} was cancelled.", task.id);
            std::process::exit(EXIT_INTERRUPTED);
        }
        _ => {
            eprintln!(
                "Task {} failed: {}",
                task.id,
                task.error.as_deref().unwrap_or("unknown error")
            );
            std::process::exit(1);
        }
    }
}
