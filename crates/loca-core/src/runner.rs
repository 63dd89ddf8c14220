//! Task runner: executes one prompt against one agent.
//!
//! ```text
//! pending --run_task--> running --stream ok--> completed
//!    |                     |  \---error------> failed
//!    +----cancel_task------+-----------------> cancelled
//! ```
//!
//! A cancellation always wins: the completed/failed write is conditional
//! on the task still being `running`, so a cancel that lands while the
//! stream is in flight is never overwritten.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use uuid::Uuid;

use loca_db::models::{Agent, AgentStatus, Task, TaskStatus};
use loca_db::queries::agents as agent_queries;
use loca_db::queries::tasks as task_queries;
use loca_db::queries::token_usage;

use crate::error::EngineError;
use crate::events::{EngineEvent, EventPayload, EventSink};
use crate::provider::{CompletionRequest, CompletionResponse, ProviderError, ProviderRegistry};

/// Dispatches prompts to agents and tracks the resulting tasks.
#[derive(Clone)]
pub struct TaskRunner {
    pool: SqlitePool,
    registry: Arc<ProviderRegistry>,
    events: Arc<dyn EventSink>,
}

impl TaskRunner {
    pub fn new(
        pool: SqlitePool,
        registry: Arc<ProviderRegistry>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            pool,
            registry,
            events,
        }
    }

    /// Create a `pending` task for `agent_id` and start it in the
    /// background.
    ///
    /// Rejects an empty prompt or an unknown agent before anything is
    /// persisted.
    pub async fn dispatch(&self, agent_id: Uuid, prompt: &str) -> Result<Task, EngineError> {
        if prompt.trim().is_empty() {
            return Err(EngineError::Validation("prompt must not be empty".into()));
        }
        let agent = agent_queries::get_agent(&self.pool, agent_id)
            .await?
            .ok_or(EngineError::AgentNotFound(agent_id))?;

        let task = task_queries::insert_task(&self.pool, agent_id, prompt).await?;
        tracing::info!(task_id = %task.id, agent = %agent.name, "task dispatched");

        // Detached: progress is reported through the store and events.
        drop(self.run_task(task.clone(), agent));
        Ok(task)
    }

    /// Execute a `pending` task in the background.
    ///
    /// The returned handle may be dropped. A task that is no longer
    /// `pending` when the runner picks it up is left untouched. If a store
    /// write fails midway, the task is failed and the agent released on a
    /// best-effort basis.
    pub fn run_task(&self, task: Task, agent: Agent) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            if let Err(err) = runner.execute(task.id, &agent).await {
                tracing::error!(task_id = %task.id, error = %format!("{err:#}"), "task store error");
                runner.abandon(task.id, &agent, &err).await;
            }
        })
    }

    /// Move a `pending` or `running` task to `cancelled`.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<Task, EngineError> {
        let Some(task) = task_queries::cancel_task(&self.pool, task_id).await? else {
            let current = task_queries::get_task_status(&self.pool, task_id)
                .await?
                .ok_or(EngineError::TaskNotFound(task_id))?;
            return Err(EngineError::AlreadyTerminal {
                kind: "task",
                id: task_id,
                status: current.to_string(),
            });
        };

        tracing::info!(task_id = %task_id, "task cancelled");
        self.events
            .publish(EngineEvent::new(EventPayload::TaskCancelled(task.clone())));
        Ok(task)
    }

    async fn execute(&self, task_id: Uuid, agent: &Agent) -> anyhow::Result<()> {
        if !task_queries::mark_task_running(&self.pool, task_id).await? {
            tracing::info!(task_id = %task_id, "task no longer pending, not started");
            return Ok(());
        }
        agent_queries::set_agent_status(&self.pool, agent.id, AgentStatus::Running).await?;

        let task = self.reload(task_id).await?;
        tracing::info!(task_id = %task_id, agent = %agent.name, model = %agent.model, "task started");
        self.events
            .publish(EngineEvent::new(EventPayload::TaskStarted(task.clone())));

        match self.stream(&task, agent).await {
            Ok(response) => self.finish_completed(task_id, agent, response).await,
            Err(err) => self.finish_failed(task_id, agent, &err).await,
        }
    }

    /// Close out a task whose run hit a store error. A task that already
    /// reached a terminal status keeps it.
    async fn abandon(&self, task_id: Uuid, agent: &Agent, err: &anyhow::Error) {
        match task_queries::fail_task(&self.pool, task_id, &format!("store error: {err:#}")).await {
            Ok(true) => match self.reload(task_id).await {
                Ok(task) => self
                    .events
                    .publish(EngineEvent::new(EventPayload::TaskFailed(task))),
                Err(e) => tracing::warn!(task_id = %task_id, error = %format!("{e:#}"), "failed task not reloaded"),
            },
            Ok(false) => {}
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %format!("{e:#}"), "could not mark task failed");
            }
        }
        if let Err(e) =
            agent_queries::set_agent_status(&self.pool, agent.id, AgentStatus::Idle).await
        {
            tracing::warn!(agent_id = %agent.id, error = %format!("{e:#}"), "could not reset agent status");
        }
    }

    /// Stream the completion, publishing the growing partial result after
    /// every fragment.
    async fn stream(
        &self,
        task: &Task,
        agent: &Agent,
    ) -> Result<CompletionResponse, ProviderError> {
        let provider =
            self.registry
                .get_or_create(agent.provider, &agent.api_key, agent.base_url.as_deref());
        let mut request = CompletionRequest::for_agent(agent, None, &task.prompt);
        request.stream = true;

        let mut partial = String::new();
        let events = Arc::clone(&self.events);
        let task_id = task.id;
        let mut on_delta = |delta: &str| {
            partial.push_str(delta);
            events.publish(EngineEvent::new(EventPayload::TaskProgress {
                task_id,
                content: partial.clone(),
            }));
        };
        provider.stream_complete(&request, &mut on_delta).await
    }

    async fn finish_completed(
        &self,
        task_id: Uuid,
        agent: &Agent,
        response: CompletionResponse,
    ) -> anyhow::Result<()> {
        // A cancel landing after this re-read is caught by the conditional write.
        let cancelled =
            task_queries::get_task_status(&self.pool, task_id).await? == Some(TaskStatus::Cancelled);
        if cancelled || !task_queries::complete_task(&self.pool, task_id, &response.content).await? {
            agent_queries::set_agent_status(&self.pool, agent.id, AgentStatus::Idle).await?;
            tracing::info!(task_id = %task_id, "task cancelled mid-stream, completion discarded");
            return Ok(());
        }

        if let Some(usage) = response.usage {
            token_usage::insert_token_usage(
                &self.pool,
                Some(task_id),
                agent.id,
                agent.provider,
                &response.model,
                to_i64(usage.prompt_tokens),
                to_i64(usage.completion_tokens),
                to_i64(usage.total_tokens),
            )
            .await?;
        }
        agent_queries::set_agent_status(&self.pool, agent.id, AgentStatus::Idle).await?;

        let task = self.reload(task_id).await?;
        tracing::info!(
            task_id = %task_id,
            chars = response.content.len(),
            "task completed"
        );
        self.events
            .publish(EngineEvent::new(EventPayload::TaskCompleted(task)));
        Ok(())
    }

    async fn finish_failed(
        &self,
        task_id: Uuid,
        agent: &Agent,
        err: &ProviderError,
    ) -> anyhow::Result<()> {
        let failed = task_queries::fail_task(&self.pool, task_id, &err.to_string()).await?;
        agent_queries::set_agent_status(&self.pool, agent.id, AgentStatus::Idle).await?;
        if !failed {
            tracing::info!(task_id = %task_id, error = %err, "task cancelled mid-stream, failure discarded");
            return Ok(());
        }

        tracing::warn!(task_id = %task_id, error = %err, "task failed");
        let task = self.reload(task_id).await?;
        self.events
            .publish(EngineEvent::new(EventPayload::TaskFailed(task)));
        Ok(())
    }

    async fn reload(&self, task_id: Uuid) -> anyhow::Result<Task> {
        task_queries::get_task(&self.pool, task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))
    }
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
