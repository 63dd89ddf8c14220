//! Workflow engine: runs the steps of a workflow under one of four
//! topologies.
//!
//! | type          | order                 | on step failure                      |
//! |---------------|-----------------------|--------------------------------------|
//! | `sequential`  | array order           | abort at once (fail-fast)            |
//! | `parallel`    | all at once           | fail after every step finished       |
//! | `conditional` | array order + guards  | fail-fast; false guard skips a step  |
//! | `loop`        | array order, repeated | fail-fast; `loop_while` repeats      |
//!
//! Steps are persisted after every status change. The workflow status in
//! the store is the authority: the engine re-reads it before each step
//! launch and before the terminal write, so a cancellation stops
//! scheduling and is never overwritten.
//!
//! Every execution carries a `run_id` stored on the row when it starts.
//! All writes of a run are conditional on that id, so a run that is
//! cancelled and then replaced by a new run can no longer touch the row.

pub mod context;
pub mod definition;
pub mod guard;

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use loca_db::models::{StepStatus, Workflow, WorkflowStatus, WorkflowStep, WorkflowType};
use loca_db::queries::agents as agent_queries;
use loca_db::queries::workflows as workflow_queries;

use crate::error::{EngineError, StepFailure, WorkflowStepError};
use crate::events::{EngineEvent, EventPayload, EventSink};
use crate::provider::{CompletionRequest, ProviderRegistry};

use self::context::build_step_context;
use self::guard::{Guard, GuardError};

/// Hard upper bound on loop iterations, whatever `max_iterations` says.
pub const MAX_LOOP_ITERATIONS: i64 = 10;

/// Runs workflows and cancels them.
#[derive(Clone)]
pub struct WorkflowEngine {
    pool: SqlitePool,
    registry: Arc<ProviderRegistry>,
    events: Arc<dyn EventSink>,
}

impl WorkflowEngine {
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

    /// Validate and start a workflow, then execute it in the background.
    ///
    /// Every step is reset to `pending` and the workflow moves to
    /// `running` before this returns. The returned handle may be dropped.
    pub async fn run_workflow(&self, workflow_id: Uuid) -> Result<JoinHandle<()>, EngineError> {
        let workflow = workflow_queries::get_workflow(&self.pool, workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

        if workflow.steps.0.is_empty() {
            return Err(EngineError::Validation(format!(
                "workflow {workflow_id} has no steps"
            )));
        }
        if workflow.status == WorkflowStatus::Running {
            return Err(EngineError::AlreadyRunning(workflow_id));
        }

        let steps: Vec<WorkflowStep> = workflow.steps.0.iter().cloned().map(reset_step).collect();
        let run_id = Uuid::new_v4();
        if !workflow_queries::start_workflow(&self.pool, workflow_id, run_id, &steps).await? {
            return Err(EngineError::AlreadyRunning(workflow_id));
        }

        let workflow = workflow_queries::get_workflow(&self.pool, workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

        tracing::info!(
            workflow_id = %workflow_id,
            run_id = %run_id,
            name = %workflow.name,
            workflow_type = %workflow.workflow_type,
            steps = steps.len(),
            "workflow started"
        );
        self.events
            .publish(EngineEvent::new(EventPayload::WorkflowStarted(workflow.clone())));

        let run = WorkflowRun {
            pool: self.pool.clone(),
            registry: Arc::clone(&self.registry),
            events: Arc::clone(&self.events),
            workflow_id,
            run_id,
            steps: Mutex::new(steps),
        };
        Ok(tokio::spawn(run.execute(workflow)))
    }

    /// Move a `pending` or `running` workflow to `cancelled`.
    ///
    /// Steps already calling a provider finish, but nothing new is
    /// scheduled and the workflow stays `cancelled`.
    pub async fn cancel_workflow(&self, workflow_id: Uuid) -> Result<Workflow, EngineError> {
        let Some(workflow) = workflow_queries::cancel_workflow(&self.pool, workflow_id).await?
        else {
            let current = workflow_queries::get_workflow_status(&self.pool, workflow_id)
                .await?
                .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
            return Err(EngineError::AlreadyTerminal {
                kind: "workflow",
                id: workflow_id,
                status: current.to_string(),
            });
        };

        tracing::info!(workflow_id = %workflow_id, "workflow cancelled");
        self.events
            .publish(EngineEvent::new(EventPayload::WorkflowCancelled(workflow.clone())));
        Ok(workflow)
    }
}

fn reset_step(mut step: WorkflowStep) -> WorkflowStep {
    step.status = StepStatus::Pending;
    step.result = None;
    step.error = None;
    step.started_at = None;
    step.completed_at = None;
    step
}

/// Why a strategy stopped early.
enum Halt {
    Step(WorkflowStepError),
    LoopCondition(GuardError),
    Cancelled,
    /// A newer run of the same workflow took over the row.
    Superseded,
    Store(anyhow::Error),
}

impl From<anyhow::Error> for Halt {
    fn from(err: anyhow::Error) -> Self {
        Self::Store(err)
    }
}

type Strategy = Result<(), Halt>;

/// State of one background execution.
struct WorkflowRun {
    pool: SqlitePool,
    registry: Arc<ProviderRegistry>,
    events: Arc<dyn EventSink>,
    workflow_id: Uuid,
    run_id: Uuid,
    /// Held only around mutation and persistence, never across a provider
    /// call.
    steps: Mutex<Vec<WorkflowStep>>,
}

impl WorkflowRun {
    async fn execute(self, workflow: Workflow) {
        let outcome = match workflow.workflow_type {
            WorkflowType::Sequential => self.run_sequence(1, false).await,
            WorkflowType::Parallel => self.run_parallel().await,
            WorkflowType::Conditional => self.run_sequence(1, true).await,
            WorkflowType::Loop => self.run_loop(&workflow).await,
        };
        self.finalize(outcome).await;
    }

    /// Steps in array order, stopping at the first failure.
    async fn run_sequence(&self, iteration: i64, guarded: bool) -> Strategy {
        let count = self.steps.lock().await.len();
        for index in 0..count {
            self.ensure_not_cancelled().await?;
            self.record_progress(Some(index as i64), iteration).await?;

            if guarded && !self.guard_allows(index).await? {
                continue;
            }
            self.execute_step(index).await?;
        }
        Ok(())
    }

    /// Every step at once. A failure is reported only after all finished.
    async fn run_parallel(&self) -> Strategy {
        self.ensure_not_cancelled().await?;
        self.record_progress(None, 1).await?;

        let count = self.steps.lock().await.len();
        let outcomes = join_all((0..count).map(|index| self.execute_step(index))).await;

        let mut first_failure = None;
        for outcome in outcomes {
            match outcome {
                Ok(()) => {}
                Err(halt @ (Halt::Store(_) | Halt::Superseded)) => return Err(halt),
                Err(halt) => {
                    if first_failure.is_none() {
                        first_failure = Some(halt);
                    }
                }
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// The whole sequence, repeated while `loop_while` holds, up to
    /// `min(max_iterations, MAX_LOOP_ITERATIONS)` times.
    async fn run_loop(&self, workflow: &Workflow) -> Strategy {
        let condition = match workflow.loop_while.as_deref() {
            Some(source) => Some(Guard::parse(source).map_err(Halt::LoopCondition)?),
            None => None,
        };
        let ceiling = workflow
            .max_iterations
            .unwrap_or(MAX_LOOP_ITERATIONS)
            .clamp(1, MAX_LOOP_ITERATIONS);

        for iteration in 1..=ceiling {
            if iteration > 1 {
                self.rearm_steps().await?;
            }
            self.run_sequence(iteration, false).await?;

            let Some(condition) = &condition else {
                break;
            };
            let again = {
                let steps = self.steps.lock().await;
                condition.evaluate(&steps).map_err(Halt::LoopCondition)?
            };
            if !again {
                tracing::debug!(workflow_id = %self.workflow_id, iteration, "loop condition false");
                break;
            }
            if iteration == ceiling {
                tracing::info!(
                    workflow_id = %self.workflow_id,
                    iteration,
                    "loop iteration ceiling reached"
                );
            }
        }
        Ok(())
    }

    /// Reset steps to `pending` for the next loop iteration. Previous
    /// results stay visible to the context builder until overwritten.
    async fn rearm_steps(&self) -> Result<(), Halt> {
        let mut steps = self.steps.lock().await;
        for step in steps.iter_mut() {
            step.status = StepStatus::Pending;
            step.error = None;
            step.started_at = None;
            step.completed_at = None;
        }
        self.persist(&steps).await
    }

    /// Evaluate the step's guard. `false` marks the step skipped; an
    /// evaluation error fails it.
    async fn guard_allows(&self, index: usize) -> Result<bool, Halt> {
        let mut steps = self.steps.lock().await;
        let Some(source) = steps[index].guard.clone() else {
            return Ok(true);
        };

        match guard::evaluate(&source, &steps) {
            Ok(true) => Ok(true),
            Ok(false) => {
                let step = &mut steps[index];
                step.status = StepStatus::Skipped;
                step.completed_at = Some(Utc::now());
                tracing::info!(
                    workflow_id = %self.workflow_id,
                    step = %step.name,
                    "guard false, step skipped"
                );
                self.persist(&steps).await?;
                Ok(false)
            }
            Err(err) => {
                let now = Utc::now();
                let step = &mut steps[index];
                let failure = WorkflowStepError::new(step.id, step.name.clone(), err);
                step.status = StepStatus::Failed;
                step.error = Some(failure.source.to_string());
                step.started_at = Some(now);
                step.completed_at = Some(now);
                self.persist(&steps).await?;
                Err(Halt::Step(failure))
            }
        }
    }

    /// Run one step against its agent and record the outcome.
    async fn execute_step(&self, index: usize) -> Strategy {
        let (step, context) = {
            let mut steps = self.steps.lock().await;
            let step = &mut steps[index];
            step.status = StepStatus::Running;
            step.error = None;
            step.started_at = Some(Utc::now());
            step.completed_at = None;
            let step = step.clone();
            let context = build_step_context(&steps, &step);
            self.persist(&steps).await?;
            (step, context)
        };

        tracing::debug!(workflow_id = %self.workflow_id, step = %step.name, "step started");

        match self.call_agent(&step, context).await {
            Ok(content) => {
                let step = {
                    let mut steps = self.steps.lock().await;
                    let slot = &mut steps[index];
                    slot.status = StepStatus::Completed;
                    slot.result = Some(content);
                    slot.completed_at = Some(Utc::now());
                    let step = slot.clone();
                    self.persist(&steps).await?;
                    step
                };
                tracing::info!(workflow_id = %self.workflow_id, step = %step.name, "step completed");
                self.events.publish(EngineEvent::new(EventPayload::WorkflowProgress {
                    workflow_id: self.workflow_id,
                    step,
                }));
                Ok(())
            }
            Err(failure) => {
                {
                    let mut steps = self.steps.lock().await;
                    let slot = &mut steps[index];
                    slot.status = StepStatus::Failed;
                    slot.error = Some(failure.to_string());
                    slot.completed_at = Some(Utc::now());
                    self.persist(&steps).await?;
                }
                let err = WorkflowStepError::new(step.id, step.name, failure);
                tracing::warn!(workflow_id = %self.workflow_id, error = %err, "step failed");
                Err(Halt::Step(err))
            }
        }
    }

    async fn call_agent(
        &self,
        step: &WorkflowStep,
        context: Option<String>,
    ) -> Result<String, StepFailure> {
        let agent = agent_queries::get_agent(&self.pool, step.agent_id)
            .await
            .map_err(|e| StepFailure::Store(format!("{e:#}")))?
            .ok_or(StepFailure::AgentNotFound(step.agent_id))?;

        let provider =
            self.registry
                .get_or_create(agent.provider, &agent.api_key, agent.base_url.as_deref());
        let request = CompletionRequest::for_agent(&agent, context, &step.prompt);
        let response = provider.complete(&request).await?;
        Ok(response.content)
    }

    /// Stop if the workflow was cancelled or a newer run replaced this one.
    async fn ensure_not_cancelled(&self) -> Result<(), Halt> {
        match workflow_queries::get_run_state(&self.pool, self.workflow_id).await? {
            Some((_, Some(current))) if current != self.run_id => Err(Halt::Superseded),
            Some((WorkflowStatus::Cancelled, _)) => Err(Halt::Cancelled),
            _ => Ok(()),
        }
    }

    /// Persist the steps JSON for this run.
    async fn persist(&self, steps: &[WorkflowStep]) -> Result<(), Halt> {
        if workflow_queries::update_workflow_steps(&self.pool, self.workflow_id, self.run_id, steps)
            .await?
        {
            Ok(())
        } else {
            Err(Halt::Superseded)
        }
    }

    async fn record_progress(&self, index: Option<i64>, iteration: i64) -> Result<(), Halt> {
        if workflow_queries::set_workflow_progress(
            &self.pool,
            self.workflow_id,
            self.run_id,
            index,
            iteration,
        )
        .await?
        {
            Ok(())
        } else {
            Err(Halt::Superseded)
        }
    }

    /// Write the terminal status unless the workflow was cancelled, then
    /// publish the matching event.
    async fn finalize(&self, outcome: Strategy) {
        let id = self.workflow_id;
        let (status, error) = match outcome {
            Ok(()) => (WorkflowStatus::Completed, None),
            Err(Halt::Cancelled) => {
                tracing::info!(workflow_id = %id, "workflow cancelled, stopped scheduling steps");
                return;
            }
            Err(Halt::Superseded) => {
                tracing::info!(
                    workflow_id = %id,
                    run_id = %self.run_id,
                    "workflow restarted by a newer run, stopped"
                );
                return;
            }
            Err(Halt::Step(err)) => (WorkflowStatus::Failed, Some(err.to_string())),
            Err(Halt::LoopCondition(err)) => (
                WorkflowStatus::Failed,
                Some(format!("loop condition evaluation failed: {err}")),
            ),
            Err(Halt::Store(err)) => {
                tracing::error!(workflow_id = %id, error = %format!("{err:#}"), "workflow store error");
                (WorkflowStatus::Failed, Some(format!("{err:#}")))
            }
        };

        match self.write_terminal(status, error.as_deref()).await {
            Ok(Some(workflow)) => {
                let payload = if status == WorkflowStatus::Completed {
                    tracing::info!(workflow_id = %id, "workflow completed");
                    EventPayload::WorkflowCompleted(workflow)
                } else {
                    tracing::warn!(workflow_id = %id, error = ?error, "workflow failed");
                    EventPayload::WorkflowFailed(workflow)
                };
                self.events.publish(EngineEvent::new(payload));
            }
            Ok(None) => {
                tracing::info!(
                    workflow_id = %id,
                    outcome = %status,
                    "workflow cancelled before terminal write, outcome discarded"
                );
            }
            Err(err) => {
                tracing::error!(workflow_id = %id, error = %format!("{err:#}"), "failed to finish workflow");
            }
        }
    }

    async fn write_terminal(
        &self,
        status: WorkflowStatus,
        error: Option<&str>,
    ) -> anyhow::Result<Option<Workflow>> {
        let (id, run_id) = (self.workflow_id, self.run_id);
        match workflow_queries::get_run_state(&self.pool, id).await? {
            Some((WorkflowStatus::Running, Some(current))) if current == run_id => {}
            _ => return Ok(None),
        }
        {
            let steps = self.steps.lock().await;
            if !workflow_queries::update_workflow_steps(&self.pool, id, run_id, &steps).await? {
                return Ok(None);
            }
        }
        if !workflow_queries::finish_workflow(&self.pool, id, run_id, status, error).await? {
            return Ok(None);
        }
        workflow_queries::get_workflow(&self.pool, self.workflow_id).await
    }
}
