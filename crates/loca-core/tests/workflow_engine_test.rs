//! Integration tests for the workflow engine: one test group per topology,
//! plus cancellation and dispatch validation.

use std::sync::Arc;

use sqlx::SqlitePool;
use uuid::Uuid;

use loca_core::provider::{Message, ProviderRegistry};
use loca_core::{EngineError, WorkflowEngine};
use loca_db::models::{
    Agent, StepStatus, Workflow, WorkflowStatus, WorkflowStep, WorkflowType,
};
use loca_db::queries::workflows::{self, NewWorkflow};
use loca_test_utils::{
    Gate, RecordingEvents, Reply, ScriptedProvider, create_test_db, insert_test_agent,
    register_stub,
};

struct Harness {
    pool: SqlitePool,
    agent: Agent,
    provider: Arc<ScriptedProvider>,
    events: Arc<RecordingEvents>,
    engine: WorkflowEngine,
}

async fn harness(provider: ScriptedProvider) -> Harness {
    let pool = create_test_db().await;
    let agent = insert_test_agent(&pool, "worker").await;
    let provider = Arc::new(provider);
    let registry = Arc::new(ProviderRegistry::new());
    register_stub(&registry, &agent, provider.clone());
    let events = RecordingEvents::new();
    let engine = WorkflowEngine::new(pool.clone(), registry, events.clone());
    Harness {
        pool,
        agent,
        provider,
        events,
        engine,
    }
}

impl Harness {
    /// Steps named after their prompts: step `a` sends prompt `a`.
    fn steps(&self, names: &[&str]) -> Vec<WorkflowStep> {
        names
            .iter()
            .map(|name| WorkflowStep::new(self.agent.id, *name, *name))
            .collect()
    }

    async fn insert(&self, workflow_type: WorkflowType, steps: &[WorkflowStep]) -> Workflow {
        self.insert_loop(workflow_type, steps, None, None).await
    }

    async fn insert_loop(
        &self,
        workflow_type: WorkflowType,
        steps: &[WorkflowStep],
        loop_while: Option<&str>,
        max_iterations: Option<i64>,
    ) -> Workflow {
        workflows::insert_workflow(
            &self.pool,
            &NewWorkflow {
                name: "test",
                description: None,
                workflow_type,
                steps,
                loop_while,
                max_iterations,
            },
        )
        .await
        .unwrap()
    }

    async fn run(&self, id: Uuid) -> Workflow {
        self.engine.run_workflow(id).await.unwrap().await.unwrap();
        workflows::get_workflow(&self.pool, id).await.unwrap().unwrap()
    }
}

fn step<'a>(workflow: &'a Workflow, name: &str) -> &'a WorkflowStep {
    workflow
        .steps
        .0
        .iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("no step {name}"))
}

// ---------------------------------------------------------------------------
// sequential
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_passes_dependency_results_as_context() {
    let h = harness(
        ScriptedProvider::new()
            .reply("a", Reply::text("alpha"))
            .reply("b", Reply::text("beta")),
    )
    .await;
    let mut steps = h.steps(&["a", "b"]);
    steps[1].depends_on = vec![steps[0].id];
    let wf = h.insert(WorkflowType::Sequential, &steps).await;

    let done = h.run(wf.id).await;

    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(done.error, None);
    assert_eq!(step(&done, "a").result.as_deref(), Some("alpha"));
    assert_eq!(step(&done, "b").result.as_deref(), Some("beta"));
    assert!(done.steps.0.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(done.current_step_index, Some(1));

    let first = h.provider.call_for("a").unwrap();
    assert_eq!(first.messages, vec![Message::user("a")]);
    let second = h.provider.call_for("b").unwrap();
    assert_eq!(
        second.messages,
        vec![
            Message::system("Context from previous steps:\na: alpha"),
            Message::user("b"),
        ]
    );

    assert_eq!(
        h.events.names(),
        vec![
            "workflow:started",
            "workflow:progress",
            "workflow:progress",
            "workflow:completed",
        ]
    );
}

#[tokio::test]
async fn sequential_failure_aborts_remaining_steps() {
    let h = harness(ScriptedProvider::new().reply("two", Reply::Fail("rate limited".into()))).await;
    let steps = h.steps(&["one", "two", "three"]);
    let wf = h.insert(WorkflowType::Sequential, &steps).await;

    let done = h.run(wf.id).await;

    assert_eq!(done.status, WorkflowStatus::Failed);
    assert_eq!(step(&done, "one").status, StepStatus::Completed);
    assert_eq!(step(&done, "two").status, StepStatus::Failed);
    assert_eq!(
        step(&done, "two").error.as_deref(),
        Some("stub api error: rate limited")
    );
    assert_eq!(step(&done, "three").status, StepStatus::Pending);
    assert!(step(&done, "three").started_at.is_none());
    assert!(h.provider.call_for("three").is_none());

    let error = done.error.unwrap();
    assert!(error.starts_with("step \"two\" failed"), "{error}");
    assert!(h.events.names().contains(&"workflow:failed"));
}

// ---------------------------------------------------------------------------
// parallel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_failure_waits_for_siblings() {
    let h = harness(
        ScriptedProvider::new()
            .reply("p1", Reply::text("r1"))
            .reply("p2", Reply::Fail("boom".into()))
            .reply("p3", Reply::text("r3")),
    )
    .await;
    let steps = h.steps(&["p1", "p2", "p3"]);
    let wf = h.insert(WorkflowType::Parallel, &steps).await;

    let done = h.run(wf.id).await;

    assert_eq!(done.status, WorkflowStatus::Failed);
    assert_eq!(step(&done, "p1").status, StepStatus::Completed);
    assert_eq!(step(&done, "p1").result.as_deref(), Some("r1"));
    assert_eq!(step(&done, "p3").status, StepStatus::Completed);
    assert_eq!(step(&done, "p3").result.as_deref(), Some("r3"));
    assert_eq!(step(&done, "p2").status, StepStatus::Failed);
    assert_eq!(h.provider.calls().len(), 3);
    assert!(done.error.unwrap().contains("\"p2\""));
}

#[tokio::test]
async fn parallel_success_completes_every_step() {
    let h = harness(ScriptedProvider::new()).await;
    let steps = h.steps(&["x", "y", "z"]);
    let wf = h.insert(WorkflowType::Parallel, &steps).await;

    let done = h.run(wf.id).await;

    assert_eq!(done.status, WorkflowStatus::Completed);
    assert!(done.steps.0.iter().all(|s| s.result.as_deref() == Some("ok")));
}

// ---------------------------------------------------------------------------
// conditional
// ---------------------------------------------------------------------------

#[tokio::test]
async fn false_guard_skips_step() {
    let h = harness(ScriptedProvider::new().reply("check", Reply::text("all good"))).await;
    let mut steps = h.steps(&["check", "fix", "report"]);
    steps[1].guard = Some("check.result contains 'broken'".into());
    steps[2].guard = Some("fix.status == 'skipped'".into());
    let wf = h.insert(WorkflowType::Conditional, &steps).await;

    let done = h.run(wf.id).await;

    assert_eq!(done.status, WorkflowStatus::Completed);
    let fix = step(&done, "fix");
    assert_eq!(fix.status, StepStatus::Skipped);
    assert_eq!(fix.result, None);
    assert!(h.provider.call_for("fix").is_none());
    assert_eq!(step(&done, "report").status, StepStatus::Completed);
}

#[tokio::test]
async fn guard_error_fails_step_and_workflow() {
    let h = harness(ScriptedProvider::new()).await;
    let mut steps = h.steps(&["first", "second"]);
    steps[1].guard = Some("ghost.status == 'completed'".into());
    let wf = h.insert(WorkflowType::Conditional, &steps).await;

    let done = h.run(wf.id).await;

    assert_eq!(done.status, WorkflowStatus::Failed);
    let second = step(&done, "second");
    assert_eq!(second.status, StepStatus::Failed);
    let message = second.error.as_deref().unwrap();
    assert!(message.starts_with("guard evaluation failed:"), "{message}");
    assert!(h.provider.call_for("second").is_none());
}

// ---------------------------------------------------------------------------
// loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn loop_without_condition_runs_once() {
    let h = harness(ScriptedProvider::new()).await;
    let steps = h.steps(&["draft"]);
    let wf = h.insert(WorkflowType::Loop, &steps).await;

    let done = h.run(wf.id).await;

    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(done.iteration, 1);
    assert_eq!(h.provider.calls().len(), 1);
}

#[tokio::test]
async fn loop_repeats_until_iteration_ceiling() {
    let h = harness(ScriptedProvider::new().reply("review", Reply::text("needs work"))).await;
    let steps = h.steps(&["draft", "review"]);
    let wf = h
        .insert_loop(
            WorkflowType::Loop,
            &steps,
            Some("!(review.result contains 'APPROVED')"),
            Some(3),
        )
        .await;

    let done = h.run(wf.id).await;

    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(done.iteration, 3);
    assert_eq!(h.provider.calls().len(), 6);
}

#[tokio::test]
async fn loop_stops_when_condition_turns_false() {
    let h = harness(ScriptedProvider::new().reply("review", Reply::text("APPROVED"))).await;
    let steps = h.steps(&["draft", "review"]);
    let wf = h
        .insert_loop(
            WorkflowType::Loop,
            &steps,
            Some("!(review.result contains 'APPROVED')"),
            Some(5),
        )
        .await;

    let done = h.run(wf.id).await;

    assert_eq!(done.iteration, 1);
    assert_eq!(h.provider.calls().len(), 2);
}

#[tokio::test]
async fn loop_ceiling_is_capped() {
    let h = harness(ScriptedProvider::new()).await;
    let steps = h.steps(&["spin"]);
    let wf = h
        .insert_loop(WorkflowType::Loop, &steps, Some("true"), Some(50))
        .await;

    let done = h.run(wf.id).await;

    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(done.iteration, 10);
    assert_eq!(h.provider.calls().len(), 10);
}

#[tokio::test]
async fn later_iterations_see_previous_results() {
    let h = harness(
        ScriptedProvider::new()
            .reply("draft", Reply::text("v1"))
            .reply("review", Reply::text("again")),
    )
    .await;
    let mut steps = h.steps(&["review", "draft"]);
    // Review reads the previous iteration's draft through its context.
    steps[0].depends_on = vec![steps[1].id];
    let wf = h
        .insert_loop(WorkflowType::Loop, &steps, Some("true"), Some(2))
        .await;

    h.run(wf.id).await;

    let reviews: Vec<_> = h
        .provider
        .calls()
        .into_iter()
        .filter(|req| req.messages.last() == Some(&Message::user("review")))
        .collect();
    assert_eq!(reviews.len(), 2);
    assert_eq!(reviews[0].messages.len(), 1);
    assert_eq!(
        reviews[1].messages[0],
        Message::system("Context from previous steps:\ndraft: v1")
    );
}

// ---------------------------------------------------------------------------
// cancellation and validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_stops_scheduling_and_keeps_cancelled_status() {
    let gate = Gate::new();
    let h = harness(ScriptedProvider::new().with_gate(gate.clone())).await;
    let steps = h.steps(&["one", "two"]);
    let wf = h.insert(WorkflowType::Sequential, &steps).await;

    let handle = h.engine.run_workflow(wf.id).await.unwrap();
    gate.entered().await;
    let cancelled = h.engine.cancel_workflow(wf.id).await.unwrap();
    assert_eq!(cancelled.status, WorkflowStatus::Cancelled);
    gate.release();
    handle.await.unwrap();

    let done = workflows::get_workflow(&h.pool, wf.id).await.unwrap().unwrap();
    assert_eq!(done.status, WorkflowStatus::Cancelled);
    assert_eq!(step(&done, "one").status, StepStatus::Completed);
    assert_eq!(step(&done, "two").status, StepStatus::Pending);
    assert!(h.provider.call_for("two").is_none());

    let names = h.events.names();
    assert!(names.contains(&"workflow:cancelled"));
    assert!(!names.contains(&"workflow:completed"));
}

#[tokio::test]
async fn rerun_after_cancel_retires_the_cancelled_run() {
    let gate = Gate::new();
    let h = harness(ScriptedProvider::new().with_gate(gate.clone())).await;
    let steps = h.steps(&["a", "b"]);
    let wf = h.insert(WorkflowType::Sequential, &steps).await;

    let first = h.engine.run_workflow(wf.id).await.unwrap();
    gate.entered().await;
    h.engine.cancel_workflow(wf.id).await.unwrap();

    let second = h.engine.run_workflow(wf.id).await.unwrap();
    gate.entered().await;

    // Both runs are parked in step "a".
    gate.release();
    gate.release();
    first.await.unwrap();

    // Only the new run reaches step "b".
    gate.entered().await;
    gate.release();
    second.await.unwrap();

    let calls_for_b = h
        .provider
        .calls()
        .iter()
        .filter(|req| req.messages.last().is_some_and(|m| m.content == "b"))
        .count();
    assert_eq!(calls_for_b, 1);

    let done = workflows::get_workflow(&h.pool, wf.id).await.unwrap().unwrap();
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert!(done.steps.0.iter().all(|s| s.status == StepStatus::Completed));

    let names = h.events.names();
    assert_eq!(names.iter().filter(|n| **n == "workflow:completed").count(), 1);
    assert_eq!(names.iter().filter(|n| **n == "workflow:progress").count(), 2);
}

#[tokio::test]
async fn running_workflow_cannot_start_twice() {
    let gate = Gate::new();
    let h = harness(ScriptedProvider::new().with_gate(gate.clone())).await;
    let steps = h.steps(&["only"]);
    let wf = h.insert(WorkflowType::Sequential, &steps).await;

    let handle = h.engine.run_workflow(wf.id).await.unwrap();
    gate.entered().await;
    let err = h.engine.run_workflow(wf.id).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyRunning(id) if id == wf.id));

    gate.release();
    handle.await.unwrap();
    let done = workflows::get_workflow(&h.pool, wf.id).await.unwrap().unwrap();
    assert_eq!(done.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn finished_workflow_can_run_again_from_scratch() {
    let h = harness(ScriptedProvider::new()).await;
    let steps = h.steps(&["a"]);
    let wf = h.insert(WorkflowType::Sequential, &steps).await;

    h.run(wf.id).await;
    let again = h.run(wf.id).await;

    assert_eq!(again.status, WorkflowStatus::Completed);
    assert_eq!(h.provider.calls().len(), 2);
    let err = h.engine.cancel_workflow(wf.id).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyTerminal { kind: "workflow", .. }));
}

#[tokio::test]
async fn run_rejects_unknown_and_empty_workflows() {
    let h = harness(ScriptedProvider::new()).await;

    let err = h.engine.run_workflow(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, EngineError::WorkflowNotFound(_)));

    let empty = h.insert(WorkflowType::Sequential, &[]).await;
    let err = h.engine.run_workflow(empty.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let stored = workflows::get_workflow(&h.pool, empty.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Pending);
}

#[tokio::test]
async fn step_with_missing_agent_fails() {
    let h = harness(ScriptedProvider::new()).await;
    let ghost = Uuid::new_v4();
    let steps = vec![WorkflowStep::new(ghost, "orphan", "hello")];
    let wf = h.insert(WorkflowType::Sequential, &steps).await;

    let done = h.run(wf.id).await;

    assert_eq!(done.status, WorkflowStatus::Failed);
    assert_eq!(
        step(&done, "orphan").error.as_deref(),
        Some(format!("agent {ghost} not found").as_str())
    );
}
