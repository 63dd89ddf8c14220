//! Integration tests for workflow queries and the embedded steps column.

use loca_db::models::{
    ProviderKind, StepStatus, WorkflowStatus, WorkflowStep, WorkflowType,
};
use loca_db::queries::agents::{self, NewAgent};
use loca_db::queries::workflows::{self, NewWorkflow};
use uuid::Uuid;

async fn agent_id(pool: &sqlx::SqlitePool) -> Uuid {
    agents::insert_agent(
        pool,
        &NewAgent {
            name: "wf-agent",
            provider: ProviderKind::Openai,
            api_key: "sk-test",
            base_url: None,
            model: "gpt-4o-mini",
            max_tokens: None,
            temperature: Some(0.2),
            system_prompt: None,
        },
    )
    .await
    .expect("insert agent")
    .id
}

fn two_steps(agent: Uuid) -> Vec<WorkflowStep> {
    let a = WorkflowStep::new(agent, "outline", "Outline an essay");
    let mut b = WorkflowStep::new(agent, "draft", "Write the essay");
    b.depends_on = vec![a.id];
    vec![a, b]
}

#[tokio::test]
async fn insert_and_get_workflow_roundtrips_steps() {
    let pool = loca_test_utils::create_test_db().await;
    let steps = two_steps(agent_id(&pool).await);

    let wf = workflows::insert_workflow(
        &pool,
        &NewWorkflow {
            name: "essay",
            description: Some("two step essay"),
            workflow_type: WorkflowType::Sequential,
            steps: &steps,
            loop_while: None,
            max_iterations: None,
        },
    )
    .await
    .expect("insert_workflow should succeed");

    assert_eq!(wf.status, WorkflowStatus::Pending);
    assert_eq!(wf.iteration, 0);
    assert!(wf.current_step_index.is_none());

    let fetched = workflows::get_workflow(&pool, wf.id).await.unwrap().unwrap();
    assert_eq!(fetched.steps.0, steps);
    assert_eq!(fetched.steps[1].depends_on, vec![steps[0].id]);
    assert_eq!(fetched.workflow_type, WorkflowType::Sequential);
}

#[tokio::test]
async fn start_rejects_running_workflow() {
    let pool = loca_test_utils::create_test_db().await;
    let steps = two_steps(agent_id(&pool).await);
    let wf = workflows::insert_workflow(
        &pool,
        &NewWorkflow {
            name: "wf",
            description: None,
            workflow_type: WorkflowType::Parallel,
            steps: &steps,
            loop_while: None,
            max_iterations: None,
        },
    )
    .await
    .unwrap();

    let run = Uuid::new_v4();
    assert!(workflows::start_workflow(&pool, wf.id, run, &steps).await.unwrap());
    assert!(!workflows::start_workflow(&pool, wf.id, Uuid::new_v4(), &steps).await.unwrap());

    let row = workflows::get_workflow(&pool, wf.id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkflowStatus::Running);
    assert_eq!(row.run_id, Some(run));
    assert!(row.started_at.is_some());
}

#[tokio::test]
async fn step_updates_and_progress_persist() {
    let pool = loca_test_utils::create_test_db().await;
    let mut steps = two_steps(agent_id(&pool).await);
    let wf = workflows::insert_workflow(
        &pool,
        &NewWorkflow {
            name: "wf",
            description: None,
            workflow_type: WorkflowType::Loop,
            steps: &steps,
            loop_while: Some("draft.result contains 'TODO'"),
            max_iterations: Some(3),
        },
    )
    .await
    .unwrap();
    let run = Uuid::new_v4();
    workflows::start_workflow(&pool, wf.id, run, &steps).await.unwrap();

    steps[0].status = StepStatus::Completed;
    steps[0].result = Some("1. intro".into());
    assert!(workflows::update_workflow_steps(&pool, wf.id, run, &steps).await.unwrap());
    assert!(workflows::set_workflow_progress(&pool, wf.id, run, Some(1), 2).await.unwrap());

    let row = workflows::get_workflow(&pool, wf.id).await.unwrap().unwrap();
    assert_eq!(row.steps[0].status, StepStatus::Completed);
    assert_eq!(row.steps[0].result.as_deref(), Some("1. intro"));
    assert_eq!(row.current_step_index, Some(1));
    assert_eq!(row.iteration, 2);
    assert_eq!(row.loop_while.as_deref(), Some("draft.result contains 'TODO'"));
    assert_eq!(row.max_iterations, Some(3));
}

#[tokio::test]
async fn finish_after_cancel_is_rejected() {
    let pool = loca_test_utils::create_test_db().await;
    let steps = two_steps(agent_id(&pool).await);
    let wf = workflows::insert_workflow(
        &pool,
        &NewWorkflow {
            name: "wf",
            description: None,
            workflow_type: WorkflowType::Sequential,
            steps: &steps,
            loop_while: None,
            max_iterations: None,
        },
    )
    .await
    .unwrap();
    let run = Uuid::new_v4();
    workflows::start_workflow(&pool, wf.id, run, &steps).await.unwrap();

    let cancelled = workflows::cancel_workflow(&pool, wf.id).await.unwrap();
    assert_eq!(cancelled.map(|w| w.status), Some(WorkflowStatus::Cancelled));

    let wrote = workflows::finish_workflow(&pool, wf.id, run, WorkflowStatus::Completed, None)
        .await
        .unwrap();
    assert!(!wrote);
    assert_eq!(
        workflows::get_workflow_status(&pool, wf.id).await.unwrap(),
        Some(WorkflowStatus::Cancelled)
    );

    // Already terminal: a second cancel is a no-op.
    assert!(workflows::cancel_workflow(&pool, wf.id).await.unwrap().is_none());
}

#[tokio::test]
async fn finish_records_error() {
    let pool = loca_test_utils::create_test_db().await;
    let steps = two_steps(agent_id(&pool).await);
    let wf = workflows::insert_workflow(
        &pool,
        &NewWorkflow {
            name: "wf",
            description: None,
            workflow_type: WorkflowType::Sequential,
            steps: &steps,
            loop_while: None,
            max_iterations: None,
        },
    )
    .await
    .unwrap();
    let run = Uuid::new_v4();
    workflows::start_workflow(&pool, wf.id, run, &steps).await.unwrap();

    assert!(
        workflows::finish_workflow(
            &pool,
            wf.id,
            run,
            WorkflowStatus::Failed,
            Some("step outline failed")
        )
        .await
        .unwrap()
    );

    let row = workflows::get_workflow(&pool, wf.id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkflowStatus::Failed);
    assert_eq!(row.error.as_deref(), Some("step outline failed"));
    assert!(row.completed_at.is_some());

    let listed = workflows::list_workflows(&pool).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn restarted_workflow_ignores_writes_from_older_run() {
    let pool = loca_test_utils::create_test_db().await;
    let mut steps = two_steps(agent_id(&pool).await);
    let wf = workflows::insert_workflow(
        &pool,
        &NewWorkflow {
            name: "wf",
            description: None,
            workflow_type: WorkflowType::Sequential,
            steps: &steps,
            loop_while: None,
            max_iterations: None,
        },
    )
    .await
    .unwrap();

    let first = Uuid::new_v4();
    workflows::start_workflow(&pool, wf.id, first, &steps).await.unwrap();
    workflows::cancel_workflow(&pool, wf.id).await.unwrap();
    let second = Uuid::new_v4();
    assert!(workflows::start_workflow(&pool, wf.id, second, &steps).await.unwrap());

    steps[0].status = StepStatus::Completed;
    steps[0].result = Some("stale".into());
    assert!(!workflows::update_workflow_steps(&pool, wf.id, first, &steps).await.unwrap());
    assert!(!workflows::set_workflow_progress(&pool, wf.id, first, Some(1), 1).await.unwrap());
    assert!(
        !workflows::finish_workflow(&pool, wf.id, first, WorkflowStatus::Completed, None)
            .await
            .unwrap()
    );

    let row = workflows::get_workflow(&pool, wf.id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkflowStatus::Running);
    assert_eq!(row.run_id, Some(second));
    assert_eq!(row.steps[0].status, StepStatus::Pending);
    assert_eq!(
        workflows::get_run_state(&pool, wf.id).await.unwrap(),
        Some((WorkflowStatus::Running, Some(second)))
    );
}
