//! Shared test utilities for loca integration tests.
//!
//! - [`create_test_db`]: a private, migrated in-memory SQLite database.
//! - [`ScriptedProvider`]: a stub LLM backend whose replies are keyed by
//!   prompt, with an optional [`Gate`] to hold a call open.
//! - [`RecordingEvents`]: an event sink that keeps everything it receives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::Notify;
use uuid::Uuid;

use loca_core::events::{EngineEvent, EventSink};
use loca_core::provider::{
    CompletionRequest, CompletionResponse, Provider, ProviderError, ProviderRegistry, Role, Usage,
};
use loca_db::config::DbConfig;
use loca_db::models::{Agent, ProviderKind, Task, Workflow};
use loca_db::pool;
use loca_db::queries::agents::{self, NewAgent};
use loca_db::queries::{tasks, workflows};

/// Backend name reported by [`ScriptedProvider`] errors.
pub const STUB_BACKEND: &str = "stub";

/// Create a private in-memory database with migrations applied.
pub async fn create_test_db() -> SqlitePool {
    let pool = pool::create_pool(&DbConfig::new(DbConfig::MEMORY_URL))
        .await
        .expect("failed to open in-memory database");
    pool::run_migrations(&pool)
        .await
        .expect("failed to run migrations");
    pool
}

/// Insert an idle Claude agent named `name` with API key `<name>-key`.
pub async fn insert_test_agent(pool: &SqlitePool, name: &str) -> Agent {
    let api_key = format!("{name}-key");
    agents::insert_agent(
        pool,
        &NewAgent {
            name,
            provider: ProviderKind::Claude,
            api_key: &api_key,
            base_url: None,
            model: "stub-model",
            max_tokens: None,
            temperature: None,
            system_prompt: None,
        },
    )
    .await
    .expect("failed to insert test agent")
}

/// Make `registry` hand out `provider` for `agent`.
pub fn register_stub(registry: &ProviderRegistry, agent: &Agent, provider: Arc<ScriptedProvider>) {
    registry.register(agent.provider, &agent.api_key, agent.base_url.as_deref(), provider);
}

/// Poll until the task reaches a terminal status.
pub async fn wait_for_task(pool: &SqlitePool, id: Uuid) -> Task {
    for _ in 0..500 {
        let task = tasks::get_task(pool, id)
            .await
            .expect("failed to read task")
            .expect("task not found");
        if task.status.is_terminal() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} did not finish");
}

/// Poll until the workflow reaches a terminal status.
pub async fn wait_for_workflow(pool: &SqlitePool, id: Uuid) -> Workflow {
    for _ in 0..500 {
        let workflow = workflows::get_workflow(pool, id)
            .await
            .expect("failed to read workflow")
            .expect("workflow not found");
        if workflow.status.is_terminal() {
            return workflow;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workflow {id} did not finish");
}

// ---------------------------------------------------------------------------
// ScriptedProvider
// ---------------------------------------------------------------------------

/// What the stub answers for one prompt.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Stream these fragments, then complete with their concatenation.
    Deltas(Vec<String>),
    /// Fail with an `api` error carrying this message.
    Fail(String),
}

impl Reply {
    pub fn text(content: &str) -> Self {
        Self::Deltas(vec![content.to_owned()])
    }
}

/// Holds a call open until released: a stream after its first fragment,
/// a blocking completion before it returns.
#[derive(Debug, Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait until a call is parked at the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the longest-parked call continue.
    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn park(&self) {
        // Register as a waiter before announcing, so a release issued right
        // after `entered` returns is never lost.
        let released = self.release.notified();
        tokio::pin!(released);
        released.as_mut().enable();
        self.entered.notify_one();
        released.await;
    }
}

/// Stub backend. Replies are chosen by the request's last user message;
/// unknown prompts get `"ok"`.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<HashMap<String, Reply>>,
    usage: Option<Usage>,
    gate: Option<Arc<Gate>>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `prompt` with `reply`.
    pub fn reply(self, prompt: &str, reply: Reply) -> Self {
        lock(&self.replies).insert(prompt.to_owned(), reply);
        self
    }

    /// Report `usage` with every successful response.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Park every call at `gate`.
    pub fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Every request received so far, in arrival order.
    pub fn calls(&self) -> Vec<CompletionRequest> {
        lock(&self.calls).clone()
    }

    /// The request whose final user message was `prompt`.
    pub fn call_for(&self, prompt: &str) -> Option<CompletionRequest> {
        lock(&self.calls)
            .iter()
            .find(|req| last_user_message(req) == prompt)
            .cloned()
    }

    fn plan(&self, request: &CompletionRequest) -> Reply {
        lock(&self.calls).push(request.clone());
        lock(&self.replies)
            .get(last_user_message(request))
            .cloned()
            .unwrap_or_else(|| Reply::text("ok"))
    }

    fn response(&self, request: &CompletionRequest, content: String) -> CompletionResponse {
        CompletionResponse {
            content,
            model: request.model.clone(),
            usage: self.usage,
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        STUB_BACKEND
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let reply = self.plan(request);
        if let Some(gate) = &self.gate {
            gate.park().await;
        }
        match reply {
            Reply::Deltas(parts) => Ok(self.response(request, parts.concat())),
            Reply::Fail(message) => Err(ProviderError::api(STUB_BACKEND, message)),
        }
    }

    async fn stream_complete(
        &self,
        request: &CompletionRequest,
        on_delta: &mut (dyn for<'d> FnMut(&'d str) + Send),
    ) -> Result<CompletionResponse, ProviderError> {
        let parts = match self.plan(request) {
            Reply::Deltas(parts) => parts,
            Reply::Fail(message) => return Err(ProviderError::api(STUB_BACKEND, message)),
        };

        let mut content = String::new();
        for (i, part) in parts.iter().enumerate() {
            on_delta(part);
            content.push_str(part);
            if i == 0 {
                if let Some(gate) = &self.gate {
                    gate.park().await;
                }
            }
            tokio::task::yield_now().await;
        }
        Ok(self.response(request, content))
    }
}

fn last_user_message(request: &CompletionRequest) -> &str {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map_or("", |m| m.content.as_str())
}

// ---------------------------------------------------------------------------
// RecordingEvents
// ---------------------------------------------------------------------------

/// Event sink that records every published event.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        lock(&self.events).clone()
    }

    /// Event names in publish order, e.g. `["task:started", ...]`.
    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.events).iter().map(EngineEvent::name).collect()
    }
}

impl EventSink for RecordingEvents {
    fn publish(&self, event: EngineEvent) {
        lock(&self.events).push(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
