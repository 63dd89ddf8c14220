//! Workflow definition files.
//!
//! Parses a workflow TOML file into a [`WorkflowToml`] and validates:
//! - The workflow type is a known topology.
//! - There is at least one step and step names are unique.
//! - `depends_on` references name an earlier step, so array order is
//!   always a valid execution order.
//! - Guards and `loop_while` parse and only reference known steps.
//! - `loop_while` / `max_iterations` only appear on loop workflows.
//!
//! ```toml
//! [workflow]
//! name = "essay"
//! type = "sequential"
//!
//! [[steps]]
//! name = "outline"
//! agent = "writer"
//! prompt = "Outline an essay about rivers."
//!
//! [[steps]]
//! name = "draft"
//! agent = "writer"
//! prompt = "Write the essay."
//! depends_on = ["outline"]
//! ```

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use loca_db::models::{Agent, Workflow, WorkflowStep, WorkflowType};
use loca_db::queries::agents as agent_queries;
use loca_db::queries::workflows::{self as workflow_queries, NewWorkflow};

use super::guard::{Guard, GuardError};

/// Top-level structure of a workflow TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowToml {
    pub workflow: WorkflowMeta,
    #[serde(default)]
    pub steps: Vec<StepToml>,
}

/// Workflow-level metadata in `[workflow]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowMeta {
    pub name: String,
    /// "sequential", "parallel", "conditional" or "loop".
    #[serde(rename = "type", default = "default_workflow_type")]
    pub workflow_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Loop continuation condition, checked after each iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_while: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<i64>,
}

/// A single `[[steps]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepToml {
    /// Unique within the workflow; used in `depends_on` and guards.
    pub name: String,
    /// Agent id or agent name.
    pub agent: String,
    pub prompt: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
}

fn default_workflow_type() -> String {
    "sequential".to_string()
}

impl WorkflowToml {
    /// The validated topology. Only meaningful after [`parse_workflow_toml`].
    pub fn workflow_type(&self) -> Result<WorkflowType, WorkflowParseError> {
        self.workflow
            .workflow_type
            .parse()
            .map_err(|_| WorkflowParseError::InvalidType(self.workflow.workflow_type.clone()))
    }
}

/// Errors that can occur during workflow parsing and validation.
#[derive(Debug, Error)]
pub enum WorkflowParseError {
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("workflow must contain at least one step")]
    NoSteps,

    #[error("duplicate step name: {0:?}")]
    DuplicateStepName(String),

    #[error("invalid workflow type {0:?} (expected sequential, parallel, conditional, or loop)")]
    InvalidType(String),

    #[error("step {step:?} depends on unknown step {dependency:?}")]
    UnknownDependency { step: String, dependency: String },

    #[error("step {step:?} depends on {dependency:?}, which is not declared before it")]
    ForwardDependency { step: String, dependency: String },

    #[error("invalid guard on step {step:?}: {source}")]
    InvalidGuard {
        step: String,
        #[source]
        source: GuardError,
    },

    #[error("invalid loop_while: {0}")]
    InvalidLoopCondition(#[source] GuardError),

    #[error("{field} is only allowed on loop workflows")]
    LoopOnly { field: &'static str },

    #[error("max_iterations must be at least 1, got {0}")]
    InvalidMaxIterations(i64),
}

/// Parse and validate a workflow TOML string.
pub fn parse_workflow_toml(content: &str) -> Result<WorkflowToml, WorkflowParseError> {
    let def: WorkflowToml = toml::from_str(content)?;
    validate(&def)?;
    Ok(def)
}

fn validate(def: &WorkflowToml) -> Result<(), WorkflowParseError> {
    let workflow_type = def.workflow_type()?;

    if def.steps.is_empty() {
        return Err(WorkflowParseError::NoSteps);
    }

    let mut position: HashMap<&str, usize> = HashMap::new();
    for (i, step) in def.steps.iter().enumerate() {
        if position.insert(step.name.as_str(), i).is_some() {
            return Err(WorkflowParseError::DuplicateStepName(step.name.clone()));
        }
    }

    for (i, step) in def.steps.iter().enumerate() {
        for dep in &step.depends_on {
            match position.get(dep.as_str()) {
                None => {
                    return Err(WorkflowParseError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    });
                }
                Some(&j) if j >= i => {
                    return Err(WorkflowParseError::ForwardDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        if let Some(source) = &step.guard {
            let invalid = |source| WorkflowParseError::InvalidGuard {
                step: step.name.clone(),
                source,
            };
            let guard = Guard::parse(source).map_err(invalid)?;
            check_references(&guard, &position).map_err(invalid)?;
        }
    }

    if workflow_type != WorkflowType::Loop {
        if def.workflow.loop_while.is_some() {
            return Err(WorkflowParseError::LoopOnly {
                field: "loop_while",
            });
        }
        if def.workflow.max_iterations.is_some() {
            return Err(WorkflowParseError::LoopOnly {
                field: "max_iterations",
            });
        }
    }

    if let Some(n) = def.workflow.max_iterations {
        if n < 1 {
            return Err(WorkflowParseError::InvalidMaxIterations(n));
        }
    }

    if let Some(source) = &def.workflow.loop_while {
        let guard = Guard::parse(source).map_err(WorkflowParseError::InvalidLoopCondition)?;
        check_references(&guard, &position).map_err(WorkflowParseError::InvalidLoopCondition)?;
    }

    Ok(())
}

fn check_references(guard: &Guard, known: &HashMap<&str, usize>) -> Result<(), GuardError> {
    match guard
        .referenced_steps()
        .into_iter()
        .find(|name| !known.contains_key(name))
    {
        Some(name) => Err(GuardError::UnknownStep(name.to_owned())),
        None => Ok(()),
    }
}

/// Persist a validated definition as a `pending` workflow.
///
/// Agents are resolved by id first, then by name. Guard and loop
/// expressions keep referring to steps by name.
pub async fn create_workflow(pool: &SqlitePool, def: &WorkflowToml) -> Result<Workflow> {
    let workflow_type = def.workflow_type()?;

    let mut agents: HashMap<&str, Agent> = HashMap::new();
    for step in &def.steps {
        if !agents.contains_key(step.agent.as_str()) {
            let agent = resolve_agent(pool, &step.agent)
                .await?
                .with_context(|| format!("step {:?}: agent {:?} not found", step.name, step.agent))?;
            agents.insert(step.agent.as_str(), agent);
        }
    }

    let mut ids: HashMap<&str, Uuid> = HashMap::new();
    let mut steps = Vec::with_capacity(def.steps.len());
    for step in &def.steps {
        let agent_id = agents[step.agent.as_str()].id;
        let mut built = WorkflowStep::new(agent_id, &step.name, &step.prompt);
        built.guard = step.guard.clone();
        built.depends_on = step
            .depends_on
            .iter()
            .map(|dep| {
                ids.get(dep.as_str())
                    .copied()
                    .with_context(|| format!("step {:?} depends on unknown step {dep:?}", step.name))
            })
            .collect::<Result<_>>()?;
        ids.insert(step.name.as_str(), built.id);
        steps.push(built);
    }

    let workflow = workflow_queries::insert_workflow(
        pool,
        &NewWorkflow {
            name: &def.workflow.name,
            description: def.workflow.description.as_deref(),
            workflow_type,
            steps: &steps,
            loop_while: def.workflow.loop_while.as_deref(),
            max_iterations: def.workflow.max_iterations,
        },
    )
    .await?;

    tracing::info!(
        workflow_id = %workflow.id,
        name = %workflow.name,
        steps = steps.len(),
        "workflow created"
    );
    Ok(workflow)
}

async fn resolve_agent(pool: &SqlitePool, reference: &str) -> Result<Option<Agent>> {
    if let Ok(id) = reference.parse::<Uuid>() {
        if let Some(agent) = agent_queries::get_agent(pool, id).await? {
            return Ok(Some(agent));
        }
    }
    agent_queries::get_agent_by_name(pool, reference).await
}
