//! CLI handlers for `loca agent` subcommands.
//!
//! Implements:
//! - `loca agent add <name>` -- register an agent bound to a provider and model
//! - `loca agent list`       -- list agents with their token usage

use anyhow::{Context, Result, bail};
use sqlx::SqlitePool;

use loca_db::models::ProviderKind;
use loca_db::queries::{agents, token_usage};

use crate::AgentCommands;
use crate::config::{LocaConfig, api_key_env};

// -----------------------------------------------------------------------
// Public entry point
// -----------------------------------------------------------------------

/// Dispatch an `AgentCommands` variant to the appropriate handler.
pub async fn run_agent_command(
    command: AgentCommands,
    pool: &SqlitePool,
    config: &LocaConfig,
) -> Result<()> {
    match command {
        AgentCommands::Add {
            name,
            provider,
            model,
            api_key,
            base_url,
            max_tokens,
            temperature,
            system_prompt,
        } => {
            cmd_add(
                pool,
                config,
                AddParams {
                    name,
                    provider,
                    model,
                    api_key,
                    base_url,
                    max_tokens,
                    temperature,
                    system_prompt,
                },
            )
            .await
        }
        AgentCommands::List => cmd_list(pool).await,
    }
}

// -----------------------------------------------------------------------
// loca agent add
// -----------------------------------------------------------------------

/// Grouped parameters for the `add` command to avoid too many function args.
struct AddParams {
    name: String,
    provider: String,
    model: String,
    api_key: Option<String>,
    base_url: Option<String>,
    max_tokens: Option<i64>,
    temperature: Option<f64>,
    system_prompt: Option<String>,
}

async fn cmd_add(pool: &SqlitePool, config: &LocaConfig, params: AddParams) -> Result<()> {
    let provider: ProviderKind = params.provider.parse().map_err(|_| {
        anyhow::anyhow!(
            "invalid provider {:?}; expected one of: claude, openai, gemini, deepseek",
            params.provider,
        )
    })?;

    if let Some(t) = params.temperature {
        if !(0.0..=2.0).contains(&t) {
            bail!("temperature must be between 0 and 2, got {t}");
        }
    }
    if let Some(n) = params.max_tokens {
        if n < 1 {
            bail!("max-tokens must be positive, got {n}");
        }
    }

    let Some(api_key) = config.api_key(provider, params.api_key.as_deref()) else {
        bail!(
            "no API key for {provider}; pass --api-key, set {}, or add it under [api_keys] in the config file",
            api_key_env(provider),
        );
    };

    let agent = agents::insert_agent(
        pool,
        &agents::NewAgent {
            name: &params.name,
            provider,
            api_key: &api_key,
            base_url: params.base_url.as_deref(),
            model: &params.model,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            system_prompt: params.system_prompt.as_deref(),
        },
    )
    .await
    .with_context(|| {
        format!(
            "failed to add agent {:?} (is the name already taken?)",
            params.name,
        )
    })?;

    println!("Agent created:");
    println!("  ID:       {}", agent.id);
    println!("  Name:     {}", agent.name);
    println!("  Provider: {}", agent.provider);
    println!("  Model:    {}", agent.model);
    if let Some(url) = &agent.base_url {
        println!("  Base URL: {url}");
    }

    Ok(())
}

// -----------------------------------------------------------------------
// loca agent list
// -----------------------------------------------------------------------

async fn cmd_list(pool: &SqlitePool) -> Result<()> {
    let all = agents::list_agents(pool).await?;

    if all.is_empty() {
        println!("No agents registered. Add one with `loca agent add`.");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<10} {:<28} {:<8} {:>10}",
        "ID", "NAME", "PROVIDER", "MODEL", "STATUS", "TOKENS"
    );
    println!("{}", "-".repeat(119));

    for agent in &all {
        let usage = token_usage::usage_totals_for_agent(pool, agent.id).await?;
        println!(
            "{:<38} {:<20} {:<10} {:<28} {:<8} {:>10}",
            agent.id,
            truncate(&agent.name, 20),
            agent.provider,
            truncate(&agent.model, 28),
            agent.status,
            usage.total_tokens,
        );
    }

    Ok(())
}

/// Shorten `s` to at most `max` characters, marking the cut with "...".
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}
