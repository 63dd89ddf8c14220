mod agent_cmds;
mod config;
mod resolve;
mod run_cmd;
mod shutdown;
mod status_cmd;
mod workflow_cmds;

use clap::{Parser, Subcommand};

use loca_db::config::DbConfig;
use loca_db::pool;

use config::LocaConfig;

#[derive(Parser)]
#[command(name = "loca", about = "Run LLM agent tasks and multi-step workflows")]
struct Cli {
    /// Database URL (overrides LOCA_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a loca config file (no database required)
    Init {
        /// SQLite connection URL (defaults to a file under the data directory)
        #[arg(long)]
        db_url: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the database and run migrations
    DbInit,
    /// Agent management
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Send one prompt to an agent and stream the answer
    Run {
        /// Agent name or ID
        agent: String,
        /// Prompt text
        prompt: String,
    },
    /// Workflow management and execution
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Show agents and recent tasks, or one task in detail
    Status {
        /// Task ID to show (omit for an overview)
        task_id: Option<String>,
    },
    /// Cancel a pending or running task or workflow
    Cancel {
        /// Task or workflow ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Register a new agent
    Add {
        /// Unique agent name
        name: String,
        /// Backend: claude, openai, gemini, deepseek
        #[arg(long)]
        provider: String,
        /// Model identifier passed to the backend
        #[arg(long)]
        model: String,
        /// API key (defaults to the provider's env var, then the config file)
        #[arg(long)]
        api_key: Option<String>,
        /// Override the backend's base URL
        #[arg(long)]
        base_url: Option<String>,
        /// Maximum tokens to generate per request
        #[arg(long)]
        max_tokens: Option<i64>,
        /// Sampling temperature (0-2)
        #[arg(long)]
        temperature: Option<f64>,
        /// Persona sent as the system message
        #[arg(long)]
        system_prompt: Option<String>,
    },
    /// List all agents
    List,
}

#[derive(Subcommand)]
pub enum WorkflowCommands {
    /// Create a workflow from a TOML file
    Create {
        /// Path to the workflow TOML file
        file: String,
    },
    /// Run a workflow and follow it until it finishes
    Run {
        /// Workflow name or ID
        workflow: String,
    },
    /// Show a workflow with its steps
    Show {
        /// Workflow name or ID
        workflow: String,
    },
    /// List all workflows
    List,
}

/// Execute the `loca init` command: write config file.
fn cmd_init(db_url: Option<&str>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let db_url = db_url.map_or_else(DbConfig::default_url, str::to_string);
    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.clone(),
        },
        api_keys: Default::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `loca db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `loca db-init` command: create database and run migrations.
async fn cmd_db_init(resolved: &LocaConfig) -> anyhow::Result<()> {
    println!("Initializing loca database...");

    pool::ensure_database_dir(&resolved.db_config)?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let result = async {
        pool::run_migrations(&db_pool).await?;
        pool::table_counts(&db_pool).await
    }
    .await;
    db_pool.close().await;
    let counts = result?;

    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }
    println!("loca db-init complete.");
    Ok(())
}

/// Open the database and bring the schema up to date.
async fn open_pool(resolved: &LocaConfig) -> anyhow::Result<sqlx::SqlitePool> {
    pool::ensure_database_dir(&resolved.db_config)?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;
    Ok(db_pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Init { db_url, force } = &cli.command {
        return cmd_init(db_url.as_deref(), *force);
    }

    let resolved = LocaConfig::resolve(cli.database_url.as_deref())?;
    if let Commands::DbInit = cli.command {
        return cmd_db_init(&resolved).await;
    }

    let db_pool = open_pool(&resolved).await?;
    let result = match cli.command {
        Commands::Init { .. } | Commands::DbInit => Ok(()),
        Commands::Agent { command } => {
            agent_cmds::run_agent_command(command, &db_pool, &resolved).await
        }
        Commands::Run { agent, prompt } => run_cmd::run_prompt(&db_pool, &agent, &prompt).await,
        Commands::Workflow { command } => {
            workflow_cmds::run_workflow_command(command, &db_pool).await
        }
        Commands::Status { task_id } => status_cmd::run_status(&db_pool, task_id.as_deref()).await,
        Commands::Cancel { id } => status_cmd::run_cancel(&db_pool, &id).await,
    };
    db_pool.close().await;
    result
}
