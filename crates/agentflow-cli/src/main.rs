// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Agentflow CLI.

use agentflow_core::workflow::{Step, Workflow};
use agentflow_engine::{EngineConfig, WorkflowService};
use agentflow_llm::{GatewayConfig, GeminiProvider, LlmProvider};
use agentflow_state::{
    MemoryStore, SqliteStore, StateStore, StateStoreRef, StatusStream, UsageStore, UsageStoreRef,
};
use agentflow_tools::{HttpRequestTool, ToolRegistry};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Deserialize;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agentflow")]
#[command(version, about = "Adaptive workflow engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// SQLite database path (in-memory store when omitted)
    #[arg(long, global = true)]
    sqlite: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and execute a workflow for an intent
    Run {
        /// The user intent, e.g. "Finde Jobs als Entwickler in Berlin"
        #[arg(value_name = "INTENT")]
        intent: String,

        /// Session id (generated when omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// User the workflow runs on behalf of
        #[arg(short, long, default_value = "local")]
        user: String,
    },

    /// Plan a workflow and print it without executing
    Plan {
        /// The user intent
        #[arg(value_name = "INTENT")]
        intent: String,
    },

    /// Validate a plan file (YAML or JSON)
    Validate {
        /// Path to plan file
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Show the status of a session
    Status {
        /// Session id
        #[arg(value_name = "SESSION")]
        session: String,
    },

    /// Token governance
    Tokens {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Check whether a call of the given size would be admitted
    Check {
        #[arg(short, long, default_value = "local")]
        user: String,

        /// Estimated tokens of the planned call
        #[arg(short, long)]
        estimate: u64,
    },

    /// Show recent usage records
    Usage {
        #[arg(short, long, default_value = "local")]
        user: String,

        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Show the configured limits
    Limits {
        #[arg(short, long, default_value = "local")]
        user: String,
    },
}

/// Trait-object views of one storage backend.
struct Stores {
    state: StateStoreRef,
    status: Arc<StatusStream>,
    usage: UsageStoreRef,
}

async fn open_stores(sqlite: Option<&str>) -> Result<Stores> {
    match sqlite {
        Some(path) => {
            let url = format!("sqlite://{}?mode=rwc", path);
            let store = Arc::new(
                SqliteStore::connect(&url)
                    .await
                    .with_context(|| format!("Failed to open database: {}", path))?,
            );
            store.migrate().await.context("Failed to run migrations")?;
            Ok(Stores {
                state: store.clone(),
                status: Arc::new(StatusStream::new(store.clone())),
                usage: store,
            })
        }
        None => {
            let store = Arc::new(MemoryStore::new());
            Ok(Stores {
                state: store.clone(),
                status: Arc::new(StatusStream::new(store.clone())),
                usage: store,
            })
        }
    }
}

fn default_registry() -> Arc<ToolRegistry> {
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(HttpRequestTool::new()));
    registry
}

fn provider_from_env() -> Result<Arc<dyn LlmProvider>> {
    let provider = GeminiProvider::from_env()
        .context("No model endpoint available. Set the GEMINI_API_KEY environment variable.")?;
    info!("Registered Gemini provider");
    Ok(Arc::new(provider))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("agentflow={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let sqlite = cli.sqlite.clone();
    let result = match cli.command {
        Commands::Run { intent, session, user } => {
            run_workflow(&intent, session, &user, sqlite.as_deref()).await
        }
        Commands::Plan { intent } => plan_workflow(&intent).await,
        Commands::Validate { file } => validate_plan(&file),
        Commands::Status { session } => show_status(&session, sqlite.as_deref()).await,
        Commands::Tokens { command } => run_tokens(command, sqlite.as_deref()).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn build_service(sqlite: Option<&str>) -> Result<(WorkflowService, Stores)> {
    let stores = open_stores(sqlite).await?;
    let provider = provider_from_env()?;

    let service = WorkflowService::new(
        stores.state.clone(),
        stores.status.clone(),
        stores.usage.clone(),
        default_registry(),
        provider,
        GatewayConfig::default(),
        EngineConfig::default(),
    );

    Ok((service, stores))
}

async fn run_workflow(
    intent: &str,
    session: Option<String>,
    user: &str,
    sqlite: Option<&str>,
) -> Result<()> {
    println!("{} {}", "Intent:".cyan().bold(), intent);

    let (service, _stores) = build_service(sqlite).await?;

    let created = service
        .create(intent, session, user)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    println!(
        "{} {} ({} steps, session {})",
        "✓ Workflow created:".green().bold(),
        created.workflow_id,
        created.steps_count,
        created.session_id
    );

    // Stream status events until the workflow reaches a terminal state.
    let mut cursor = None;
    loop {
        let events = service
            .events_since(&created.session_id, cursor)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        for event in &events {
            println!(
                "  {} {}",
                event.timestamp.format("%H:%M:%S").to_string().dimmed(),
                event.message
            );
            cursor = Some(event.timestamp);
        }

        let status = service
            .status(&created.session_id)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        match status.status.as_str() {
            "completed" => {
                println!("{}", "✓ Workflow completed successfully".green().bold());
                println!("\n{}", "Results:".cyan().bold());
                for step in &status.steps {
                    if let Some(result) = &step.result {
                        println!(
                            "  {} {}",
                            format!("step {}:", step.number).cyan(),
                            serde_json::to_string_pretty(result)
                                .unwrap_or_else(|_| format!("{:?}", result))
                        );
                    }
                }
                return Ok(());
            }
            "failed" => {
                let failing = status.steps.iter().find(|s| s.error.is_some());
                let reason = failing
                    .and_then(|s| s.error.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                anyhow::bail!("Workflow failed: {}", reason);
            }
            "cancelled" => anyhow::bail!("Workflow was cancelled"),
            "waiting_confirmation" => {
                println!(
                    "{}",
                    "Workflow is waiting for confirmation (use the confirm endpoint)".yellow()
                );
                return Ok(());
            }
            _ => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }
}

async fn plan_workflow(intent: &str) -> Result<()> {
    use agentflow_engine::Planner;
    use agentflow_llm::LlmGateway;

    println!("{} {}", "Planning for intent:".cyan().bold(), intent);

    let provider = provider_from_env()?;
    let gateway = Arc::new(LlmGateway::new(provider, GatewayConfig::default()));
    let planner = Planner::new(gateway, default_registry());

    let workflow = planner
        .plan(intent, "plan-preview")
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    println!("{}", "✓ Plan is valid".green().bold());
    println!("{}", serde_json::to_string_pretty(&workflow)?);
    Ok(())
}

/// Plan file as accepted by `validate`.
#[derive(Debug, Deserialize)]
struct PlanFile {
    #[serde(default)]
    intent: String,
    steps: Vec<Step>,
}

fn validate_plan(file_path: &str) -> Result<()> {
    println!("{} {}", "Validating plan:".cyan().bold(), file_path);

    let content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read plan file: {}", file_path))?;

    // YAML parses JSON too.
    let plan: PlanFile = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse plan file: {}", file_path))?;

    let workflow = Workflow::new("validation", plan.intent, plan.steps);
    workflow
        .validate()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .context("Plan validation failed")?;

    println!("{}", "✓ Plan is valid".green().bold());
    println!("  Steps: {}", workflow.steps.len());
    Ok(())
}

async fn show_status(session: &str, sqlite: Option<&str>) -> Result<()> {
    let stores = open_stores(sqlite).await?;

    let workflow = stores
        .state
        .find_by_session(session)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?
        .with_context(|| format!("No workflow for session {}", session))?;

    println!("{} {}", "Session:".cyan().bold(), session);
    println!("  Status: {}", workflow.status.as_str());
    println!("  Steps:");
    for step in &workflow.steps {
        let marker = match step.status.as_str() {
            "completed" => "●".green(),
            "skipped" => "○".yellow(),
            "failed" => "●".red(),
            "running" => "◐".cyan(),
            _ => "○".dimmed(),
        };
        println!(
            "    {} {} [{}] {}",
            marker,
            step.step_number,
            step.status.as_str(),
            step.description
        );
        if let Some(error) = &step.error {
            println!("      {}", error.red());
        }
    }
    Ok(())
}

async fn run_tokens(command: TokenCommands, sqlite: Option<&str>) -> Result<()> {
    let stores = open_stores(sqlite).await?;
    let limiter = agentflow_engine::TokenLimiter::new(stores.usage.clone());

    match command {
        TokenCommands::Check { user, estimate } => {
            let check = limiter.check(&user, estimate).await;
            if check.allowed {
                println!("{}", "✓ Call would be admitted".green().bold());
                for warning in &check.warnings {
                    println!(
                        "  {} {} window is above the warning threshold",
                        "!".yellow().bold(),
                        warning
                    );
                }
            } else {
                println!(
                    "{} limit reached in the {} window",
                    "✗ Call would be rejected:".red().bold(),
                    check.exceeded_window.as_deref().unwrap_or("unknown")
                );
            }
        }
        TokenCommands::Usage { user, limit } => {
            let records = stores
                .usage
                .usage_records(&user, limit)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            println!("{} {} records", "Usage:".cyan().bold(), records.len());
            for record in records {
                println!(
                    "  {} {} {} prompt={} completion={} cost={}µ",
                    record.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                    record.model.cyan(),
                    record.agent_type,
                    record.prompt_tokens,
                    record.completion_tokens,
                    record.cost_micros
                );
            }
        }
        TokenCommands::Limits { user } => {
            let settings = stores
                .usage
                .settings(&user)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }
    Ok(())
}
