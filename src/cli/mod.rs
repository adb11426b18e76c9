mod config;

pub use config::{CaseflowConfig, StoreConfig, TaskConfig};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use crate::engine::TaskRunner;
use crate::engine::types::{RawCase, RunStatus, TaskRun};
use crate::rules::{TaskDefinition, TaskRegistry};
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::store::http::HttpCaseStore;
use crate::store::memory::MemoryCaseStore;
use crate::store::{CaseStore, CredentialProvider, EnvCredentials, EventSubmitter, StaticCredentials};

#[derive(Parser)]
#[command(name = "caseflow", version, about = "Scheduled case-advancement engine")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to the config file (default: caseflow.yaml in cwd, if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available tasks
    Tasks,

    /// Run one task once against the configured case store
    Run {
        /// Task name (see `caseflow tasks`)
        task: String,

        /// Evaluate as if today were this date (YYYY-MM-DD)
        #[arg(long)]
        today: Option<NaiveDate>,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Run one task against cases loaded from a JSON file, without touching a real store
    Simulate {
        /// Task name (see `caseflow tasks`)
        task: String,

        /// JSON file holding an array of cases
        #[arg(long)]
        cases: PathBuf,

        /// Evaluate as if today were this date (YYYY-MM-DD)
        #[arg(long)]
        today: Option<NaiveDate>,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Run all enabled tasks on their schedules until interrupted
    Schedule,

    /// Check the config file for errors
    ValidateConfig,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let config = CaseflowConfig::load(cli.config.as_deref())?;
    let registry = TaskRegistry::with_builtins();

    match cli.command {
        Commands::Tasks => cmd_tasks(&registry),
        Commands::Run {
            task,
            today,
            format,
        } => cmd_run(&config, &registry, &task, today, &format).await,
        Commands::Simulate {
            task,
            cases,
            today,
            format,
        } => cmd_simulate(&config, &registry, &task, cases, today, &format).await,
        Commands::Schedule => cmd_schedule(&config, &registry).await,
        Commands::ValidateConfig => cmd_validate_config(&config, &registry),
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

fn lookup(registry: &TaskRegistry, name: &str) -> Result<Arc<TaskDefinition>> {
    registry
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("Unknown task '{}' (see `caseflow tasks`)", name))
}

/// Build a runner from config around the given store and credentials.
pub fn build_runner(
    config: &CaseflowConfig,
    store: Arc<dyn CaseStore>,
    submitter: Arc<dyn EventSubmitter>,
    credentials: Arc<dyn CredentialProvider>,
) -> Result<TaskRunner> {
    let mut runner = TaskRunner::new(store, submitter, credentials)
        .with_timezone(config.timezone()?)
        .with_timing(config.timing.clone())
        .with_page_size(config.page_size());
    if let Some(n) = config.max_concurrent_submissions {
        runner = runner.with_max_concurrent_submissions(n);
    }
    Ok(runner)
}

fn remote_runner(config: &CaseflowConfig) -> Result<TaskRunner> {
    let url = config
        .store_url()
        .ok_or_else(|| anyhow::anyhow!("No case store URL: set store.base_url or CASEFLOW_STORE_URL"))?;
    let store = Arc::new(HttpCaseStore::new(&url, config.case_type(), config.timeout())?);
    build_runner(config, store.clone(), store, Arc::new(EnvCredentials))
}

/// Midday on `today` in the case time zone, so the local date is unambiguous.
fn as_of(today: Option<NaiveDate>, tz: Tz) -> Result<DateTime<Utc>> {
    match today {
        None => Ok(Utc::now()),
        Some(date) => {
            let midday = date
                .and_hms_opt(12, 0, 0)
                .ok_or_else(|| anyhow::anyhow!("Invalid date {}", date))?;
            tz.from_local_datetime(&midday)
                .single()
                .map(|t| t.with_timezone(&Utc))
                .ok_or_else(|| anyhow::anyhow!("Ambiguous local time for {}", date))
        }
    }
}

fn cmd_tasks(registry: &TaskRegistry) -> Result<()> {
    let tasks = registry.list();

    println!("{:<38} {:<52} DESCRIPTION", "TASK", "EVENT");
    println!("{}", "-".repeat(130));

    for task in &tasks {
        println!("{:<38} {:<52} {}", task.name, task.event_id, task.description);
    }

    println!("\nTotal: {} task(s)", tasks.len());
    Ok(())
}

async fn cmd_run(
    config: &CaseflowConfig,
    registry: &TaskRegistry,
    name: &str,
    today: Option<NaiveDate>,
    format: &str,
) -> Result<()> {
    let task = lookup(registry, name)?;
    let runner = remote_runner(config)?;
    let now = as_of(today, config.timezone()?)?;

    let run = runner.run_at(&task, now).await;
    print_run(&run, format)?;

    if run.status == RunStatus::AbortedOnSearchError {
        anyhow::bail!(
            "Task '{}' aborted: {}",
            name,
            run.abort_reason.unwrap_or_default()
        );
    }
    Ok(())
}

async fn cmd_simulate(
    config: &CaseflowConfig,
    registry: &TaskRegistry,
    name: &str,
    cases_path: PathBuf,
    today: Option<NaiveDate>,
    format: &str,
) -> Result<()> {
    let task = lookup(registry, name)?;

    let contents = std::fs::read_to_string(&cases_path)
        .with_context(|| format!("Failed to read cases file: {}", cases_path.display()))?;
    let cases: Vec<RawCase> = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse cases file: {}", cases_path.display()))?;

    let store = Arc::new(MemoryCaseStore::from_cases(cases).with_task_effects(&registry.list()));
    let runner = build_runner(
        config,
        store.clone(),
        store.clone(),
        Arc::new(StaticCredentials::new("simulated", "simulated")),
    )?;
    let now = as_of(today, config.timezone()?)?;

    let run = runner.run_at(&task, now).await;

    if format == "json" {
        let report = serde_json::json!({
            "run": run,
            "submissions": store.submissions().await,
            "cases": store.all_cases().await,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_run(&run, format)?;

    let submissions = store.submissions().await;
    if !submissions.is_empty() {
        println!("\nSubmissions:");
        for s in &submissions {
            let icon = if s.accepted { "✓" } else { "✗" };
            let mode = if s.snapshot { "snapshot" } else { "case id" };
            println!("  {} {} {} ({})", icon, s.case_id, s.event_id, mode);
        }
    }

    println!("\nCase states:");
    for case in store.all_cases().await {
        println!("  {:<20} {}", case.id, case.state);
    }

    Ok(())
}

fn print_run(run: &TaskRun, format: &str) -> Result<()> {
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }

    println!("Task:      {}", run.task);
    println!("Run ID:    {}", run.run_id);
    println!("Status:    {}", run.status);
    if let Some(ref reason) = run.abort_reason {
        println!("Reason:    {}", reason);
    }
    println!("Matched:   {}", run.matched.len());
    println!("Eligible:  {}", run.eligible.len());
    println!("Succeeded: {}", run.succeeded.len());
    println!("Skipped:   {}", run.skipped.len());
    println!("Failed:    {}", run.failed.len());

    for failure in &run.failed {
        println!("  ✗ {}: {}", failure.case_id, failure.error);
    }
    Ok(())
}

async fn cmd_schedule(config: &CaseflowConfig, registry: &TaskRegistry) -> Result<()> {
    let errors = config.validate(registry);
    if !errors.is_empty() {
        anyhow::bail!("Invalid configuration:\n  - {}", errors.join("\n  - "));
    }

    let tz = config.timezone()?;
    let runner = Arc::new(remote_runner(config)?);
    let mut scheduler = Scheduler::new(runner, tz);

    for (name, expression) in config.enabled_tasks() {
        let task = lookup(registry, name)?;
        scheduler.add(ScheduledTask::new(task, expression)?);
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = tx.send(true);
        }
    });

    scheduler.run(rx).await
}

fn cmd_validate_config(config: &CaseflowConfig, registry: &TaskRegistry) -> Result<()> {
    let errors = config.validate(registry);

    if errors.is_empty() {
        println!("Validation: OK");
        println!("\nScheduled tasks:");
        for (name, expression) in config.enabled_tasks() {
            println!("  {:<38} {}", name, expression);
        }
        return Ok(());
    }

    println!("Validation: FAILED");
    for err in &errors {
        println!("  - {}", err);
    }
    anyhow::bail!("{} validation error(s) found", errors.len())
}
