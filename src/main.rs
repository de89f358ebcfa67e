//! planstack - run interdependent plans in dependency order.
//!
//! Usage:
//!   planstack plans                         List plans in the plans directory
//!   planstack create <stack> <plan>...      Create a stack from plans
//!   planstack run <stack> [--from <plan>]   Run a stack
//!   planstack status <stack> [--json]       Show per-plan status

use clap::{Parser, Subcommand};
use planstack::{
    CreateOptions, DirectoryPlanLoader, EngineError, Event, EventBus, EventHandler,
    ExecutionEngine, GlobalConfig, InMemoryStorage, PlanId, PlanStatus, RunOptions, RunReport,
    StackId, StackManager, StackStatus, Storage, StorageConfig, WorkerConfig, YamlLoader,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "planstack.yaml";
const DEFAULT_PLANS_DIR: &str = "plans";
const DEFAULT_DB: &str = "planstack.db";

/// planstack - run interdependent plans in dependency order
#[derive(Parser)]
#[command(name = "planstack")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: ./planstack.yaml when present)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory containing plan files
    #[arg(long, global = true, value_name = "DIR")]
    plans_dir: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true, env = "PLANSTACK_DB", value_name = "FILE")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List plans available in the plans directory
    Plans,

    /// Create a stack from a selection of plans
    Create {
        /// Stack name
        name: String,

        /// Plans to include
        #[arg(required = true, value_name = "PLAN")]
        plans: Vec<String>,

        /// Also include every transitively referenced plan
        #[arg(short = 'r', long)]
        with_references: bool,
    },

    /// Add plans to a stack
    Add {
        /// Stack name
        name: String,

        /// Plans to add
        #[arg(required = true, value_name = "PLAN")]
        plans: Vec<String>,
    },

    /// Remove plans from a stack
    Remove {
        /// Stack name
        name: String,

        /// Plans to remove
        #[arg(required = true, value_name = "PLAN")]
        plans: Vec<String>,
    },

    /// List stacks
    List,

    /// Show a stack's plans in execution order
    Show {
        /// Stack name
        name: String,
    },

    /// Run a stack
    Run {
        /// Stack name
        name: String,

        /// Start the execution order at this plan
        #[arg(long, value_name = "PLAN")]
        from: Option<String>,

        /// Print the execution order without running anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Show per-plan status of a stack
    Status {
        /// Stack name
        name: String,

        /// Print status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Return every plan of a stack to pending
    Reset {
        /// Stack name
        name: String,
    },

    /// Release a stale run lease and fail plans left running
    Unlock {
        /// Stack name
        name: String,
    },

    /// Delete a stack and its status
    Delete {
        /// Stack name
        name: String,
    },
}

/// Logs plan lifecycle events as they happen.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::RunStarted {
                stack_id,
                run_id,
                plan_count,
                ..
            } => {
                info!("Stack '{}' started: {} plan(s) (run: {})", stack_id, plan_count, run_id);
            }
            Event::PlanStarted { plan_id, .. } => {
                info!("  Plan '{}' started", plan_id);
            }
            Event::PlanCompleted {
                plan_id,
                duration,
                stdout,
                stderr,
                ..
            } => {
                info!("  Plan '{}' completed in {:?}", plan_id, duration);
                log_output(stdout.as_deref(), stderr.as_deref());
            }
            Event::PlanFailed {
                plan_id,
                error,
                stdout,
                stderr,
                ..
            } => {
                warn!("  Plan '{}' failed: {}", plan_id, error);
                log_output(stdout.as_deref(), stderr.as_deref());
            }
            Event::PlanSkipped {
                plan_id, reason, ..
            } => {
                warn!("  Plan '{}' skipped: {}", plan_id, reason);
            }
            Event::RunCompleted {
                stack_id,
                success,
                duration,
                ..
            } => {
                if *success {
                    info!("Stack '{}' completed successfully in {:?}", stack_id, duration);
                } else {
                    error!("Stack '{}' finished with failures after {:?}", stack_id, duration);
                }
            }
        }
    }
}

fn log_output(stdout: Option<&str>, stderr: Option<&str>) {
    for line in stdout.map(str::trim).unwrap_or_default().lines() {
        info!("    stdout: {}", line);
    }
    for line in stderr.map(str::trim).unwrap_or_default().lines() {
        warn!("    stderr: {}", line);
    }
}

/// Everything a command needs, resolved from flags and the config file.
struct App {
    loader: Arc<DirectoryPlanLoader>,
    storage: Arc<dyn Storage>,
    worker: WorkerConfig,
}

impl App {
    async fn from_cli(cli: &Cli) -> Result<Self, Box<dyn std::error::Error>> {
        let config = load_config(cli.config.as_deref())?;

        let plans_dir = cli
            .plans_dir
            .clone()
            .or(config.plans_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PLANS_DIR));

        let storage_config = match cli.db {
            Some(ref path) => StorageConfig::Sqlite {
                path: path.to_string_lossy().into_owned(),
            },
            None => config.storage.clone().unwrap_or(StorageConfig::Sqlite {
                path: DEFAULT_DB.to_string(),
            }),
        };

        // Plan content is piped to the worker; by default it runs as a shell script.
        let worker = config.worker.unwrap_or_else(|| WorkerConfig {
            command: "sh".to_string(),
            args: Vec::new(),
            working_dir: None,
            timeout_secs: None,
            environment: Default::default(),
        });

        Ok(Self {
            loader: Arc::new(DirectoryPlanLoader::new(plans_dir)),
            storage: open_storage(&storage_config).await?,
            worker,
        })
    }

    fn manager(&self) -> StackManager {
        StackManager::new(self.storage.clone(), self.loader.clone())
    }

    fn engine(&self) -> ExecutionEngine {
        ExecutionEngine::new(
            self.storage.clone(),
            self.loader.clone(),
            Arc::new(self.worker.build()),
        )
    }
}

fn load_config(path: Option<&Path>) -> Result<GlobalConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(YamlLoader::load_global_config(path)?),
        None if Path::new(DEFAULT_CONFIG).is_file() => {
            Ok(YamlLoader::load_global_config(DEFAULT_CONFIG)?)
        }
        None => Ok(GlobalConfig::default()),
    }
}

async fn open_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>, Box<dyn std::error::Error>> {
    match config {
        StorageConfig::Memory => {
            warn!("Using in-memory storage; nothing will persist after this command");
            Ok(Arc::new(InMemoryStorage::new()))
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            Ok(Arc::new(planstack::SqliteStorage::new(path).await?))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { path } => {
            warn!("Built without sqlite support; ignoring database '{}'", path);
            Ok(Arc::new(InMemoryStorage::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let app = App::from_cli(&cli).await?;

    match cli.command {
        Commands::Plans => list_plans(&app)?,
        Commands::Create {
            name,
            plans,
            with_references,
        } => {
            let options = CreateOptions {
                include_references: with_references,
            };
            let stack = app
                .manager()
                .create_stack(name, &plan_ids(plans), options)
                .await?;
            println!("Created stack '{}' with {} plan(s)", stack.id, stack.len());
            show_stack(&app, &stack.id).await?;
        }
        Commands::Add { name, plans } => {
            let stack = app
                .manager()
                .add_plans(&StackId::new(name), &plan_ids(plans))
                .await?;
            println!("Stack '{}' now has {} plan(s)", stack.id, stack.len());
        }
        Commands::Remove { name, plans } => {
            let stack = app
                .manager()
                .remove_plans(&StackId::new(name), &plan_ids(plans))
                .await?;
            println!("Stack '{}' now has {} plan(s)", stack.id, stack.len());
        }
        Commands::List => list_stacks(&app).await?,
        Commands::Show { name } => show_stack(&app, &StackId::new(name)).await?,
        Commands::Run {
            name,
            from,
            dry_run,
        } => {
            let mut options = RunOptions::new().with_dry_run(dry_run);
            if let Some(from) = from {
                options = options.with_from(from);
            }
            run_stack(&app, StackId::new(name), options).await?;
        }
        Commands::Status { name, json } => {
            let status = app.engine().status(&StackId::new(name)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Commands::Reset { name } => {
            let id = StackId::new(name);
            app.engine().reset(&id).await?;
            println!("Stack '{}' reset; every plan is pending", id);
        }
        Commands::Unlock { name } => {
            let id = StackId::new(name);
            let failed = app.engine().recover(&id).await?;
            println!("Stack '{}' unlocked", id);
            for plan in failed {
                println!("  marked '{}' as failed", plan);
            }
        }
        Commands::Delete { name } => {
            let id = StackId::new(name);
            app.manager().delete_stack(&id).await?;
            println!("Deleted stack '{}'", id);
        }
    }

    Ok(())
}

fn plan_ids(raw: Vec<String>) -> Vec<PlanId> {
    raw.into_iter().map(PlanId::from).collect()
}

/// List plans in the plans directory.
fn list_plans(app: &App) -> Result<(), Box<dyn std::error::Error>> {
    let plans = app.loader.list()?;
    if plans.is_empty() {
        println!("No plans found in {}", app.loader.dir().display());
        return Ok(());
    }

    println!("Plans in {}:", app.loader.dir().display());
    for plan in &plans {
        let title = plan.title.as_deref().map(|t| format!(": {}", t)).unwrap_or_default();
        if plan.references.is_empty() {
            println!("  - {}{}", plan.id, title);
        } else {
            let refs: Vec<&str> = plan.references.iter().map(PlanId::as_str).collect();
            println!("  - {}{} (references: {})", plan.id, title, refs.join(", "));
        }
    }
    Ok(())
}

/// List stacks with plan counts.
async fn list_stacks(app: &App) -> Result<(), Box<dyn std::error::Error>> {
    let stacks = app.manager().list_stacks().await?;
    if stacks.is_empty() {
        println!("No stacks");
        return Ok(());
    }

    for stack in &stacks {
        println!(
            "{}  {} plan(s), created {}",
            stack.id,
            stack.len(),
            format_time(stack.created_at)
        );
    }
    Ok(())
}

/// Print a stack's execution order with dependencies.
async fn show_stack(app: &App, id: &StackId) -> Result<(), Box<dyn std::error::Error>> {
    let stack = app.manager().get_stack(id).await?;
    let graph = stack.graph();

    println!("Stack: {}", stack.id);
    let roots: Vec<&str> = stack.root_ids.iter().map(PlanId::as_str).collect();
    println!("  Roots: {}", roots.join(", "));

    match graph.execution_order() {
        Ok(order) => {
            println!("  Execution order:");
            for (index, plan) in order.iter().enumerate() {
                let deps: Vec<&str> = graph.dependencies(plan).iter().map(PlanId::as_str).collect();
                if deps.is_empty() {
                    println!("    {}. {}", index + 1, plan);
                } else {
                    println!("    {}. {} (depends on: {})", index + 1, plan, deps.join(", "));
                }
            }
        }
        Err(e) => println!("  {}", e),
    }
    Ok(())
}

/// Run a stack, recovering the lease if interrupted.
async fn run_stack(
    app: &App,
    id: StackId,
    options: RunOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(LoggingHandler));
    let engine = app.engine().with_event_bus(event_bus);

    if !options.dry_run {
        info!("Press Ctrl+C to interrupt");
    }

    let result = tokio::select! {
        result = engine.run(&id, options) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, releasing run lease...");
            let failed = engine.recover(&id).await?;
            for plan in &failed {
                warn!("  Plan '{}' marked as failed", plan);
            }
            return Err(format!("run of '{}' was interrupted", id).into());
        }
    };

    match result {
        Ok(report) => {
            print_report(&report);
            if report.success() {
                Ok(())
            } else {
                Err(format!(
                    "stack '{}': {} failed, {} skipped",
                    id,
                    report.failed_count(),
                    report.skipped_count()
                )
                .into())
            }
        }
        Err(EngineError::AlreadyRunning(stack)) => {
            error!(
                "Stack '{}' is already running; use `planstack unlock {}` if that run is gone",
                stack, stack
            );
            Err(EngineError::AlreadyRunning(stack).into())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_report(report: &RunReport) {
    if report.dry_run {
        println!("Execution order for '{}' (dry run):", report.stack_id);
        for (index, plan) in report.order.iter().enumerate() {
            println!("  {}. {}", index + 1, plan);
        }
        return;
    }

    println!("Results for '{}':", report.stack_id);
    for outcome in &report.outcomes {
        let label = if outcome.is_already_completed() {
            "done"
        } else {
            outcome.status.as_str()
        };
        let mut line = format!("  {:<10} {}", label, outcome.id);
        if let Some(duration) = outcome.duration {
            line.push_str(&format!("  {}", format_duration(duration)));
        }
        if let Some(ref error) = outcome.error {
            line.push_str(&format!("  ({})", error));
        }
        println!("{}", line);
    }
    println!(
        "{} completed, {} failed, {} skipped, {} already completed in {}",
        report.completed_count(),
        report.failed_count(),
        report.skipped_count(),
        report.already_completed_count(),
        format_duration(report.duration)
    );
}

fn print_status(status: &StackStatus) {
    println!("Stack: {}", status.stack_id);
    println!(
        "  Running: {}",
        if status.run.is_running { "yes" } else { "no" }
    );
    if let Some(last) = status.run.last_run_at {
        println!("  Last run: {}", format_time(last));
    }

    for (id, record) in &status.plans {
        let mut line = format!("  {:<10} {}", record.status.as_str(), id);
        if let Some(at) = record.last_executed_at
            && record.status != PlanStatus::Pending
        {
            line.push_str(&format!("  at {}", format_time(at)));
        }
        if let Some(duration) = record.duration {
            line.push_str(&format!("  {}", format_duration(duration)));
        }
        if let Some(code) = record.exit_code {
            line.push_str(&format!("  exit {}", code));
        }
        if let Some(ref error) = record.error_message {
            line.push_str(&format!("  ({})", error));
        }
        println!("{}", line);
    }
}

fn format_time(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Local>::from(time)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn format_duration(duration: Duration) -> String {
    format!("{:.1}s", duration.as_secs_f64())
}
