//! CLI command definitions for promptgrid.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::client::MakeImageClient;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::expander::expand_task;
use crate::metrics;
use crate::model::task::{Task, TaskDefinition};
use crate::notify::Notifier;
use crate::orchestrator::Orchestrator;
use crate::pool::{start_autoscaling, WorkerPool};
use crate::retry::RetryPolicy;
use crate::store::{MemoryStore, SubtaskStore, TaskStore};

/// Parametric image-generation grid runner.
#[derive(Parser)]
#[command(name = "promptgrid")]
#[command(about = "Expand variable grids into image-generation subtasks and run them")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Expand a task definition offline and print the resulting grid.
    ///
    /// Reads a task definition JSON file, runs validation and expansion,
    /// and reports the subtask specs without touching the image service.
    Expand(ExpandArgs),

    /// Run a task definition end to end against the image service.
    ///
    /// Expands the task, executes every subtask with autoscaled
    /// concurrency, waits for the terminal status, and prints the result
    /// matrix as JSON.
    Run(RunArgs),
}

/// Arguments for the expand command.
#[derive(Parser, Debug)]
pub struct ExpandArgs {
    /// Path to the task definition JSON file.
    pub task_file: String,

    /// Print the full subtask specs as JSON instead of a summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the task definition JSON file.
    pub task_file: String,

    /// Image service token (also read from MAKE_API_TOKEN).
    #[arg(long, env = "MAKE_API_TOKEN")]
    pub api_token: Option<String>,

    /// Write the result matrix JSON to this file as well as stdout.
    #[arg(short = 'o', long)]
    pub output: Option<String>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before
/// running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Executes the parsed command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Expand(args) => run_expand(args),
        Commands::Run(args) => run_task(args).await,
    }
}

fn load_definition(path: &str) -> anyhow::Result<TaskDefinition> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("could not read task file '{}'", path))?;
    let definition: TaskDefinition = serde_json::from_str(&raw)
        .with_context(|| format!("could not parse task file '{}'", path))?;
    definition.validate().context("task definition is invalid")?;
    Ok(definition)
}

fn run_expand(args: ExpandArgs) -> anyhow::Result<()> {
    let definition = load_definition(&args.task_file)?;
    let task = Task::from_definition(definition);
    let specs = expand_task(&task).context("expansion failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&specs)?);
        return Ok(());
    }

    println!("task: {} (owner: {})", task.name, task.owner);
    println!("expected images: {}", task.total_images);
    println!("subtasks: {}", specs.len());
    for spec in &specs {
        let prompts: Vec<String> = spec
            .prompts
            .iter()
            .map(|prompt| match prompt {
                crate::model::subtask::PromptItem::Freetext { value, .. } => value.clone(),
                other => other.name().unwrap_or_default().to_string(),
            })
            .collect();
        println!(
            "  [{}] ratio={} seed={} polish={} prompts={}",
            spec.coordinate.indexed_key(),
            spec.ratio,
            spec.seed,
            spec.use_polish,
            prompts.join(" | ")
        );
    }
    Ok(())
}

async fn run_task(args: RunArgs) -> anyhow::Result<()> {
    let definition = load_definition(&args.task_file)?;

    let mut config = Config::from_env().or_else(|err| {
        // The CLI flag can stand in for the environment token.
        match &args.api_token {
            Some(token) => Ok(Config::default().with_api_token(token.clone())),
            None => Err(err),
        }
    })?;
    if let Some(token) = args.api_token {
        config = config.with_api_token(token);
    }

    if let Err(err) = metrics::init_metrics() {
        info!(error = %err, "metrics already initialised");
    }

    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(MakeImageClient::new(
        config.api_token.clone(),
        config.submit_timeout,
    ));
    let default_pool = WorkerPool::new("default", config.default_pool.min);
    let lumina_pool = WorkerPool::new("lumina", config.lumina_pool.min);
    let _scalers = start_autoscaling(
        Arc::clone(&default_pool),
        config.default_pool,
        Arc::clone(&lumina_pool),
        config.lumina_pool,
    );

    let dispatcher = Dispatcher::new(
        default_pool,
        lumina_pool,
        Arc::clone(&store) as Arc<dyn TaskStore>,
        Arc::clone(&store) as Arc<dyn SubtaskStore>,
        client,
        RetryPolicy::default(),
        config.poll,
        config.lumina_poll,
    );
    let notifier = Notifier::new(config.notify_webhook_url.clone());
    let orchestrator = Orchestrator::new(
        Arc::clone(&store) as Arc<dyn TaskStore>,
        Arc::clone(&store) as Arc<dyn SubtaskStore>,
        dispatcher,
        notifier,
    )
    .with_retention_days(config.retention_days);

    let task = orchestrator
        .create_task(definition)
        .await
        .context("task was rejected")?;
    info!(task_id = %task.id, total_images = task.total_images, "task running");

    let finished = orchestrator.wait_until_terminal(task.id).await?;
    info!(
        task_id = %finished.id,
        status = %finished.status,
        processed = finished.processed_images,
        "task finished"
    );

    let matrix = orchestrator.matrix(task.id).await?;
    let rendered = serde_json::to_string_pretty(&matrix)?;
    println!("{}", rendered);

    if let Some(path) = args.output {
        std::fs::write(&path, &rendered)
            .with_context(|| format!("could not write matrix to '{}'", path))?;
        info!(path = %path, "matrix written");
    }

    // Give fire-and-forget notifications a moment to flush.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
