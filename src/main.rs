mod cli;
mod ui;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;

use cli::{Cli, Command};
use statewright::{
    Engine, EngineConfig, InMemoryStore, JobStatus, SubjectRef, TaskLoader, TaskRegistry,
    WorkflowDocument, WorkflowStore, telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    if let Some(workers) = cli.workers {
        config.worker_concurrency = workers.max(1);
    }
    let filter = if cli.verbose { "debug" } else { config.log_filter.as_str() };
    telemetry::init_logging(filter, config.json_logs)?;

    let registry = TaskRegistry::with_builtins();

    match cli.command {
        Command::Check { file } => check(&file, &registry),
        Command::Run { file, subject, to } => run(&file, &subject, &to, &config, registry).await,
        Command::Tasks => list_tasks(&registry),
    }
}

fn check(file: &Path, registry: &TaskRegistry) -> Result<()> {
    let doc = WorkflowDocument::from_path(file)
        .with_context(|| format!("loading {}", file.display()))?;
    doc.validate(registry)?;

    let mut lines = vec![
        format!("initial state: {}", doc.initial.as_deref().unwrap_or("-")),
        format!("states: {}", doc.states.len()),
    ];
    for t in &doc.transitions {
        let tasks = if t.tasks.is_empty() {
            "no tasks".to_string()
        } else {
            t.tasks.join(", ")
        };
        lines.push(format!("{}: {} -> {} ({tasks})", t.name, t.from, t.to));
    }
    ui::print_summary(&format!("workflow {} is valid", doc.name), &lines);
    Ok(())
}

async fn run(
    file: &Path,
    subject: &SubjectRef,
    targets: &[String],
    config: &EngineConfig,
    registry: TaskRegistry,
) -> Result<()> {
    let doc = WorkflowDocument::from_path(file)
        .with_context(|| format!("loading {}", file.display()))?;
    doc.validate(&registry)?;

    let store = Arc::new(InMemoryStore::new());
    let graph = doc.load_into(store.as_ref())?;
    let engine = Engine::builder(store.clone())
        .registry(registry)
        .config(config)
        .build()?;
    let controller = engine.initialize(subject, graph.id)?;
    info!(%subject, graph = %graph.name, "subject initialized");

    for code in targets {
        let current = engine.current_state(subject)?;
        let next = store
            .state_by_code(code)?
            .with_context(|| format!("unknown state `{code}`"))?;

        let handle = engine.change_to(controller.id, next.id)?;
        let progress = ui::TransitionProgress::start(&current, &next);
        let status = handle.wait().await;
        progress.complete(&next, &status);
        if status != JobStatus::Succeeded {
            bail!("transition {current} -> {next} failed: {status}");
        }
    }

    ui::print_history(&engine.history(controller.id)?);
    Ok(())
}

fn list_tasks(registry: &TaskRegistry) -> Result<()> {
    let mut lines = Vec::with_capacity(registry.len());
    for identifier in registry.identifiers() {
        let metadata = registry.load_task(identifier)?.metadata();
        let visibility = if metadata.public { "public" } else { "internal" };
        lines.push(format!(
            "{identifier}  {} [{visibility}] {}",
            metadata.name, metadata.description
        ));
    }
    ui::print_summary("installed tasks", &lines);
    Ok(())
}
