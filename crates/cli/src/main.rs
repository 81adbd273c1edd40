mod config;
mod http;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use orchestrator::{
    CircuitBreaker, ExecutionState, FileStateStore, StateStore, TaskOrchestrator,
};
use sheetflow_core::{DataFile, PlanStepStatus, Task, TaskResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::config::{
    config_path, sheetflow_dir, states_dir, SheetflowConfig, CONFIG_FILE, SHEETFLOW_DIR,
    STATES_DIR,
};
use crate::http::{HttpReasoningService, HttpSandbox};

#[derive(Parser)]
#[command(name = "sheetflow")]
#[command(about = "Multi-step spreadsheet task orchestration", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration under .sheetflow/
    Init,
    /// Run one task against the configured services
    Run {
        #[arg(short, long)]
        prompt: String,

        /// JSON file holding an array of data files
        #[arg(short, long)]
        data: PathBuf,

        /// Write the task result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the persisted state of a task
    Status { task_id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cwd = std::env::current_dir()?;

    match cli.command {
        Commands::Init => init_project(&cwd).await,
        Commands::Run {
            prompt,
            data,
            output,
        } => run(&cwd, &prompt, &data, output.as_deref()).await,
        Commands::Status { task_id } => status(&cwd, task_id).await,
    }
}

async fn init_project(cwd: &Path) -> Result<()> {
    let dir = sheetflow_dir(cwd);
    let config_path = config_path(cwd);

    if config_path.exists() {
        println!("Project already initialized at {}", dir.display());
        return Ok(());
    }

    println!("Initializing sheetflow in {}", cwd.display());

    tokio::fs::create_dir_all(states_dir(cwd)).await?;
    let content = SheetflowConfig::default().to_toml()?;
    tokio::fs::write(&config_path, content).await?;

    println!();
    println!("Created:");
    println!("  {}/", SHEETFLOW_DIR);
    println!("  ├── {}", CONFIG_FILE);
    println!("  └── {}/", STATES_DIR);
    println!();
    println!("Next steps:");
    println!("  1. Point [reasoning] and [sandbox] at your services");
    println!("  2. Run 'sheetflow run --prompt \"...\" --data files.json'");

    Ok(())
}

async fn run(cwd: &Path, prompt: &str, data: &Path, output: Option<&Path>) -> Result<()> {
    let config = SheetflowConfig::load(cwd)?;
    let files = load_data_files(data).await?;

    tracing::info!(reasoning = %config.reasoning.url, sandbox = %config.sandbox.url, "Services");

    let reasoning = Arc::new(HttpReasoningService::new(
        &config.reasoning,
        config.orchestrator.max_tokens,
    ));
    let sandbox = Arc::new(HttpSandbox::new(&config.sandbox));
    let breaker = Arc::new(CircuitBreaker::new(config.orchestrator.breaker.clone()));
    let store = Arc::new(FileStateStore::new(states_dir(cwd)));

    let orchestrator = TaskOrchestrator::new(config.orchestrator, reasoning, sandbox, breaker)?
        .with_state_store(store);

    orchestrator.subscribe(|task: &Task| {
        println!("{}", progress_line(task));
        Ok(())
    });

    let result = orchestrator
        .execute_task(prompt, files)
        .await
        .context("Task aborted")?;

    report(&result, output).await?;

    if !result.success {
        bail!(
            "Task {} did not succeed{}",
            result.metadata.task_id,
            result
                .error
                .as_ref()
                .map(|e| format!(": [{}] {}", e.code, e.message))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn load_data_files(path: &Path) -> Result<Vec<DataFile>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let files: Vec<DataFile> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not an array of data files", path.display()))?;
    Ok(files)
}

async fn report(result: &TaskResult, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(result)?;

    match output {
        Some(path) => {
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!();
            println!("Result written to {}", path.display());
        }
        None => {
            println!();
            println!("{json}");
        }
    }

    let summary = &result.execution_summary;
    println!();
    println!("Task:     {}", result.metadata.task_id);
    println!("Status:   {}", result.metadata.final_status);
    println!(
        "Steps:    {} ok / {} failed / {} retried",
        summary.successful_steps, summary.failed_steps, summary.retried_steps
    );
    if let Some(quality) = &result.quality_report {
        println!("Quality:  {:.2}", quality.overall_quality);
    }
    println!("Duration: {} ms", summary.total_time_ms);

    Ok(())
}

async fn status(cwd: &Path, task_id: Uuid) -> Result<()> {
    let store = FileStateStore::new(states_dir(cwd));

    let Some(state) = store.load_execution_state(task_id).await? else {
        println!("No saved state for task {}", task_id);
        println!("States are kept in {}", store.dir().display());
        return Ok(());
    };

    println!();
    for line in status_lines(&state) {
        println!("{line}");
    }
    println!();

    Ok(())
}

fn status_lines(state: &ExecutionState) -> Vec<String> {
    let task = &state.task;
    let mut lines = vec![
        format!("Task:    {}", task.id),
        format!("Prompt:  {}", task.context.user_input()),
        format!("Status:  {} ({}%)", task.status, task.progress.percentage),
        format!("Cycle:   {}", state.cycle),
        format!("Saved:   {}", state.saved_at.to_rfc3339()),
    ];

    if let Some(plan) = &state.plan {
        lines.push(String::new());
        lines.push(format!("Plan ({} steps):", plan.steps.len()));
        for step in &plan.steps {
            let icon = match step.status {
                PlanStepStatus::Pending => "○",
                PlanStepStatus::Done => "●",
                PlanStepStatus::Failed => "✗",
            };
            lines.push(format!("  {} {}", icon, step.name));
        }
    }

    if let Some(error) = &task.error {
        lines.push(String::new());
        lines.push(format!("Error:   [{}] {}", error.code, error.message));
    }

    lines
}

fn progress_line(task: &Task) -> String {
    format!(
        "[{:>3}%] {:<10} {}",
        task.progress.percentage,
        task.status.as_str(),
        task.progress.message
    )
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "sheetflow=debug,orchestrator=debug"
    } else {
        "sheetflow=info,orchestrator=info"
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetflow_core::{ExecutionPlan, PlanStep, TaskStatus};

    #[test]
    fn test_progress_line() {
        let mut task = Task::new("sum X", Vec::new(), Uuid::new_v4());
        task.set_status(TaskStatus::Thinking);

        let line = progress_line(&task);
        assert!(line.starts_with("[ 40%] thinking"));
    }

    #[test]
    fn test_status_lines_show_saved_task() {
        let mut task = Task::new("total sales by region", Vec::new(), Uuid::new_v4());
        task.set_status(TaskStatus::Acting);
        let mut done = PlanStep::new("load", "Load the sheets");
        done.status = PlanStepStatus::Done;
        let plan = ExecutionPlan::new(vec![done, PlanStep::new("sum", "Sum by region")]);
        let state = ExecutionState::new(task, Some(plan), 2);

        let lines = status_lines(&state);

        assert_eq!(lines[1], "Prompt:  total sales by region");
        assert!(lines[2].starts_with("Status:  acting"));
        assert_eq!(lines[3], "Cycle:   2");
        assert!(lines.contains(&"Plan (2 steps):".to_string()));
        assert!(lines.contains(&"  ● load".to_string()));
        assert!(lines.contains(&"  ○ sum".to_string()));
        assert!(!lines.iter().any(|l| l.starts_with("Error:")));
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "sheetflow",
            "run",
            "--prompt",
            "sum X",
            "--data",
            "files.json",
            "-v",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                prompt,
                data,
                output,
            } => {
                assert_eq!(prompt, "sum X");
                assert_eq!(data, PathBuf::from("files.json"));
                assert!(output.is_none());
            }
            _ => panic!("expected run"),
        }
    }
}
