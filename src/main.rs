use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use stoke::config::TaskFile;
use stoke::error::exit_code;
use stoke::orchestration::{SchedulerEvent, WatchController, WatchEvent, WatchSummary};
use stoke::{slog, slog_error, Result, TaskId};

/// Stoke - task-graph build orchestrator
#[derive(Parser, Debug)]
#[command(name = "stoke")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    STOKE_DEBUG=1   Enable debug logging (alternative to --debug)\n    STOKE_LOG=PATH  Write the log somewhere other than ~/.stoke/stoke.log")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.stoke/stoke.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Task file to use instead of searching for stoke.toml
    #[arg(short = 'f', long, global = true)]
    pub file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run tasks and everything they depend on
    Run {
        /// Tasks to run (defaults to "default")
        tasks: Vec<String>,

        /// Maximum number of actions running at once
        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        /// Keep running the rest of a sequential chain after a step fails
        #[arg(long)]
        continue_on_error: bool,

        /// Start nothing new after the first failure
        #[arg(long, conflicts_with = "continue_on_error")]
        fail_fast: bool,

        /// Default per-task timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Print the report as JSON instead of progress lines
        #[arg(long)]
        json: bool,
    },

    /// Re-run tasks when files matching the [[watch]] bindings change
    Watch {
        /// Debounce window in milliseconds
        #[arg(long)]
        debounce_ms: Option<u64>,
    },

    /// List the tasks in the task file
    List,

    /// Show the order tasks would run in, without running them
    Plan {
        /// Tasks to plan (defaults to "default")
        tasks: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    stoke::log::init(cli.debug);
    slog!("stoke {:?}", cli.command);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            slog_error!("{}", e);
            eprintln!("stoke: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let file = load_task_file(cli.file)?;
    match cli.command {
        Command::Run {
            tasks,
            jobs,
            continue_on_error,
            fail_fast,
            timeout,
            json,
        } => run_tasks(
            &file,
            requested(tasks),
            RunFlags {
                jobs,
                continue_on_error,
                fail_fast,
                timeout,
                json,
            },
        ),
        Command::Watch { debounce_ms } => run_watch(&file, debounce_ms),
        Command::List => run_list(&file),
        Command::Plan { tasks } => run_plan(&file, requested(tasks)),
    }
}

fn load_task_file(path: Option<PathBuf>) -> Result<TaskFile> {
    let path = match path {
        Some(path) => path,
        None => TaskFile::discover(&std::env::current_dir()?)?,
    };
    slog!("task file: {}", path.display());
    TaskFile::load(&path)
}

fn requested(tasks: Vec<String>) -> Vec<TaskId> {
    if tasks.is_empty() {
        vec![TaskId::from("default")]
    } else {
        tasks.into_iter().map(TaskId::from).collect()
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("[%H:%M:%S]").to_string()
}

/// Print scheduler events as progress lines until the channel closes.
async fn print_progress(mut rx: mpsc::UnboundedReceiver<SchedulerEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            SchedulerEvent::TaskStarted { task_id } => {
                println!("{} Starting '{}'...", timestamp(), task_id);
            }
            SchedulerEvent::TaskSucceeded { task_id, elapsed } => {
                println!(
                    "{} Finished '{}' after {}",
                    timestamp(),
                    task_id,
                    format_elapsed(elapsed)
                );
            }
            SchedulerEvent::TaskFailed { task_id, error } => {
                eprintln!("{} '{}' errored: {}", timestamp(), task_id, error);
            }
            SchedulerEvent::TaskSkipped {
                task_id,
                blocked_by,
            } => {
                eprintln!(
                    "{} Skipping '{}' ('{}' failed)",
                    timestamp(),
                    task_id,
                    blocked_by
                );
            }
            SchedulerEvent::AllTasksComplete { .. } => {}
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed < Duration::from_secs(1) {
        format!("{} ms", elapsed.as_millis())
    } else {
        format!("{:.2} s", elapsed.as_secs_f64())
    }
}

struct RunFlags {
    jobs: Option<usize>,
    continue_on_error: bool,
    fail_fast: bool,
    timeout: Option<u64>,
    json: bool,
}

fn run_tasks(file: &TaskFile, ids: Vec<TaskId>, flags: RunFlags) -> Result<i32> {
    let mut orchestrator = file.orchestrator()?;
    let options = orchestrator.options_mut();
    if let Some(jobs) = flags.jobs {
        options.max_parallel = jobs.max(1);
    }
    if flags.continue_on_error {
        options.continue_on_error = true;
    }
    if flags.fail_fast {
        options.fail_fast = true;
    }
    if let Some(secs) = flags.timeout {
        options.default_timeout = Some(Duration::from_secs(secs));
    }

    let json = flags.json;
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    if !json {
        orchestrator = orchestrator.with_events(event_tx);
    }

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async move {
        let printer = (!json).then(|| tokio::spawn(print_progress(event_rx)));
        // The report is printed even when fail_fast aborts the run.
        let result = orchestrator.execute(&ids).await;
        // Closes the event channel so the printer drains and exits.
        drop(orchestrator);
        if let Some(printer) = printer {
            let _ = printer.await;
        }
        result
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!();
        println!("{}", result);
    }
    Ok(result.exit_code())
}

fn run_watch(file: &TaskFile, debounce_ms: Option<u64>) -> Result<i32> {
    let bindings = file.watch_bindings()?;
    let debounce = debounce_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| file.settings.debounce());

    let rt = tokio::runtime::Runtime::new()?;
    let summary: WatchSummary = rt.block_on(async {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (watch_tx, mut watch_rx) = mpsc::unbounded_channel();
        let orchestrator = file.orchestrator()?.with_events(event_tx);
        let printer = tokio::spawn(print_progress(event_rx));

        let mut handle = WatchController::new(orchestrator, &file.base_dir)
            .with_bindings(bindings)
            .with_debounce(debounce)
            .with_events(watch_tx)
            .start()?;
        println!(
            "{} Watching {} (Ctrl-C to stop)",
            timestamp(),
            file.base_dir.display()
        );

        let reporter = tokio::spawn(async move {
            while let Some(event) = watch_rx.recv().await {
                match event {
                    WatchEvent::RunStarted { tasks } => {
                        let names: Vec<&str> = tasks.iter().map(TaskId::as_str).collect();
                        println!("{} Change detected, running {}", timestamp(), names.join(", "));
                    }
                    WatchEvent::RunCompleted { report } => {
                        println!(
                            "{} {} succeeded, {} failed, {} skipped",
                            timestamp(),
                            report.succeeded(),
                            report.failed(),
                            report.skipped()
                        );
                    }
                    WatchEvent::RunFailed { error } => {
                        eprintln!("{} {}", timestamp(), error);
                    }
                    WatchEvent::Stopped => break,
                }
            }
        });

        tokio::signal::ctrl_c().await?;
        println!();
        println!("{} Stopping watch...", timestamp());
        handle.stop();
        let summary = handle.join().await?;
        let _ = reporter.await;
        let _ = printer.await;
        Ok::<_, stoke::Error>(summary)
    })?;

    println!(
        "{} runs ({} with failures)",
        summary.runs, summary.failed_runs
    );
    Ok(exit_code::OK)
}

fn run_list(file: &TaskFile) -> Result<i32> {
    let registry = file.build_registry()?;
    let width = registry
        .iter()
        .map(|t| t.id.as_str().len())
        .max()
        .unwrap_or(0);
    for task in registry.iter() {
        let description = task.description.as_deref().unwrap_or("");
        println!("{:<width$}  {}", task.id.as_str(), description);
        if !task.dependencies.is_empty() {
            let deps: Vec<&str> = task.dependencies.iter().map(TaskId::as_str).collect();
            println!("{:<width$}    {} [{}]", "", deps.join(", "), task.mode);
        }
    }
    Ok(exit_code::OK)
}

fn run_plan(file: &TaskFile, ids: Vec<TaskId>) -> Result<i32> {
    let orchestrator = file.orchestrator()?;
    let plan = orchestrator.plan(&ids)?;
    for (i, task) in plan.tasks().enumerate() {
        let mut waits: Vec<String> = plan
            .waits_on(&task.id)
            .into_iter()
            .map(|(id, kind)| format!("{} ({})", id, kind))
            .collect();
        waits.sort();
        if waits.is_empty() {
            println!("{:>3}. {}", i + 1, task.id);
        } else {
            println!("{:>3}. {}  after {}", i + 1, task.id, waits.join(", "));
        }
    }
    Ok(exit_code::OK)
}
