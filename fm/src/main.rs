//! Foreman - PM-driven multi-agent pipeline orchestrator
//!
//! CLI entry point: creates runs, spawns detached workers, and reads the
//! cross-process gates for status, logs, and abort.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::info;

use foreman::cli::{Cli, Command};
use foreman::config::Config;
use foreman::gates::ProjectDir;
use foreman::persist::{JsonlRepository, Repository};
use foreman::providers::ProviderRegistry;
use foreman::worker::Worker;

fn setup_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()))
        .init();
    Ok(())
}

fn open_repository(config: &Config) -> Arc<JsonlRepository> {
    match &config.storage.data_dir {
        Some(dir) => Arc::new(JsonlRepository::new(dir.clone())),
        None => Arc::new(JsonlRepository::default_location()),
    }
}

/// Build the process-wide registry from the providers config section
fn open_registry(config: &Config) -> &'static ProviderRegistry {
    Box::leak(Box::new(ProviderRegistry::from_config(&config.providers)))
}

/// Spawn the detached worker process for a run
fn spawn_worker(run_id: &str, config_path: Option<&PathBuf>) -> Result<u32> {
    let exe = std::env::current_exe().context("Failed to get current executable")?;

    let mut cmd = std::process::Command::new(&exe);
    cmd.arg("worker").arg(run_id);
    if let Some(path) = config_path {
        cmd.arg("--config").arg(path);
    }
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to spawn worker process")?;

    Ok(child.id())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Run {
            project,
            request,
            foreground,
        } => {
            let repo = open_repository(&config);
            let registry = open_registry(&config);
            let worker = Worker::new(config, Arc::clone(&repo) as Arc<dyn Repository>, registry);
            let run = worker.create_run(&project, &request).await?;
            println!("Created run {}", run.run_id);

            if foreground {
                let outcome = worker.run(&run.run_id).await?;
                println!("Run finished: {} (${:.4} spent)", outcome.status, outcome.running_cost);
            } else {
                let pid = spawn_worker(&run.run_id, cli.config.as_ref())?;
                info!(pid, run_id = %run.run_id, "Worker spawned");
                println!("Worker started with PID {}", pid);
            }
        }

        Command::Worker { run_id } => {
            let repo = open_repository(&config);
            let registry = open_registry(&config);
            let worker = Worker::new(config, repo as Arc<dyn Repository>, registry);
            let outcome = worker.run(&run_id).await?;
            info!(status = %outcome.status, "Worker finished");
        }

        Command::Status { run_id } => {
            let repo = open_repository(&config);
            match repo.get_pipeline_run(&run_id).await? {
                Some(run) => {
                    println!("Run {} [{}]", run.run_id, run.status);
                    println!("  project:   {}", run.project_id);
                    println!("  request:   {}", run.request);
                    println!("  decisions: {}", run.decision_count);
                    println!("  cost:      ${:.4}", run.running_cost);
                    println!("  tasks:");
                    for node in run.graph.tasks() {
                        println!("    {} [{}] {}", node.id, node.status, node.title);
                    }
                    if let Some(error) = &run.error {
                        println!("  error:     {}", error);
                    }
                }
                None => println!("Run {} not found", run_id),
            }
        }

        Command::Logs { project } => {
            let gates = ProjectDir::for_project(&project);
            let (content, _) = gates.live_log().read_from(0)?;
            print!("{}", content);
        }

        Command::Abort { project } => {
            let gates = ProjectDir::for_project(&project);
            gates.ensure()?;
            gates.abort().set()?;
            println!("Abort flag set for project {}", project);

            // Nudge the worker; its own timers also see the flag
            #[cfg(unix)]
            if let Some(pid) = gates.read_pid() {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;
                if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
                    println!("Sent SIGTERM to worker {}", pid);
                }
            }
        }

        Command::Agents => {
            let catalog = foreman::AgentCatalog::load(config.storage.agents_dir.as_deref())?;
            print!("{}", catalog.render_for_prompt());
        }

        Command::Providers { refresh } => {
            for info in open_registry(&config).available_providers(refresh).await {
                let state = if info.available {
                    "available".to_string()
                } else {
                    format!("unavailable: {}", info.reason.unwrap_or_default())
                };
                println!("{} ({}) - {} [{}]", info.name, info.id, state, info.models.join(", "));
            }
        }
    }

    Ok(())
}
