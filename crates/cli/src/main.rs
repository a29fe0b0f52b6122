mod store;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use events::{Event, EventBus, EventEnvelope};
use membreak_core::{AgentKind, EvalTarget, EvalTask};
use orchestrator::{AgentRegistry, Comparison, EvalConfig, EvaluationPipeline};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::store::RunStore;

const CONFIG_FILE: &str = "membreak.toml";

#[derive(Parser)]
#[command(name = "membreak")]
#[command(about = "Memory-break evaluation of AI coding agents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./membreak.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Evaluate agents on the change between two revisions
    Run {
        /// Local git repository
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        #[arg(long)]
        base: String,

        #[arg(long)]
        head: String,

        /// Agents to evaluate (defaults to all)
        #[arg(long, value_delimiter = ',')]
        agents: Vec<String>,

        #[arg(long)]
        label: Option<String>,

        /// Overrides `run_root` from the configuration
        #[arg(long)]
        run_root: Option<PathBuf>,
    },
    /// Recompute and print the comparison of a stored task
    Rank {
        /// Task id; lists stored tasks when omitted
        task_id: Option<Uuid>,

        #[arg(long)]
        run_root: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },
    /// List supported agents
    Agents,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Init { force } => init_config(cli.config.as_deref(), force).await,
        Commands::Run {
            repo,
            base,
            head,
            agents,
            label,
            run_root,
        } => {
            let mut config = load_config(cli.config.as_deref()).await?;
            if let Some(root) = run_root {
                config.run_root = root;
            }
            let mut target = EvalTarget::new(repo, base, head);
            if let Some(label) = label {
                target = target.with_label(label);
            }
            run(config, target, parse_agents(&agents)?).await
        }
        Commands::Rank {
            task_id,
            run_root,
            json,
        } => {
            let config = load_config(cli.config.as_deref()).await?;
            let store = RunStore::new(run_root.unwrap_or(config.run_root));
            rank(&store, task_id, json).await
        }
        Commands::Agents => {
            list_agents();
            Ok(())
        }
    }
}

async fn init_config(path: Option<&Path>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(|| Path::new(CONFIG_FILE));
    if path.exists() && !force {
        println!("Configuration already exists at {}", path.display());
        return Ok(());
    }

    let content = toml::to_string_pretty(&EvalConfig::default())?;
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

async fn load_config(path: Option<&Path>) -> Result<EvalConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None if Path::new(CONFIG_FILE).exists() => PathBuf::from(CONFIG_FILE),
        None => return Ok(EvalConfig::default()),
    };

    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: EvalConfig =
        toml::from_str(&content).with_context(|| format!("Invalid configuration in {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

fn parse_agents(names: &[String]) -> Result<Vec<AgentKind>> {
    if names.is_empty() {
        return Ok(AgentKind::ALL.to_vec());
    }
    names
        .iter()
        .map(|name| {
            AgentKind::parse(name).with_context(|| {
                format!("Unknown agent '{name}' (run `membreak agents` for the list)")
            })
        })
        .collect()
}

async fn run(config: EvalConfig, target: EvalTarget, agents: Vec<AgentKind>) -> Result<()> {
    let store = RunStore::new(&config.run_root);
    let bus = EventBus::new();
    let recorder = record_events(&bus);

    let pipeline = EvaluationPipeline::from_config(config, bus)
        .context("Failed to set up evaluation")?;

    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling running sessions");
            cancel.cancel();
        }
    });

    let task = EvalTask::new(target, agents);
    println!();
    println!("Evaluating {} with {} agent(s)", task.target.display_name(), task.agents.len());
    println!("Task: {}", task.id);
    println!();

    let report = pipeline.run(task).await?;
    let dir = store.save(&report).await?;

    // the recorder stops once the last bus handle is gone
    drop(pipeline);
    match tokio::time::timeout(Duration::from_secs(5), recorder).await {
        Ok(Ok(events)) => store.save_events(report.task.id, &events).await?,
        Ok(Err(e)) => tracing::warn!(error = %e, "Event recorder failed"),
        Err(_) => tracing::warn!("Event recorder did not finish, events not stored"),
    }

    print_comparison(&report.comparison);
    println!("Prompt hash: {}", report.prompt_hash);
    println!("Results:     {}", dir.display());
    Ok(())
}

/// Mirrors bus events into the log and keeps them for the events file.
fn record_events(bus: &EventBus) -> JoinHandle<Vec<EventEnvelope>> {
    let mut rx = bus.subscribe();

    tokio::spawn(async move {
        let mut events = Vec::new();
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    log_event(&envelope.event);
                    events.push(envelope);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event recorder lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
        events
    })
}

fn log_event(event: &Event) {
    match event {
        Event::SessionFinished {
            session,
            outcome,
            phase,
            failure_kind,
            ..
        } => tracing::info!(
            agent = %session.agent,
            attempt = session.attempt,
            outcome = %outcome,
            phase = %phase,
            failure = ?failure_kind,
            "Session finished"
        ),
        Event::CompressionDetected {
            session,
            method,
            iteration,
            ..
        } => tracing::info!(agent = %session.agent, method = %method, iteration, "Compression detected"),
        Event::JudgeScored {
            session,
            overall,
            passed,
            ..
        } => tracing::info!(agent = %session.agent, overall, passed, "Session judged"),
        other => tracing::debug!(kind = other.kind(), "Event"),
    }
}

async fn rank(store: &RunStore, task_id: Option<Uuid>, json: bool) -> Result<()> {
    let Some(task_id) = task_id else {
        let ids = store.task_ids().await?;
        if ids.is_empty() {
            println!("No stored tasks.");
        }
        for id in ids {
            println!("{id}");
        }
        return Ok(());
    };

    let stored = store.load(task_id).await?;
    let comparison = stored.comparison();
    if json {
        println!("{}", serde_json::to_string_pretty(&comparison)?);
        return Ok(());
    }

    println!();
    println!("Task {} ({})", stored.task.id, stored.task.target.display_name());
    print_comparison(&comparison);
    Ok(())
}

fn print_comparison(comparison: &Comparison) {
    println!();
    println!("Ranking");
    println!("════════════════════════════════════════");
    if comparison.ranked.is_empty() {
        println!("  (no scored sessions)");
    }
    for entry in &comparison.ranked {
        let verdict = if entry.passed {
            "PASS".green()
        } else {
            "FAIL".red()
        };
        print!("  {}. {:<8} {:.3} {}", entry.rank, entry.agent.as_str(), entry.overall, verdict);
        if !entry.breaking.is_empty() {
            print!("  breaking: {}", entry.breaking.join(", "));
        }
        println!();
    }

    if !comparison.unscored.is_empty() {
        println!();
        println!("Not scored");
        for entry in &comparison.unscored {
            let kind = entry.failure_kind.map(|k| k.as_str()).unwrap_or("unknown");
            let phase = entry.phase.map(|p| p.as_str()).unwrap_or("-");
            print!("  - {:<8} {} in {}", entry.agent.as_str(), kind.yellow(), phase);
            if let Some(message) = &entry.message {
                print!(": {message}");
            }
            println!();
        }
    }
    println!();
}

fn list_agents() {
    println!();
    for descriptor in AgentRegistry::descriptors() {
        let caps = &descriptor.capabilities;
        let status = if caps.native_status {
            "native context status"
        } else if caps.status_command {
            "status command"
        } else {
            "no context status"
        };
        let name = format!("{:<8}", descriptor.kind.as_str());
        println!("  {} {}", name.bold(), descriptor.display_name);
        println!("           {}", descriptor.description);
        println!("           {status}");
    }
    println!();
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}
