mod config;

use clap::{Parser, Subcommand};
use config::StepflowConfig;
use std::path::PathBuf;
use std::sync::Arc;
use stepflow_core::{ApprovalMode, DecisionOption, ResumeCommand, ResumeDecision, StatePatch};
use stepflow_orchestrator::{RunReport, WorkflowEngine};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "stepflow.toml";

#[derive(Parser)]
#[command(name = "stepflow", about = "Stepflow: checkpointed capability orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Checkpoint directory (overrides config)
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Approval mode: all, critical-only or none (overrides config)
    #[arg(long)]
    approval_mode: Option<String>,

    /// Maximum plan iterations per session (overrides config)
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Quality threshold in 0.0..=1.0 (overrides config)
    #[arg(long)]
    threshold: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a session for a query
    Run {
        query: String,
        #[arg(long)]
        session_id: Option<String>,
        /// Approve every interrupt as it is raised
        #[arg(long)]
        auto_approve: bool,
        /// Keep running until the session settles, letting interrupt
        /// timeouts apply their default decision
        #[arg(long)]
        wait: bool,
    },
    /// Resolve the pending interrupt of a session
    Resume {
        session_id: String,
        /// approve, reject or modify (also yes/no)
        #[arg(short, long, default_value = "approve")]
        decision: String,
        /// Interrupt to resolve; defaults to the pending one
        #[arg(long)]
        interrupt_id: Option<String>,
        #[arg(long)]
        reviewer: Option<String>,
        /// JSON state patch applied along with the decision
        #[arg(long)]
        patch: Option<String>,
    },
    /// Show the latest state of a session
    Status { session_id: String },
    /// List checkpoints of a session, or every checkpointed session
    Checkpoints { session_id: Option<String> },
    /// Recover one session, or all, from their latest checkpoints
    Recover { session_id: Option<String> },
    /// List registered capabilities
    Capabilities,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let (path, required) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG), false),
    };
    let mut config = StepflowConfig::load(&path, required).await?;
    apply_overrides(&cli, &mut config)?;

    let engine = WorkflowEngine::builder()
        .config(config.engine.clone())
        .registry(config.registry())
        .analyzer(Arc::new(config.analyzer()))
        .checkpoints(config.checkpoint_store().await?)
        .build()?;

    match cli.command {
        Commands::Run {
            query,
            session_id,
            auto_approve,
            wait,
        } => {
            let mut handle = engine.start(session_id, query).await?;
            info!(session_id = %handle.report.session_id, status = %handle.report.status, "Run returned");

            if auto_approve {
                while let Some(interrupt) = handle.report.interrupt.clone() {
                    info!(interrupt_id = %interrupt.interrupt_id, step_id = %interrupt.step_id, "Auto-approving");
                    let command =
                        ResumeCommand::new(interrupt.interrupt_id, DecisionOption::Approve)
                            .with_reviewer("cli");
                    handle = engine.resume(&handle.report.session_id, command).await?;
                }
            } else if wait {
                handle.settled().await;
                handle.report = engine.get_status(&handle.report.session_id).await?;
            }
            print_report(&handle.report)?;
        }
        Commands::Resume {
            session_id,
            decision,
            interrupt_id,
            reviewer,
            patch,
        } => {
            let interrupt_id = match interrupt_id {
                Some(id) => id,
                None => engine
                    .recover(&session_id)
                    .await?
                    .report
                    .interrupt
                    .map(|i| i.interrupt_id)
                    .ok_or_else(|| anyhow::anyhow!("session {session_id} has no pending interrupt"))?,
            };
            let mut command = ResumeCommand::new(
                interrupt_id,
                ResumeDecision::Raw(serde_json::Value::String(decision)),
            );
            if let Some(reviewer) = reviewer {
                command = command.with_reviewer(reviewer);
            }
            if let Some(raw) = patch {
                let patch: StatePatch = serde_json::from_str(&raw)?;
                command = command.with_patch(patch);
            }
            let handle = engine.resume(&session_id, command).await?;
            print_report(&handle.report)?;
        }
        Commands::Status { session_id } => {
            print_report(&engine.get_status(&session_id).await?)?;
        }
        Commands::Checkpoints { session_id } => {
            let store = engine.checkpoint_store();
            match session_id {
                Some(session_id) => {
                    let ids = store.list(&session_id).await?;
                    if ids.is_empty() {
                        println!("No checkpoints for session {session_id}.");
                    }
                    for id in ids {
                        if let Some(checkpoint) = store.get(&id.session_id, id.seq).await? {
                            println!(
                                "{:>6}  {}  {:<12} iteration {}",
                                checkpoint.seq,
                                checkpoint.timestamp.to_rfc3339(),
                                checkpoint.session_state.status.to_string(),
                                checkpoint.session_state.iteration_count
                            );
                        }
                    }
                }
                None => {
                    let sessions = store.sessions().await?;
                    if sessions.is_empty() {
                        println!("No checkpointed sessions.");
                    }
                    for session_id in sessions {
                        let latest = store.latest_seq(&session_id).await?.unwrap_or(0);
                        println!("{session_id}  latest seq {latest}");
                    }
                }
            }
        }
        Commands::Recover { session_id } => match session_id {
            Some(session_id) => {
                let handle = engine.recover(&session_id).await?;
                print_report(&handle.report)?;
            }
            None => {
                let reports = engine.recover_all().await?;
                info!(count = reports.len(), "Recovered sessions");
                println!("{}", serde_json::to_string_pretty(&reports)?);
            }
        },
        Commands::Capabilities => {
            let registry = engine.registry();
            let mut descriptors = registry.list_descriptors();
            descriptors.sort_by(|a, b| a.name.cmp(&b.name));
            println!("Registered capabilities:");
            for d in &descriptors {
                let critical = if d.critical { " [critical]" } else { "" };
                println!("  {}{critical}: {}", d.name, d.description);
                if !d.depends_on.is_empty() {
                    println!("    depends on: {}", d.depends_on.join(", "));
                }
                if !d.alternatives.is_empty() {
                    println!("    alternatives: {}", d.alternatives.join(", "));
                }
            }
            println!("\nTotal: {} capability(ies)", descriptors.len());
        }
    }

    Ok(())
}

fn apply_overrides(cli: &Cli, config: &mut StepflowConfig) -> anyhow::Result<()> {
    if let Some(dir) = &cli.checkpoint_dir {
        config.checkpoints.dir = dir.clone();
    }
    if let Some(mode) = &cli.approval_mode {
        config.engine.approval_mode = ApprovalMode::parse_mode(mode)
            .ok_or_else(|| anyhow::anyhow!("unknown approval mode '{mode}'"))?;
    }
    if let Some(max) = cli.max_iterations {
        config.engine.max_iterations = max;
    }
    if let Some(threshold) = cli.threshold {
        config.engine.quality_threshold = threshold;
    }
    config.engine.validate()?;
    Ok(())
}

fn print_report(report: &RunReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
