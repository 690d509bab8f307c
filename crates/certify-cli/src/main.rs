//! Certify - agent certification console
//!
//! The `certify` command grades and certifies recorded agent evaluation runs.
//!
//! ## Commands
//!
//! - `import`: Record a run from a JSON document
//! - `list` / `show`: Inspect runs and their grade histories
//! - `review` / `elect`: Add a human review or elect an existing grade
//! - `regrade-step` / `regrade`: Re-grade one step or the whole run
//! - `certify`: Issue a certificate for a passing run

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tracing::{info, warn, Level};

use certify_core::{
    CancellationToken, CertificationGate, Grader, GradingConfig, HttpGradingOracle, OracleMode,
    RegradeOrchestrator, RegradeOutcome, Run, RunId, RunStatus, RunStore, Step, StepId,
};
use certify_state::SurrealRunStore;

#[derive(Parser)]
#[command(name = "certify")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Agent certification console", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a run from a JSON document
    Import {
        /// Path to the run document
        file: PathBuf,

        /// Resolve a running run to pass/fail after import
        #[arg(long)]
        resolve: bool,
    },

    /// List runs, newest first
    List {
        /// Only runs for this agent
        #[arg(long)]
        agent: Option<String>,
    },

    /// Show a run with every step's grade history
    Show {
        run: String,
    },

    /// Add a human review to a graded step and elect it
    Review {
        run: String,

        #[arg(long)]
        step: String,

        /// Score in 0..=100
        #[arg(long)]
        score: u32,

        /// Reviewer note (required)
        #[arg(long)]
        note: String,
    },

    /// Elect an existing grade entry
    Elect {
        run: String,

        #[arg(long)]
        step: String,

        /// Entry index as listed by `show`
        #[arg(long)]
        entry: usize,
    },

    /// Re-grade a single step with the grading oracle
    RegradeStep {
        run: String,

        #[arg(long)]
        step: String,

        #[command(flatten)]
        oracle: OracleArgs,
    },

    /// Re-grade every graded step of a run in order
    Regrade {
        run: String,

        #[command(flatten)]
        oracle: OracleArgs,

        /// Retries after an oracle failure, each resuming at the failed step
        #[arg(long, default_value = "0")]
        retries: u32,

        /// What to do with partial results when the regrade does not complete
        #[arg(long, value_enum, default_value = "discard")]
        on_failure: FailurePolicy,

        /// Pause between oracle calls (overrides CERTIFY_THROTTLE_MS)
        #[arg(long)]
        throttle_ms: Option<u64>,
    },

    /// Issue a certificate for a passing run
    Certify {
        run: String,
    },
}

#[derive(clap::Args)]
struct OracleArgs {
    /// Grading oracle base URL (overrides CERTIFY_ORACLE_URL)
    #[arg(long)]
    oracle_url: Option<String>,

    /// Use blind re-evaluation instead of evaluation
    #[arg(long)]
    blind: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FailurePolicy {
    /// Restore the run to its state before the regrade
    Discard,
    /// Keep the steps that were re-graded
    Keep,
}

/// Run document accepted by `import`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunDocument {
    id: Option<RunId>,
    agent_id: String,
    agent_name: String,
    template_id: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    status: Option<RunStatus>,
    score: Option<u8>,
    pass_threshold: Option<u8>,
    #[serde(default)]
    steps: Vec<Step>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    certify_core::telemetry::init_tracing(cli.json, level);

    let config = GradingConfig::from_env().context("Invalid grading configuration")?;
    let store: Arc<dyn RunStore> = Arc::new(
        SurrealRunStore::from_env()
            .await
            .context("Failed to connect to certification database")?,
    );

    let result = match cli.command {
        Commands::Import { file, resolve } => cmd_import(&store, &config, &file, resolve).await,
        Commands::List { agent } => cmd_list(&store, agent.as_deref()).await,
        Commands::Show { run } => cmd_show(&store, &run).await,
        Commands::Review {
            run,
            step,
            score,
            note,
        } => cmd_review(&store, &run, &step, score, &note).await,
        Commands::Elect { run, step, entry } => cmd_elect(&store, &run, &step, entry).await,
        Commands::RegradeStep { run, step, oracle } => {
            cmd_regrade_step(&store, &config, &run, &step, &oracle).await
        }
        Commands::Regrade {
            run,
            oracle,
            retries,
            on_failure,
            throttle_ms,
        } => {
            let mut config = config;
            if let Some(ms) = throttle_ms {
                config.throttle = Duration::from_millis(ms);
            }
            cmd_regrade(&store, &config, &run, &oracle, retries, on_failure).await
        }
        Commands::Certify { run } => cmd_certify(&store, &run).await,
    };

    certify_core::metrics::METRICS.flush();
    result
}

async fn load_run(store: &Arc<dyn RunStore>, run: &str) -> Result<Run> {
    store
        .get_run(&RunId::from(run))
        .await
        .with_context(|| format!("Failed to load run '{}'", run))
}

fn build_orchestrator(
    store: &Arc<dyn RunStore>,
    config: &GradingConfig,
    args: &OracleArgs,
) -> Result<RegradeOrchestrator> {
    let url = args
        .oracle_url
        .clone()
        .or_else(|| config.oracle_url.clone())
        .context("No grading oracle configured (set --oracle-url or CERTIFY_ORACLE_URL)")?;
    let oracle = HttpGradingOracle::new(url).context("Failed to create oracle client")?;

    let mut regrade = config.regrade();
    if args.blind {
        regrade.mode = OracleMode::Blind;
    }
    Ok(RegradeOrchestrator::new(
        Grader::new(store.clone()),
        Arc::new(oracle),
        regrade,
    ))
}

/// Record a run from a JSON document
async fn cmd_import(
    store: &Arc<dyn RunStore>,
    config: &GradingConfig,
    file: &Path,
    resolve: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let doc: RunDocument = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse run document {}", file.display()))?;

    let run = run_from_document(doc, config, resolve)?;

    store
        .create_run(&run)
        .await
        .context("Failed to record run")?;
    info!(run_id = %run.id, steps = run.steps.len(), "run imported");
    println!("Imported run {} ({}, {} steps)", run.id, run.status, run.steps.len());
    Ok(())
}

/// Build a run from an imported document.
///
/// Histories recorded without any election flag get their fallback entry
/// flagged so every imported step satisfies the exactly-one invariant.
fn run_from_document(doc: RunDocument, config: &GradingConfig, resolve: bool) -> Result<Run> {
    let mut run = Run::new(doc.agent_id, doc.agent_name)
        .with_pass_threshold(doc.pass_threshold.unwrap_or(config.pass_threshold));
    if let Some(id) = doc.id {
        run.id = id;
    }
    if let Some(template) = doc.template_id {
        run = run.with_template(template);
    }
    if let Some(timestamp) = doc.timestamp {
        run.timestamp = timestamp;
    }
    for mut step in doc.steps {
        step.flag_fallback_election();
        step.check_invariants()
            .with_context(|| format!("Step {} is inconsistent", step.id))?;
        run.push_step(step)?;
    }

    match doc.status {
        Some(RunStatus::Running) | None if resolve => {
            run.resolve_verdict()?;
        }
        Some(status) => {
            run.status = status;
            run.score = doc.score.or_else(|| run.average_score());
        }
        None => {}
    }

    Ok(run)
}

/// List runs, newest first
async fn cmd_list(store: &Arc<dyn RunStore>, agent: Option<&str>) -> Result<()> {
    let runs = store.list_runs(agent).await?;
    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    for run in runs {
        let score = display_score(run.score);
        let certified = if run.is_certified() { " [certified]" } else { "" };
        println!(
            "{}  {:<7} {:>3}  {} ({}){}",
            run.id,
            run.status,
            score,
            run.agent_name,
            run.timestamp.format("%Y-%m-%d %H:%M"),
            certified
        );
    }
    Ok(())
}

/// Show a run with every step's grade history
async fn cmd_show(store: &Arc<dyn RunStore>, run_id: &str) -> Result<()> {
    let run = load_run(store, run_id).await?;

    println!("run {}", run.id);
    println!("Agent:  {} ({})", run.agent_name, run.agent_id);
    if let Some(template) = &run.template_id {
        println!("Template: {}", template);
    }
    println!(
        "Status: {}  score {}  threshold {}",
        run.status,
        display_score(run.score),
        run.pass_threshold
    );
    if let Some(cert) = &run.certificate {
        println!(
            "Certificate: {} issued {} (digest {})",
            cert.certificate_id,
            cert.issued_at.format("%Y-%m-%d %H:%M:%S UTC"),
            cert.run_digest.short()
        );
    }
    println!();

    for step in &run.steps {
        println!("[{}] {}: {}", step.id, step.role, step.content);

        let entries = step.entries();
        for index in step.display_order() {
            let entry = &entries[index];
            let marker = if Some(index) == step.elected_index() { "*" } else { " " };
            println!(
                "    {} #{} {:>3} {:<9} {}  {}",
                marker,
                index,
                entry.score(),
                entry.source(),
                entry.created_at().format("%Y-%m-%d %H:%M:%S"),
                entry.reasoning()
            );
        }
    }
    Ok(())
}

/// Add a human review to a graded step and elect it
async fn cmd_review(
    store: &Arc<dyn RunStore>,
    run_id: &str,
    step: &str,
    score: u32,
    note: &str,
) -> Result<()> {
    let mut run = load_run(store, run_id).await?;
    let outcome = Grader::new(store.clone())
        .add_human_review(&mut run, &StepId::from(step), score, note)
        .await?;

    report_outcome(&run, outcome.entry_index, outcome.persisted);
    Ok(())
}

/// Elect an existing grade entry
async fn cmd_elect(store: &Arc<dyn RunStore>, run_id: &str, step: &str, entry: usize) -> Result<()> {
    let mut run = load_run(store, run_id).await?;
    let outcome = Grader::new(store.clone())
        .elect(&mut run, &StepId::from(step), entry)
        .await?;

    report_outcome(&run, outcome.entry_index, outcome.persisted);
    Ok(())
}

/// Re-grade a single step with the grading oracle
async fn cmd_regrade_step(
    store: &Arc<dyn RunStore>,
    config: &GradingConfig,
    run_id: &str,
    step: &str,
    oracle: &OracleArgs,
) -> Result<()> {
    let mut run = load_run(store, run_id).await?;
    let orchestrator = build_orchestrator(store, config, oracle)?;
    let outcome = orchestrator
        .regrade_step(&mut run, &StepId::from(step))
        .await?;

    report_outcome(&run, outcome.entry_index, outcome.persisted);
    Ok(())
}

/// Re-grade every graded step of a run in order
async fn cmd_regrade(
    store: &Arc<dyn RunStore>,
    config: &GradingConfig,
    run_id: &str,
    oracle: &OracleArgs,
    retries: u32,
    on_failure: FailurePolicy,
) -> Result<()> {
    let mut run = load_run(store, run_id).await?;
    let mut orchestrator = build_orchestrator(store, config, oracle)?;

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            interrupt.cancel();
        }
    });

    let mut progress = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        let mut last = None;
        while progress.changed().await.is_ok() {
            let percent = progress.borrow_and_update().percent;
            if last != Some(percent) {
                eprintln!("regrade {:>3}%", percent);
                last = Some(percent);
            }
        }
    });

    let mut outcome = orchestrator.start(&mut run, &token).await?;
    let mut attempts = 0;
    while let RegradeOutcome::Failed(failure) = &outcome {
        if attempts >= retries {
            break;
        }
        attempts += 1;
        warn!(
            step_id = %failure.step_id,
            position = failure.queue_position,
            attempt = attempts,
            "retrying regrade"
        );
        outcome = orchestrator.retry(&mut run, &token).await?;
    }

    let result = match outcome {
        RegradeOutcome::Completed => {
            println!(
                "Regrade complete: {} score {}",
                run.status,
                display_score(run.score)
            );
            Ok(())
        }
        RegradeOutcome::Failed(failure) => {
            settle(&mut orchestrator, &mut run, on_failure).await?;
            Err(anyhow::anyhow!(
                "Regrade failed at step {} (position {}): {}",
                failure.step_id,
                failure.queue_position,
                failure.message
            ))
        }
        RegradeOutcome::Cancelled { position } => {
            settle(&mut orchestrator, &mut run, on_failure).await?;
            Err(anyhow::anyhow!("Regrade cancelled before position {}", position))
        }
    };

    drop(orchestrator);
    printer.await.ok();
    result
}

/// Apply the failure policy to an unfinished regrade.
async fn settle(
    orchestrator: &mut RegradeOrchestrator,
    run: &mut Run,
    policy: FailurePolicy,
) -> Result<()> {
    match policy {
        FailurePolicy::Discard => {
            let discarded = orchestrator.discard(run).await?;
            println!("Discarded regrade; restored {} steps", discarded.restored_steps);
            if !discarded.persisted {
                warn!("some restored steps could not be saved");
            }
        }
        FailurePolicy::Keep => {
            println!("Keeping re-graded steps (score {})", display_score(run.score));
        }
    }
    Ok(())
}

/// Issue a certificate for a passing run
async fn cmd_certify(store: &Arc<dyn RunStore>, run_id: &str) -> Result<()> {
    let mut run = load_run(store, run_id).await?;
    if !certify_core::is_eligible(&run) {
        bail!(
            "Run {} is not eligible for certification (status {}{})",
            run.id,
            run.status,
            if run.is_certified() { ", already certified" } else { "" }
        );
    }

    let certificate = CertificationGate::new(store.clone())
        .issue(&mut run)
        .await
        .context("Certificate issuance failed; the run is still uncertified")?;

    println!("Certificate {}", certificate.certificate_id);
    println!("Agent:  {} ({})", certificate.agent_name, certificate.agent_id);
    println!("Score:  {}", certificate.score);
    println!("Digest: {}", certificate.run_digest);
    Ok(())
}

fn report_outcome(run: &Run, entry_index: usize, persisted: bool) {
    println!(
        "Elected entry #{}; run {} score {}",
        entry_index,
        run.status,
        display_score(run.score)
    );
    if !persisted {
        warn!(run_id = %run.id, "change applied locally but could not be saved");
    }
}

fn display_score(score: Option<u8>) -> String {
    score.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string())
}
