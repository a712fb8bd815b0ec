//! skillgate - operational commands for the skill lifecycle pipeline
//!
//! ## Commands
//!
//! - `register`: Register a skill definition (JSON or TOML) at `prototype`
//! - `approve`: Record an approval checklist for the next transition
//! - `evaluate` / `promote`: Ask the promotion gate, or act on its decision
//! - `rollback` / `retire`: Step a skill back, or retire it for good
//! - `status` / `list` / `history`: Inspect state, metrics and the audit log
//! - `aggregate` / `tick`: Run one aggregator batch, or one monitor and
//!   variation cycle, in the foreground
//!
//! Exit codes: 0 success, 3 invalid transition, 4 approval missing, 5 not
//! ready, 6 registry unavailable, 7 fidelity below threshold, 8 unknown
//! skill, 1 anything else.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use skillgate_core::config::CONFIG_FILE;
use skillgate_core::{
    Decision, LifecycleEvent, Pipeline, PipelineConfig, RegistryRecord, SkillDefinition,
    SkillError, StatusReport, METRICS,
};
use skillgate_state::LifecycleState;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "skillgate")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lifecycle pipeline for versioned agent skills", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: $SKILLGATE_CONFIG, then <data-dir>/skillgate.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(long, global = true, env = "SKILLGATE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// SurrealDB URL for aggregates (overrides the config file)
    #[arg(long, global = true)]
    aggregate_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a skill definition; it always enters at prototype
    Register {
        /// Path to the definition (.toml, otherwise JSON)
        file: PathBuf,

        /// Who is registering it
        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Record an approval for moving a skill from its current state
    Approve {
        skill_id: String,

        /// Target state (staged, production or retired)
        #[arg(long)]
        to: LifecycleState,

        /// Approver identity
        #[arg(long)]
        approver: String,

        /// Checklist entry as name=true|false (repeatable)
        #[arg(long = "check", value_parser = parse_check)]
        checks: Vec<(String, bool)>,

        /// Mark every configured checklist item as passed
        #[arg(long)]
        all_checks: bool,
    },

    /// Show the promotion gate's decision without changing anything
    Evaluate {
        skill_id: String,

        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Promote a skill one step if the gate approves
    Promote {
        skill_id: String,

        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Step a skill back one state (no approval needed)
    Rollback {
        skill_id: String,

        /// Why, recorded in the audit log
        #[arg(long)]
        reason: String,

        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Retire a skill using a recorded retirement approval
    Retire {
        skill_id: String,

        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Current state and last known metrics
    Status {
        skill_id: String,

        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// List registered skills
    List {
        /// Only skills in this state
        #[arg(long)]
        state: Option<LifecycleState>,

        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Lifecycle audit log for a skill
    History {
        skill_id: String,

        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Fold new executions into the aggregate layer now
    Aggregate,

    /// Run one rollback-monitor and variation-manager cycle now
    Tick,

    /// Print the resolved configuration
    Config,
}

fn parse_check(s: &str) -> std::result::Result<(String, bool), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=true|false, got {s:?}"))?;
    let value = value
        .trim()
        .parse::<bool>()
        .map_err(|_| format!("{name}: expected true or false, got {value:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("checklist item name is empty".into());
    }
    Ok((name.to_string(), value))
}

/// Process exit code for a failed command.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<SkillError>()
        .map(SkillError::code)
        .unwrap_or(1)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    skillgate_core::init_tracing(cli.json, level);

    let outcome = run(cli).await;
    METRICS.flush();
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    // A --data-dir given on the command line also decides where the default
    // config file is looked up.
    let discovered = match (&cli.config, &cli.data_dir) {
        (None, Some(dir)) => Some(dir.join(CONFIG_FILE)).filter(|p| p.exists()),
        _ => None,
    };
    let explicit = cli.config.as_deref().or(discovered.as_deref());
    let mut config = PipelineConfig::load(explicit).context("Failed to load configuration")?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(url) = &cli.aggregate_url {
        config.aggregate_url = Some(url.clone());
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    if let Commands::Config = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let pipeline = Pipeline::open(config)
        .await
        .context("Failed to open skillgate stores")?;

    match cli.command {
        Commands::Register { file, actor } => cmd_register(&pipeline, &file, &actor).await,
        Commands::Approve {
            skill_id,
            to,
            approver,
            checks,
            all_checks,
        } => cmd_approve(&pipeline, &skill_id, to, &approver, checks, all_checks).await,
        Commands::Evaluate { skill_id, format } => cmd_evaluate(&pipeline, &skill_id, format).await,
        Commands::Promote { skill_id, actor } => {
            let record = pipeline.ops().promote(&skill_id, &actor).await?;
            println!("{} promoted to {} (v{})", record.skill_id, record.state, record.version);
            Ok(())
        }
        Commands::Rollback {
            skill_id,
            reason,
            actor,
        } => {
            let record = pipeline.ops().rollback(&skill_id, &reason, &actor).await?;
            println!("{} rolled back to {}", record.skill_id, record.state);
            Ok(())
        }
        Commands::Retire { skill_id, actor } => {
            let record = pipeline.ops().retire(&skill_id, &actor).await?;
            println!("{} retired at v{}", record.skill_id, record.version);
            Ok(())
        }
        Commands::Status { skill_id, format } => {
            let status = pipeline.ops().status(&skill_id).await?;
            emit(format, &status, print_status)
        }
        Commands::List { state, format } => {
            let records = pipeline.ops().list(state).await?;
            emit(format, records.as_slice(), print_list)
        }
        Commands::History { skill_id, format } => {
            let events = pipeline.ops().history(&skill_id).await?;
            emit(format, events.as_slice(), print_history)
        }
        Commands::Aggregate => {
            let report = pipeline.aggregator().run_batch().await?;
            println!(
                "Folded {} executions across {} of {} streams",
                report.records_folded, report.streams_advanced, report.streams_scanned
            );
            for (stream, error) in &report.failures {
                println!("  failed {stream}: {error}");
            }
            Ok(())
        }
        Commands::Tick => cmd_tick(&pipeline).await,
        Commands::Config => Ok(()),
    }
}

fn emit<T: Serialize + ?Sized>(format: Format, value: &T, text: fn(&T)) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Format::Text => text(value),
    }
    Ok(())
}

async fn cmd_register(pipeline: &Pipeline, file: &Path, actor: &str) -> Result<()> {
    let skill = SkillDefinition::load(file)
        .and_then(SkillDefinition::into_skill)
        .with_context(|| format!("Failed to load skill definition {}", file.display()))?;
    let record = pipeline.ops().register(&skill, actor).await?;
    println!(
        "Registered {} v{} at {} ({})",
        record.skill_id,
        record.version,
        record.state,
        record.content_digest.short()
    );
    Ok(())
}

async fn cmd_approve(
    pipeline: &Pipeline,
    skill_id: &str,
    to: LifecycleState,
    approver: &str,
    checks: Vec<(String, bool)>,
    all_checks: bool,
) -> Result<()> {
    let mut checklist: BTreeMap<String, bool> = BTreeMap::new();
    if all_checks {
        for name in &pipeline.config().approvals.required_checks {
            checklist.insert(name.clone(), true);
        }
    }
    // Explicit entries win over --all-checks.
    checklist.extend(checks);
    if checklist.is_empty() {
        anyhow::bail!("an approval needs at least one --check or --all-checks");
    }

    let approval = pipeline
        .ops()
        .approve(skill_id, to, approver, checklist)
        .await?;
    println!(
        "Approval {} recorded: {} v{} {} -> {} by {}",
        approval.approval_id,
        approval.skill_id,
        approval.skill_version,
        approval.from_state,
        approval.to_state,
        approval.approver_id
    );
    let failed = approval.failed_checks();
    if !failed.is_empty() {
        println!("  failing items (this approval will not authorize): {}", failed.join(", "));
    }
    Ok(())
}

async fn cmd_evaluate(pipeline: &Pipeline, skill_id: &str, format: Format) -> Result<()> {
    let eval = pipeline.ops().evaluate(skill_id).await?;
    if format == Format::Json {
        println!("{}", serde_json::to_string_pretty(&eval)?);
        return Ok(());
    }
    let target = eval
        .target
        .map(|t| t.to_string())
        .unwrap_or_else(|| "-".into());
    println!("{} v{}: {} -> {}", eval.skill_id, eval.version, eval.from, target);
    match &eval.decision {
        Decision::Approved { approval_id } => println!("  approved (approval {approval_id})"),
        Decision::NotReady { count, required } => {
            println!("  not ready: {count} of {required} executions")
        }
        Decision::BlockedLowFidelity { avg, threshold } => {
            println!("  blocked: fidelity {avg:.3} below {threshold:.3}")
        }
        Decision::BlockedNoApproval { reason } => println!("  blocked: {reason}"),
        Decision::NotPromotable { state } => println!("  no promotion edge from {state}"),
    }
    print_as_of(eval.snapshot.as_of);
    Ok(())
}

async fn cmd_tick(pipeline: &Pipeline) -> Result<()> {
    let monitor = pipeline.monitor().tick().await?;
    println!("Checked {} skills", monitor.checked);
    for action in &monitor.actions {
        println!(
            "  rolled back {} {} -> {}: {}",
            action.skill_id,
            action.from,
            action.to,
            action.breach.reason()
        );
    }

    let variation = pipeline.variation().tick().await?;
    for id in &variation.spawned {
        println!("  spawned candidate {id}");
    }
    for outcome in &variation.concluded {
        println!(
            "  trial {} vs {}: {:?} ({:.3} vs {:.3})",
            outcome.parent_id,
            outcome.leading_candidate,
            outcome.winner,
            outcome.baseline_avg,
            outcome.candidate_avg
        );
    }
    for id in &variation.archived_stale {
        println!("  archived stale candidate {id}");
    }
    for (id, error) in monitor.failures.iter().chain(&variation.failures) {
        println!("  failed {id}: {error}");
    }
    info!(
        rollbacks = monitor.actions.len(),
        spawned = variation.spawned.len(),
        concluded = variation.concluded.len(),
        "tick complete"
    );
    Ok(())
}

fn print_as_of(as_of: Option<chrono::DateTime<chrono::Utc>>) {
    match as_of {
        Some(at) => println!("  metrics as of {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("  metrics: not yet aggregated"),
    }
}

fn print_status(status: &StatusReport) {
    println!("{} v{}", status.skill_id, status.version);
    println!(
        "  state:      {} since {}",
        status.state,
        status.state_since.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let m = &status.metrics;
    println!("  executions: {}", m.execution_count);
    println!(
        "  fidelity:   {:.3} (recent {:.3} over {})",
        m.avg_fidelity, m.recent_avg_fidelity, m.recent_count
    );
    println!("  exceptions: {:.1}%", m.exception_rate * 100.0);
    if let Some(acc) = m.outcome_accuracy {
        println!("  outcomes:   {:.1}% correct", acc * 100.0);
    }
    print_as_of(status.metrics_as_of);
    if status.lagging {
        println!(
            "  lagging: {} executions not yet aggregated",
            status.pending_executions
        );
    }
    if !status.candidates.is_empty() {
        println!("  candidates: {}", status.candidates.join(", "));
    }
}

fn print_list(records: &[RegistryRecord]) {
    if records.is_empty() {
        println!("No skills registered");
        return;
    }
    for r in records {
        let parent = r
            .parent
            .as_ref()
            .map(|p| format!(" (candidate of {}@v{})", p.skill_id, p.version))
            .unwrap_or_default();
        println!("{:<32} v{:<4} {:<10}{}", r.skill_id, r.version, r.state.as_str(), parent);
    }
}

fn print_history(events: &[LifecycleEvent]) {
    if events.is_empty() {
        println!("No lifecycle events");
        return;
    }
    for e in events {
        let from = e.from.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "{} {:?} v{} {} -> {} by {}",
            e.at.to_rfc3339(),
            e.kind,
            e.version,
            from,
            e.to,
            e.actor
        );
        if let Some(reason) = &e.reason {
            println!("    {reason}");
        }
    }
}
