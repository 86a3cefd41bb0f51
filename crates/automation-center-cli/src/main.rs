use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use automation_center_domain::{ActorId, RunId, RunSnapshot, StepStatus};
use automation_center_executor::{ExecutorRegistry, MockExecutor};
use automation_center_orchestrator::{Orchestrator, OrchestratorConfig};
use automation_center_policy::{AccessPolicy, OwnerOnlyPolicy, PrivilegedActors};
use automation_center_workflow::load_definition_from_path;
use clap::{Args, Parser, Subcommand};
use tracing::{debug, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "automation-center")]
#[command(about = "Automation run orchestration with a SQLite audit log")]
struct Cli {
    /// Run store database
    #[arg(
        long,
        env = "AUTOMATION_CENTER_DB",
        default_value = "automation_center.sqlite3",
        global = true
    )]
    db: PathBuf,

    /// Enable debug diagnostics
    #[arg(long, default_value_t = false, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a run and wait for it to finish
    Run(RunArgs),
    /// Stop a run
    Stop(StopArgs),
    /// Print a run snapshot as JSON
    Status(RunIdArgs),
    /// List runs as JSON lines
    Runs,
    /// Print a run's log as JSON lines
    Logs(RunIdArgs),
    /// Write a run's log to a JSONL file
    Export(ExportArgs),
    /// Recompute a run's log hash chain
    Verify(RunIdArgs),
    /// Fail runs left open by a previous process
    ///
    /// Every open run in the database is treated as interrupted. Do not use
    /// while another automation-center process is still driving runs against
    /// the same database; its live runs would be failed too.
    Recover,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    definition: PathBuf,
    #[arg(long)]
    owner: String,
    #[arg(long, env = "AUTOMATION_CENTER_STEP_TIMEOUT_MS")]
    step_timeout_ms: Option<u64>,
}

#[derive(Debug, Args)]
struct StopArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    requester: String,
    #[arg(
        long = "privileged-actor",
        env = "AUTOMATION_CENTER_PRIVILEGED",
        value_delimiter = ','
    )]
    privileged_actors: Vec<String>,
}

#[derive(Debug, Args)]
struct RunIdArgs {
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    out: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    debug!(db = %cli.db.display(), "opening run store");

    match cli.command {
        Commands::Run(args) => run_command(&cli.db, args).await,
        Commands::Stop(args) => stop_command(&cli.db, args).await,
        Commands::Status(args) => status_command(&cli.db, &args).await,
        Commands::Runs => runs_command(&cli.db).await,
        Commands::Logs(args) => logs_command(&cli.db, &args).await,
        Commands::Export(args) => export_command(&cli.db, &args).await,
        Commands::Verify(args) => verify_command(&cli.db, &args).await,
        Commands::Recover => recover_command(&cli.db).await,
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("automation_center=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("automation_center=info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn open_orchestrator(
    db: &Path,
    policy: Arc<dyn AccessPolicy>,
    config: OrchestratorConfig,
) -> Result<Orchestrator> {
    let executors = ExecutorRegistry::new().with("mock", Arc::new(MockExecutor::new()))?;
    Orchestrator::open_sqlite(db, executors, policy, config)
        .with_context(|| format!("failed to open run store at {}", db.display()))
}

fn open_default(db: &Path) -> Result<Orchestrator> {
    open_orchestrator(db, Arc::new(OwnerOnlyPolicy), OrchestratorConfig::default())
}

async fn run_command(db: &Path, args: RunArgs) -> Result<()> {
    let envelope = load_definition_from_path(&args.definition)?;
    let config = OrchestratorConfig::default()
        .with_step_timeout(args.step_timeout_ms.map(Duration::from_millis));
    let orchestrator = open_orchestrator(db, Arc::new(OwnerOnlyPolicy), config)?;
    let owner = ActorId::new(args.owner);

    let handle = orchestrator
        .start_run(owner.clone(), envelope.definition.steps)
        .await?;
    let run_id = handle.run_id();
    eprintln!(
        "started run {run_id} for automation '{}' ({})",
        envelope.definition.automation_name, envelope.definition_hash
    );

    let wait = handle.wait();
    tokio::pin!(wait);
    let snapshot = tokio::select! {
        snapshot = &mut wait => snapshot?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            warn!(run_id = %run_id, "interrupt received; stopping run");
            let outcome = orchestrator.stop_run(run_id, owner).await?;
            eprintln!("{}", outcome.message);
            wait.await?
        }
    };

    print_run_summary(&snapshot);
    Ok(())
}

fn print_run_summary(snapshot: &RunSnapshot) {
    println!(
        "run_id={} status={} steps_total={} steps_succeeded={} steps_failed={} steps_cancelled={}",
        snapshot.run.run_id,
        snapshot.run.status,
        snapshot.steps.len(),
        snapshot.count_steps(StepStatus::Succeeded),
        snapshot.count_steps(StepStatus::Failed),
        snapshot.count_steps(StepStatus::Cancelled),
    );
}

#[allow(clippy::needless_pass_by_value)]
async fn stop_command(db: &Path, args: StopArgs) -> Result<()> {
    let run_id = parse_run_id(&args.run_id)?;
    let policy = PrivilegedActors::new(args.privileged_actors.iter().map(ActorId::new));
    let orchestrator = open_orchestrator(db, Arc::new(policy), OrchestratorConfig::default())?;

    let outcome = orchestrator
        .stop_run(run_id, ActorId::new(args.requester.as_str()))
        .await?;
    println!(
        "run_id={} status={} already_finished={} cancelled_steps={} message={}",
        outcome.run_id,
        outcome.status,
        outcome.already_finished,
        outcome.cancelled_steps.len(),
        outcome.message
    );
    Ok(())
}

async fn status_command(db: &Path, args: &RunIdArgs) -> Result<()> {
    let run_id = parse_run_id(&args.run_id)?;
    let snapshot = open_default(db)?.get_run_status(run_id).await?;
    println!("{}", serde_json::to_string(&snapshot)?);
    Ok(())
}

async fn runs_command(db: &Path) -> Result<()> {
    for run in open_default(db)?.list_runs().await? {
        println!("{}", serde_json::to_string(&run)?);
    }
    Ok(())
}

async fn logs_command(db: &Path, args: &RunIdArgs) -> Result<()> {
    let run_id = parse_run_id(&args.run_id)?;
    let mut entries = open_default(db)?.read_logs(run_id).await?;
    while let Some(entry) = entries.next_entry().await? {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

async fn export_command(db: &Path, args: &ExportArgs) -> Result<()> {
    let run_id = parse_run_id(&args.run_id)?;
    let mut entries = open_default(db)?.read_logs(run_id).await?;

    let output = File::create(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let mut writer = BufWriter::new(output);
    let mut entry_count = 0usize;
    while let Some(entry) = entries.next_entry().await? {
        writeln!(writer, "{}", serde_json::to_string(&entry)?)?;
        entry_count += 1;
    }
    writer.flush()?;

    println!(
        "exported {} log entries to {}",
        entry_count,
        args.out.display()
    );
    Ok(())
}

async fn verify_command(db: &Path, args: &RunIdArgs) -> Result<()> {
    let run_id = parse_run_id(&args.run_id)?;
    let report = open_default(db)?.verify_log_chain(run_id).await?;
    match report.first_invalid_counter {
        Some(counter) => println!(
            "run_id={} entries={} chain_valid={} first_invalid_counter={}",
            report.run_id, report.entries, report.chain_valid, counter
        ),
        None => println!(
            "run_id={} entries={} chain_valid={}",
            report.run_id, report.entries, report.chain_valid
        ),
    }
    Ok(())
}

async fn recover_command(db: &Path) -> Result<()> {
    let recovered = open_default(db)?.recover_interrupted().await?;
    println!("recovered={}", recovered.len());
    for run_id in recovered {
        println!("{run_id}");
    }
    Ok(())
}

fn parse_run_id(input: &str) -> Result<RunId> {
    let value = Ulid::from_str(input).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
    Ok(RunId(value))
}
