use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use sothlice_core::{SyncMode, TicketRecord};
use sothlice_storage::RecordStore;
use sothlice_sync::{
    connect_store, export_csv, pipeline_from_config, SyncConfig, SyncRunSummary, DEFAULT_EXPORT_FILE,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "sothlice")]
#[command(about = "Reconcile Jira issues into the local ticket store")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one fetch/reconcile/write pass.
    Sync(SyncArgs),
    /// Run passes on the configured cron schedule until interrupted.
    Schedule(SyncArgs),
    /// Create the tickets table if it is missing.
    InitDb,
    /// Print every stored ticket.
    Show,
    /// Write every stored ticket to a CSV file with a header row.
    Export {
        #[arg(long, default_value = DEFAULT_EXPORT_FILE)]
        output: PathBuf,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// `insert` (new keys only) or `update` (also refresh newer records).
    #[arg(long)]
    mode: Option<SyncMode>,

    /// Read issues from a saved search response instead of Jira.
    #[arg(long)]
    source_file: Option<PathBuf>,

    /// Reconcile and report without writing.
    #[arg(long)]
    dry_run: bool,
}

impl SyncArgs {
    fn apply(&self, config: &mut SyncConfig) {
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(path) = &self.source_file {
            config.source_file = Some(path.clone());
        }
    }
}

fn init_logging(json: bool) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_target(false).with_writer(std::io::stderr).boxed()
    };

    let file_layer = match std::env::var("SOTHLICE_LOG_FILE") {
        Ok(path) if !path.trim().is_empty() => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening log file {path}"))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)).boxed())
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    let (inserted, updated, skipped, conflicts) = summary
        .execution
        .as_ref()
        .map(|r| (r.inserted, r.updated, r.skipped(), r.recovered_conflicts()))
        .unwrap_or_default();
    println!(
        "sync complete: run_id={} mode={} fetched={} rejected={} inserted={} updated={} skipped={} conflicts={} dry_run={}",
        summary.run_id,
        summary.mode,
        summary.fetched,
        summary.rejected.len(),
        inserted,
        updated,
        skipped,
        conflicts,
        summary.dry_run
    );
    if let Some(path) = &summary.report_path {
        println!("report: {}", path.display());
    }
}

fn print_record(index: usize, record: &TicketRecord) {
    println!(
        "row {index}: {} | {} | {} | {} | updated {} | assignee {} | processed {}",
        record.key,
        record.issue_type,
        record.status,
        record.summary,
        record.updated.to_rfc3339(),
        record.assignee.as_deref().unwrap_or("-"),
        record.processed.to_rfc3339()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json)?;

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let mut config = SyncConfig::from_env()?;
            args.apply(&mut config);
            info!(mode = %config.mode, dry_run = args.dry_run, "starting sync run");
            let pipeline = pipeline_from_config(config)
                .await?
                .with_dry_run(args.dry_run);
            let summary = pipeline.run_once().await?;
            print_summary(&summary);
            if let Some(report) = summary.execution.as_ref().filter(|r| r.is_partial()) {
                bail!(
                    "sync run {} stopped early: {} ({} records not attempted)",
                    summary.run_id,
                    report.fatal_error.as_deref().unwrap_or("unknown error"),
                    report.not_attempted
                );
            }
        }
        Commands::Schedule(args) => {
            let mut config = SyncConfig::from_env()?;
            args.apply(&mut config);
            config.scheduler_enabled = true;
            info!(cron = %config.sync_cron, mode = %config.mode, "starting scheduler");
            let pipeline = Arc::new(pipeline_from_config(config).await?.with_dry_run(args.dry_run));
            pipeline.run_scheduled().await?;
        }
        Commands::InitDb => {
            let config = SyncConfig::from_env()?;
            connect_store(&config).await?.ensure_schema().await?;
            println!("tickets table ready");
        }
        Commands::Show => {
            let config = SyncConfig::from_env()?;
            let store = connect_store(&config).await?;
            let records = store.list_records().await?;
            for (index, record) in records.iter().enumerate() {
                print_record(index, record);
            }
            println!("{} tickets", records.len());
        }
        Commands::Export { output } => {
            let config = SyncConfig::from_env()?;
            let store = connect_store(&config).await?;
            let rows = export_csv(&store, &output).await?;
            println!("exported {rows} tickets to {}", output.display());
        }
    }

    Ok(())
}
