//! Fetch -> normalize -> reconcile -> execute, plus scheduling and run reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sothlice_core::{RunContext, SyncMode};
use sothlice_source::{RecordSource, SourceError};
use sothlice_storage::{RecordStore, StoreError};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::engine::{PlanSummary, ReconciliationEngine};
use crate::executor::{ExecutionReport, WriteExecutor};
use crate::normalize::RecordNormalizer;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching records from {source_id} failed")]
    SourceFetch {
        source_id: String,
        #[source]
        source: SourceError,
    },
    #[error("run deadline exceeded while fetching from {0}")]
    FetchDeadline(String),
    #[error("reading snapshot failed; no writes attempted")]
    Snapshot(#[source] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedRecord {
    pub key: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: SyncMode,
    pub source_id: String,
    pub dry_run: bool,
    pub fetched: usize,
    pub normalized: usize,
    pub rejected: Vec<RejectedRecord>,
    pub snapshot_size: usize,
    pub plan: PlanSummary,
    pub execution: Option<ExecutionReport>,
    pub report_path: Option<PathBuf>,
}

impl SyncRunSummary {
    pub fn is_partial(&self) -> bool {
        self.execution.as_ref().is_some_and(ExecutionReport::is_partial)
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn RecordSource>,
    store: Arc<dyn RecordStore>,
    normalizer: RecordNormalizer,
    engine: ReconciliationEngine,
    dry_run: bool,
    write_reports: bool,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, source: Box<dyn RecordSource>, store: Arc<dyn RecordStore>) -> Self {
        let normalizer = RecordNormalizer::new(config.reference_offset);
        let engine = ReconciliationEngine::new(config.mode);
        Self {
            config,
            source,
            store,
            normalizer,
            engine,
            dry_run: false,
            write_reports: true,
            run_lock: Mutex::new(()),
        }
    }

    /// Plan only: the store is read but never written.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_reports(mut self, write_reports: bool) -> Self {
        self.write_reports = write_reports;
        self
    }

    pub fn with_normalizer(mut self, normalizer: RecordNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let ctx = RunContext::new();
        let span = info_span!("sync_run", run_id = %ctx.run_id, mode = %self.engine.mode());
        self.run_with_context(&ctx).instrument(span).await
    }

    /// `None` when another run is still in flight.
    pub async fn run_if_idle(&self) -> Option<Result<SyncRunSummary, SyncError>> {
        let _guard = self.run_lock.try_lock().ok()?;
        Some(self.run_once().await)
    }

    async fn run_with_context(&self, ctx: &RunContext) -> Result<SyncRunSummary, SyncError> {
        let deadline = self.config.run_timeout.map(|d| Instant::now() + d);
        let source_id = self.source.source_id().to_string();
        info!(source = %source_id, dry_run = self.dry_run, "starting sync run");

        let fetch = self.source.fetch(ctx, &self.config.jql);
        let fetched = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fetch)
                .await
                .map_err(|_| SyncError::FetchDeadline(source_id.clone()))?,
            None => fetch.await,
        };
        let raws = fetched.map_err(|source| SyncError::SourceFetch {
            source_id: source_id.clone(),
            source,
        })?;

        let batch = self.normalizer.normalize_batch(ctx, &raws);
        let normalized = batch.records.len();
        let rejected = batch
            .rejected
            .iter()
            .map(|err| RejectedRecord {
                key: err.key().map(ToString::to_string),
                error: err.to_string(),
            })
            .collect();

        let snapshot = self.store.read_snapshot().await.map_err(|err| {
            error!(run_id = %ctx.run_id, error = %err, "snapshot read failed");
            SyncError::Snapshot(err)
        })?;

        let (ops, plan) = self.engine.reconcile(ctx, batch.records, &snapshot);

        let execution = if self.dry_run {
            info!(run_id = %ctx.run_id, planned_writes = plan.writes(), "dry run; skipping writes");
            None
        } else {
            Some(
                WriteExecutor::new(self.store.as_ref())
                    .execute_until(ctx, &ops, deadline)
                    .await,
            )
        };

        let mut summary = SyncRunSummary {
            run_id: ctx.run_id,
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            mode: self.engine.mode(),
            source_id,
            dry_run: self.dry_run,
            fetched: raws.len(),
            normalized,
            rejected,
            snapshot_size: snapshot.len(),
            plan,
            execution,
            report_path: None,
        };

        // Writes are already committed here; a report failure must not hide them.
        if self.write_reports {
            match write_run_report(&self.config.reports_dir, &summary).await {
                Ok(path) => summary.report_path = Some(path),
                Err(err) => error!(
                    run_id = %ctx.run_id,
                    reports_dir = %self.config.reports_dir.display(),
                    error = ?err,
                    "writing run report failed"
                ),
            }
        }

        if let Some(report) = summary.execution.as_ref().filter(|r| r.is_partial()) {
            error!(
                run_id = %ctx.run_id,
                error = report.fatal_error.as_deref().unwrap_or("unknown"),
                not_attempted = report.not_attempted,
                "sync run finished partially"
            );
        } else {
            info!(run_id = %ctx.run_id, "sync run complete");
        }

        Ok(summary)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_if_idle().await {
                    None => warn!("previous sync run still in progress; skipping tick"),
                    Some(Ok(summary)) => info!(
                        run_id = %summary.run_id,
                        partial = summary.is_partial(),
                        "scheduled sync run finished"
                    ),
                    Some(Err(err)) => error!(error = %err, "scheduled sync run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    /// Run on the configured cron schedule until Ctrl-C.
    pub async fn run_scheduled(self: &Arc<Self>) -> anyhow::Result<()> {
        let Some(mut sched) = self.maybe_build_scheduler().await? else {
            bail!("scheduler is disabled; set SOTHLICE_SCHEDULER_ENABLED=1");
        };
        sched.start().await.context("starting scheduler")?;
        info!(cron = %self.config.sync_cron, "scheduler started");

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        sched.shutdown().await.context("stopping scheduler")?;
        info!("scheduler stopped");
        Ok(())
    }
}

/// Writes `<reports_dir>/<run_id>/sync_report.json` and a short markdown brief.
pub async fn write_run_report(reports_dir: &Path, summary: &SyncRunSummary) -> anyhow::Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let report_path = run_dir.join("sync_report.json");
    let json = serde_json::to_vec_pretty(summary).context("serializing sync report")?;
    fs::write(&report_path, json)
        .await
        .with_context(|| format!("writing {}", report_path.display()))?;

    fs::write(run_dir.join("run_brief.md"), render_brief(summary))
        .await
        .context("writing run_brief.md")?;

    Ok(report_path)
}

pub fn render_brief(summary: &SyncRunSummary) -> String {
    let mut lines = vec![
        "# Sothlice Sync Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Mode: {}", summary.mode),
        format!("- Source: {}", summary.source_id),
        format!("- Fetched: {}", summary.fetched),
        format!("- Normalized: {} (rejected {})", summary.normalized, summary.rejected.len()),
        format!(
            "- Plan: {} insert, {} update, {} unchanged, {} stale",
            summary.plan.inserts, summary.plan.updates, summary.plan.unchanged, summary.plan.stale
        ),
    ];

    match &summary.execution {
        None => lines.push("- Execution: dry run".to_string()),
        Some(report) => {
            lines.push(format!(
                "- Applied: {} inserted, {} updated, {} skipped",
                report.inserted,
                report.updated,
                report.skipped()
            ));
            lines.push(format!(
                "- Recovered: {} insert conflicts, {} lost updates",
                report.insert_conflicts, report.lost_updates
            ));
            if let Some(err) = &report.fatal_error {
                lines.push(format!(
                    "- PARTIAL: {err} ({} not attempted)",
                    report.not_attempted
                ));
            }
        }
    }

    if !summary.rejected.is_empty() {
        lines.push(String::new());
        lines.push("## Rejected".to_string());
        for rejected in &summary.rejected {
            lines.push(format!("- {}", rejected.error));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}
