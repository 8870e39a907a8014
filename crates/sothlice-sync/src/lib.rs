//! Reconciliation of remote Jira issues into the local ticket store.

pub mod config;
pub mod engine;
pub mod executor;
pub mod export;
pub mod normalize;
pub mod pipeline;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sothlice_source::{FileSource, HttpClientConfig, JiraSource, JiraSourceConfig, RecordSource};
use sothlice_storage::{PgRecordStore, PgStoreConfig, RecordStore};
use tracing::info;

pub use config::{ConfigError, DatabaseUrl, FileConfig, SyncConfig};
pub use engine::{decide, reconcile, PlanSummary, ReconciliationEngine};
pub use executor::{ExecutionReport, RecordOutcome, RecordState, WriteExecutor};
pub use export::{export_csv, write_csv, DEFAULT_EXPORT_FILE, EXPORT_COLUMNS};
pub use normalize::{NormalizationError, NormalizedBatch, RecordNormalizer};
pub use pipeline::{render_brief, write_run_report, RejectedRecord, SyncError, SyncPipeline, SyncRunSummary};

pub const CRATE_NAME: &str = "sothlice-sync";

/// The configured source: a saved search file when `source_file` is set, Jira otherwise.
pub fn source_from_config(config: &SyncConfig) -> anyhow::Result<Box<dyn RecordSource>> {
    if let Some(path) = &config.source_file {
        info!(path = %path.display(), "using file source");
        return Ok(Box::new(FileSource::new(path.clone())));
    }

    let source = JiraSource::new(JiraSourceConfig {
        base_url: config.jira_base_url.clone(),
        credentials: config.jira_credentials.clone(),
        page_size: config.page_size,
        http: HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        },
    })
    .context("building jira client")?;
    info!(url = source.search_url(), "using jira source");
    Ok(Box::new(source))
}

pub async fn connect_store(config: &SyncConfig) -> anyhow::Result<PgRecordStore> {
    info!(database_url = %config.database_url, "connecting to postgres");
    PgRecordStore::connect(&PgStoreConfig::new(config.database_url.expose()))
        .await
        .with_context(|| format!("connecting to {}", config.database_url))
}

pub async fn pipeline_from_config(config: SyncConfig) -> anyhow::Result<SyncPipeline> {
    let source = source_from_config(&config)?;
    let store: Arc<dyn RecordStore> = Arc::new(connect_store(&config).await?);
    Ok(SyncPipeline::new(config, source, store))
}

pub async fn run_sync_once_from_env() -> anyhow::Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = pipeline_from_config(config).await?;
    Ok(pipeline.run_once().await?)
}
