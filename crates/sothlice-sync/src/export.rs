//! CSV dump of the tickets table: a header row of column names, then one row per ticket.

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use sothlice_core::TicketRecord;
use sothlice_storage::RecordStore;
use tokio::fs;
use tracing::info;

pub const DEFAULT_EXPORT_FILE: &str = "db_all.csv";

/// Column names of the `jira` table, in table order.
pub const EXPORT_COLUMNS: [&str; 9] = [
    "jkey",
    "jtype",
    "status",
    "summary",
    "description",
    "created",
    "updated",
    "assignee",
    "processed",
];

/// Writes `records` as CSV. Null description/assignee become empty cells.
pub fn write_csv<W: Write>(records: &[TicketRecord], writer: W) -> anyhow::Result<()> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(EXPORT_COLUMNS).context("writing csv header")?;
    for record in records {
        let created = record.created.to_rfc3339();
        let updated = record.updated.to_rfc3339();
        let processed = record.processed.to_rfc3339();
        out.write_record([
            record.key.as_str(),
            record.issue_type.as_str(),
            record.status.as_str(),
            record.summary.as_str(),
            record.description.as_deref().unwrap_or(""),
            created.as_str(),
            updated.as_str(),
            record.assignee.as_deref().unwrap_or(""),
            processed.as_str(),
        ])
        .with_context(|| format!("writing csv row for {}", record.key))?;
    }
    out.flush().context("flushing csv")?;
    Ok(())
}

/// Reads every stored ticket and writes them to `path`. Returns the row count.
pub async fn export_csv(store: &dyn RecordStore, path: &Path) -> anyhow::Result<usize> {
    let records = store.list_records().await.context("listing tickets for export")?;
    let mut buf = Vec::new();
    write_csv(&records, &mut buf)?;
    fs::write(path, buf)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!(rows = records.len(), path = %path.display(), "exported tickets");
    Ok(records.len())
}
