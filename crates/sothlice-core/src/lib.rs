//! Core domain model for sothlice: canonical tickets, snapshots and write decisions.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sothlice-core";

/// Version watermark of a ticket (the remote `updated` timestamp).
pub type Watermark = DateTime<FixedOffset>;

/// Canonical ticket representation shared by the normalizer, engine and stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRecord {
    pub key: String,
    #[serde(rename = "type")]
    pub issue_type: String,
    pub status: String,
    pub summary: String,
    pub description: Option<String>,
    pub created: DateTime<FixedOffset>,
    pub updated: Watermark,
    pub assignee: Option<String>,
    pub processed: DateTime<FixedOffset>,
}

/// Key -> persisted watermark, read once at the start of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<String, Watermark>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, updated: Watermark) {
        self.entries.insert(key.into(), updated);
    }

    pub fn get(&self, key: &str) -> Option<&Watermark> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Watermark)> {
        self.entries.iter()
    }
}

impl<K: Into<String>> FromIterator<(K, Watermark)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (K, Watermark)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Engine mode selected by configuration (`insert` / `update`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    InsertOnly,
    Upsert,
}

impl SyncMode {
    pub fn as_config_str(self) -> &'static str {
        match self {
            SyncMode::InsertOnly => "insert",
            SyncMode::Upsert => "update",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_config_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized sync mode {0:?} (expected `insert` or `update`)")]
pub struct ParseModeError(pub String);

impl FromStr for SyncMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" => Ok(SyncMode::InsertOnly),
            "update" => Ok(SyncMode::Upsert),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Unchanged,
    Stale,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Unchanged => "unchanged",
            SkipReason::Stale => "stale",
        }
    }
}

/// One reconciliation decision per incoming record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    Insert { record: TicketRecord },
    Update { record: TicketRecord },
    Skip { record: TicketRecord, reason: SkipReason },
}

impl WriteOp {
    pub fn record(&self) -> &TicketRecord {
        match self {
            WriteOp::Insert { record } | WriteOp::Update { record } | WriteOp::Skip { record, .. } => {
                record
            }
        }
    }

    pub fn key(&self) -> &str {
        &self.record().key
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::Insert { .. } => "insert",
            WriteOp::Update { .. } => "update",
            WriteOp::Skip { .. } => "skip",
        }
    }
}

/// Why a store write was not applied even though the store itself is healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Insert rejected: the key was created after the snapshot was read.
    DuplicateKey,
    /// Update touched zero rows: the key vanished after the snapshot was read.
    RowMissing,
}

/// Result of a single non-fatal store write. Fatal failures travel as `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    Conflict(ConflictKind),
}

/// Per-run logging/reporting context passed explicitly into each component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}
